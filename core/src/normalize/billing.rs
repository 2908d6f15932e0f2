//! Billing history overview of the utility portal.
//!
//! One entry per issued bill. Bills are stored as a month-keyed series
//! `BILL:<account>` holding the adjusted amount, so they never move the
//! instant checkpoint.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Datelike;
use chrono::TimeZone;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::LooseId;
use super::null_as_default;
use crate::model::FlowDirection;
use crate::model::Reading;
use crate::model::ReadingKey;
use crate::model::Series;
use crate::model::SeriesKey;

pub const SERIES_KIND: &str = "BILL";
pub const BILL_UNIT: &str = "USD";

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillSummary {
    #[serde(default)]
    pub acct_nbr: Option<LooseId>,
    /// Epoch milliseconds of the billing date.
    #[serde(default)]
    pub billing_date_timestamp: Option<i64>,
    #[serde(default)]
    pub bill_process_uuid: Option<String>,
    #[serde(default)]
    pub system_of_record: Option<String>,
    #[serde(default)]
    pub bill_period: Option<BillPeriod>,
    #[serde(default)]
    pub adjusted_bill_amount: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub show_view_bill_link: bool,
}

/// Month is sent either as a number or as a (possibly abbreviated) name.
#[derive(Debug, Clone, Deserialize)]
pub struct BillPeriod {
    pub year: LooseId,
    pub month: LooseId,
}

impl BillPeriod {
    fn month_key(&self) -> Option<ReadingKey> {
        let year: i32 = self.year.to_string().parse().ok()?;
        let month_text = self.month.to_string().to_ascii_lowercase();
        let month = match month_text.parse::<u32>() {
            Ok(number) => number,
            Err(_) => {
                let prefix = month_text.get(..3)?;
                let index = MONTH_NAMES.iter().position(|name| *name == prefix)?;
                u32::try_from(index).ok()? + 1
            }
        };
        (1..=12).contains(&month).then_some(ReadingKey::Month { year, month })
    }
}

impl BillSummary {
    pub fn billing_date(&self) -> Option<DateTime<Utc>> {
        self.billing_date_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Bill period when present, otherwise the month of the billing date.
    pub fn month_key(&self) -> Option<ReadingKey> {
        self.bill_period
            .as_ref()
            .and_then(BillPeriod::month_key)
            .or_else(|| {
                self.billing_date().map(|date| ReadingKey::Month {
                    year: date.year(),
                    month: date.month(),
                })
            })
    }

    /// `YYYY_MM_D_<account>.pdf`, the name the portal serves the document under.
    pub fn pdf_file_name(&self, account: &str) -> Option<String> {
        let date = self.billing_date()?;
        let account = self
            .acct_nbr
            .as_ref()
            .map(ToString::to_string)
            .filter(|acct| !acct.is_empty())
            .unwrap_or_else(|| account.to_string());
        Some(format!(
            "{}_{:02}_{}_{account}.pdf",
            date.year(),
            date.month(),
            date.day()
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingBatch {
    pub series: Option<Series>,
    /// Bills without a usable month or amount.
    pub skipped: usize,
}

/// Folds the overview into one month-keyed series. A rebilled month keeps
/// the amount of its latest bill.
pub fn normalize_billing_history(bills: &[BillSummary], account: &str) -> BillingBatch {
    let mut ordered: Vec<&BillSummary> = bills.iter().collect();
    ordered.sort_by_key(|bill| bill.billing_date_timestamp.unwrap_or(i64::MIN));

    let mut skipped = 0;
    let mut by_month: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for bill in ordered {
        let amount = bill.adjusted_bill_amount.filter(|amount| amount.is_finite());
        match (bill.month_key(), amount) {
            (Some(ReadingKey::Month { year, month }), Some(amount)) => {
                by_month.insert((year, month), amount);
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "bills without month or amount skipped");
    }
    if by_month.is_empty() {
        return BillingBatch {
            series: None,
            skipped,
        };
    }

    let readings = by_month
        .into_iter()
        .map(|((year, month), amount)| {
            Reading::new(ReadingKey::Month { year, month }, amount, BILL_UNIT)
        })
        .collect();
    BillingBatch {
        series: Some(Series::with_readings(
            SeriesKey::new(SERIES_KIND, account),
            BILL_UNIT,
            FlowDirection::Unspecified,
            readings,
        )),
        skipped,
    }
}
