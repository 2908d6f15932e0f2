use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ChannelFailure;
use super::UsageSource;
use super::WindowData;
use crate::auth::AccessToken;
use crate::auth::TokenProbe;
use crate::error::FetchError;
use crate::error::ParseError;
use crate::fetch::Fetcher;
use crate::model::Series;
use crate::model::SourceId;
use crate::normalize::LooseId;
use crate::normalize::billing::BillSummary;
use crate::normalize::billing::normalize_billing_history;
use crate::normalize::null_as_default;
use crate::normalize::utility::Industry;
use crate::normalize::utility::ReportInterval;
use crate::normalize::utility::UsagePollResponse;
use crate::normalize::utility::normalize_usage;
use crate::store::write_atomic;
use crate::window::SyncWindow;

const ACCOUNTS_ENDPOINT: &str = "utility accounts";
const POLL_ENDPOINT: &str = "utility usage poll";
const BILLING_ENDPOINT: &str = "utility billing history";
const BILL_PDF_ENDPOINT: &str = "utility bill pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountContext {
    pub account_number: String,
    pub service_location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountEntry {
    account: LooseId,
    #[serde(default, deserialize_with = "null_as_default")]
    service_locations: Vec<LooseId>,
}

/// Billing history fetched once per pass next to interval usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingOptions {
    pub enabled: bool,
    /// Bill documents are saved here when set. Files already present are
    /// not downloaded again.
    pub pdf_dir: Option<PathBuf>,
}

/// Utility-usage portal. One submit/poll report per industry and window.
pub struct UtilityPortalSource {
    fetcher: Fetcher,
    base_url: String,
    username: String,
    industries: Vec<(Industry, ReportInterval)>,
    channel_delay: Duration,
    billing: BillingOptions,
    account: OnceCell<AccountContext>,
}

impl UtilityPortalSource {
    pub fn new(
        fetcher: Fetcher,
        base_url: impl Into<String>,
        username: impl Into<String>,
        industries: Vec<(Industry, ReportInterval)>,
        channel_delay: Duration,
    ) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            industries,
            channel_delay,
            billing: BillingOptions::default(),
            account: OnceCell::new(),
        }
    }

    pub fn with_billing(mut self, billing: BillingOptions) -> Self {
        self.billing = billing;
        self
    }

    pub fn account_context(&self) -> Option<&AccountContext> {
        self.account.get()
    }

    async fn load_account(&self, token: &AccessToken) -> Result<AccountContext, FetchError> {
        let url = format!("{}/services/secured/accounts", self.base_url);
        let accounts: Vec<AccountEntry> = self
            .fetcher
            .execute(ACCOUNTS_ENDPOINT, |client| {
                client
                    .get(&url)
                    .query(&[("user", self.username.as_str())])
                    .bearer_auth(token.secret())
            })
            .await?;
        let first = accounts
            .first()
            .ok_or_else(|| ParseError::new(ACCOUNTS_ENDPOINT, "no accounts on this login"))?;
        let location = first.service_locations.first().ok_or_else(|| {
            ParseError::new(ACCOUNTS_ENDPOINT, "first account has no service location")
        })?;
        let context = AccountContext {
            account_number: first.account.to_string(),
            service_location: location.to_string(),
        };
        debug!(account = %context.account_number, "resolved utility account");
        Ok(context)
    }

    async fn fetch_industry(
        &self,
        token: &AccessToken,
        account: &AccountContext,
        industry: Industry,
        interval: ReportInterval,
        window: &SyncWindow,
    ) -> Result<Vec<Series>, FetchError> {
        let url = format!("{}/services/secured/utility-usage/poll", self.base_url);
        let payload = serde_json::json!({
            "timeFrame": interval.as_str(),
            "userId": self.username,
            "screen": "USAGE_EXPLORER",
            "includeDemand": false,
            "serviceLocationNumber": account.service_location,
            "accountNumber": account.account_number,
            "industries": [industry.as_str()],
            "startDateTime": window.start().timestamp_millis(),
            "endDateTime": window.end().timestamp_millis(),
        });
        let response: UsagePollResponse = self
            .fetcher
            .submit_and_poll(POLL_ENDPOINT, |client| {
                client.post(&url).bearer_auth(token.secret()).json(&payload)
            })
            .await?;
        Ok(normalize_usage(&response)?)
    }

    async fn fetch_billing(
        &self,
        token: &AccessToken,
        account: &AccountContext,
    ) -> Result<Vec<BillSummary>, FetchError> {
        let url = format!("{}/services/secured/billing/history/overview", self.base_url);
        self.fetcher
            .execute(BILLING_ENDPOINT, |client| {
                client
                    .get(&url)
                    .query(&[("acctNbr", account.account_number.as_str())])
                    .bearer_auth(token.secret())
            })
            .await
    }

    /// Saves every viewable bill not yet on disk. Failures are logged and
    /// skipped; returns how many documents were written.
    async fn download_bills(
        &self,
        token: &AccessToken,
        account: &AccountContext,
        bills: &[BillSummary],
        dir: &Path,
    ) -> usize {
        let mut saved = 0;
        let mut requested = false;
        for bill in bills.iter().filter(|bill| bill.show_view_bill_link) {
            let Some(file_name) = bill.pdf_file_name(&account.account_number) else {
                continue;
            };
            let target = dir.join(&file_name);
            if target.exists() {
                continue;
            }
            if requested {
                tokio::time::sleep(self.channel_delay).await;
            }
            requested = true;
            let bytes = match self.download_bill(token, account, bill, &file_name).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(file = %file_name, error = %err, "bill document not downloaded");
                    continue;
                }
            };
            match write_atomic(&target, &bytes) {
                Ok(()) => saved += 1,
                Err(err) => warn!(path = %target.display(), error = %err, "bill document not saved"),
            }
        }
        saved
    }

    async fn download_bill(
        &self,
        token: &AccessToken,
        account: &AccountContext,
        bill: &BillSummary,
        file_name: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/services/secured/billPdfService/{file_name}", self.base_url);
        let bill_account = bill
            .acct_nbr
            .as_ref()
            .map_or_else(|| account.account_number.clone(), ToString::to_string);
        let query = [
            ("account", bill_account),
            (
                "timestamp",
                bill.billing_date_timestamp
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            ("uuid", bill.bill_process_uuid.clone().unwrap_or_default()),
            ("systemOfRecord", bill.system_of_record.clone().unwrap_or_default()),
        ];
        self.fetcher
            .download(BILL_PDF_ENDPOINT, |client| {
                client.get(&url).query(&query).bearer_auth(token.secret())
            })
            .await
    }
}

#[async_trait]
impl TokenProbe for UtilityPortalSource {
    async fn probe(&self, token: &AccessToken) -> Result<(), FetchError> {
        let context = self.load_account(token).await?;
        // Account numbers are stable; keep the first resolution.
        let _ = self.account.set(context);
        Ok(())
    }
}

#[async_trait]
impl UsageSource for UtilityPortalSource {
    fn id(&self) -> SourceId {
        SourceId::Utility
    }

    async fn fetch_window(
        &self,
        token: &AccessToken,
        window: &SyncWindow,
    ) -> Result<WindowData, FetchError> {
        let account = self
            .account
            .get_or_try_init(|| self.load_account(token))
            .await?;

        let mut data = WindowData::default();
        for (index, &(industry, interval)) in self.industries.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.channel_delay).await;
            }
            match self
                .fetch_industry(token, account, industry, interval, window)
                .await
            {
                Ok(series) => data.series.extend(series),
                Err(err) if err.is_auth_rejected() => return Err(err),
                Err(err) => {
                    warn!(%industry, %window, error = %err, "industry skipped");
                    data.skipped_channels.push(ChannelFailure {
                        channel: industry.to_string(),
                        error: err,
                    });
                }
            }
        }

        let all_failed = data.series.is_empty()
            && !data.skipped_channels.is_empty()
            && data.skipped_channels.len() == self.industries.len();
        if all_failed {
            return Err(data.skipped_channels.remove(0).error);
        }
        Ok(data)
    }

    async fn fetch_supplemental(&self, token: &AccessToken) -> Result<Vec<Series>, FetchError> {
        if !self.billing.enabled {
            return Ok(Vec::new());
        }
        let account = self
            .account
            .get_or_try_init(|| self.load_account(token))
            .await?;
        let bills = self.fetch_billing(token, account).await?;
        let batch = normalize_billing_history(&bills, &account.account_number);
        debug!(bills = bills.len(), skipped = batch.skipped, "billing history fetched");
        if let Some(dir) = &self.billing.pdf_dir {
            let saved = self.download_bills(token, account, &bills, dir).await;
            if saved > 0 {
                info!(saved, dir = %dir.display(), "bill documents saved");
            }
        }
        Ok(batch.series.into_iter().collect())
    }
}
