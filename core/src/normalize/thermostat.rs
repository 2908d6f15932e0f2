//! Runtime report of the thermostat cloud API.
//!
//! Each row is `"YYYY-MM-DD,HH:MM:SS,v1,v2,..."` in the thermostat's local
//! clock, one row per 5-minute interval, values in `columns` order.

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::Offset;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::LooseId;
use super::null_as_default;
use crate::error::ParseError;
use crate::model::FlowDirection;
use crate::model::Reading;
use crate::model::ReadingKey;
use crate::model::Series;
use crate::model::SeriesKey;

pub const SERIES_KIND: &str = "THERMOSTAT";
/// Native resolution of the runtime report.
pub const REPORT_INTERVAL_MINUTES: u32 = 5;

const CONTEXT: &str = "thermostat runtime report";

pub const DEFAULT_COLUMNS: &[&str] = &[
    "zoneCoolTemp",
    "zoneHeatTemp",
    "zoneAveTemp",
    "zoneHumidity",
    "outdoorTemp",
    "outdoorHumidity",
    "compCool1",
    "compCool2",
    "compHeat1",
    "compHeat2",
    "auxHeat1",
    "auxHeat2",
    "auxHeat3",
    "fan",
    "humidifier",
    "dehumidifier",
    "economizer",
    "ventilator",
];

const RUNTIME_COLUMNS: &[&str] = &[
    "compCool1",
    "compCool2",
    "compHeat1",
    "compHeat2",
    "auxHeat1",
    "auxHeat2",
    "auxHeat3",
    "fan",
    "humidifier",
    "dehumidifier",
    "economizer",
    "ventilator",
];

/// Unit implied by a report column name.
pub fn column_unit(column: &str) -> &'static str {
    if column.ends_with("Temp") {
        "degF"
    } else if column.contains("Humidity") {
        "%"
    } else if RUNTIME_COLUMNS.contains(&column) {
        "s"
    } else {
        ""
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeReportResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub report_list: Vec<ThermostatReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermostatReport {
    #[serde(default)]
    pub thermostat_identifier: Option<LooseId>,
    /// Some responses repeat the column list per report.
    #[serde(default)]
    pub columns: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub row_list: Vec<ReportRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReportRow {
    Line(String),
    Cells(Vec<String>),
}

impl ReportRow {
    fn cells(&self) -> Vec<&str> {
        match self {
            ReportRow::Line(line) => line.split(',').map(str::trim).collect(),
            ReportRow::Cells(cells) => cells.iter().map(|cell| cell.trim()).collect(),
        }
    }
}

/// Clock the thermostat writes report rows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportClock {
    Fixed(FixedOffset),
    /// Named zone; daylight-saving changes are resolved row by row.
    Zone(Tz),
}

impl Default for ReportClock {
    fn default() -> Self {
        ReportClock::Fixed(Utc.fix())
    }
}

impl ReportClock {
    /// Calendar day of `at` on the thermostat's clock.
    pub fn local_date(self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            ReportClock::Fixed(offset) => at.with_timezone(&offset).date_naive(),
            ReportClock::Zone(zone) => at.with_timezone(&zone).date_naive(),
        }
    }

    /// Instant of a local wall-clock time, `None` inside a spring-forward gap.
    ///
    /// The hour repeated after a fall-back change maps to its earlier
    /// instant until `previous` has reached it, then to the later one.
    fn resolve(
        self,
        local: &NaiveDateTime,
        previous: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let (earliest, latest) = match self {
            ReportClock::Fixed(offset) => {
                let resolved = offset.from_local_datetime(local);
                (
                    resolved.earliest().map(|at| at.with_timezone(&Utc)),
                    resolved.latest().map(|at| at.with_timezone(&Utc)),
                )
            }
            ReportClock::Zone(zone) => {
                let resolved = zone.from_local_datetime(local);
                (
                    resolved.earliest().map(|at| at.with_timezone(&Utc)),
                    resolved.latest().map(|at| at.with_timezone(&Utc)),
                )
            }
        };
        let earliest = earliest?;
        match (latest, previous) {
            (Some(latest), Some(previous)) if previous >= earliest => Some(latest),
            _ => Some(earliest),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermostatNormalizeOptions {
    /// Rows are thinned to one every `store_interval_minutes / 5`.
    pub store_interval_minutes: u32,
    pub clock: ReportClock,
}

impl Default for ThermostatNormalizeOptions {
    fn default() -> Self {
        Self {
            store_interval_minutes: 15,
            clock: ReportClock::default(),
        }
    }
}

impl ThermostatNormalizeOptions {
    fn row_step(&self) -> usize {
        usize::try_from((self.store_interval_minutes / REPORT_INTERVAL_MINUTES).max(1)).unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeBatch {
    pub series: Vec<Series>,
    /// Cells that were present but not numeric.
    pub skipped_cells: usize,
    /// Rows without a usable date and time.
    pub skipped_rows: usize,
    /// Columns that carried at least one non-numeric cell.
    pub non_numeric_columns: BTreeSet<String>,
}

fn parse_row_time(
    date: &str,
    time: &str,
    clock: ReportClock,
    previous: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, String> {
    let local = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
        .map_err(|err| format!("bad row time '{date} {time}': {err}"))?;
    clock
        .resolve(&local, previous)
        .ok_or_else(|| format!("'{date} {time}' does not exist on the thermostat clock"))
}

/// One series per (thermostat, column), named `THERMOSTAT:<id>:<column>`.
///
/// Rows that are too short or carry an unusable time are counted and
/// skipped; the rest of the report still lands.
pub fn normalize_runtime_report(
    response: &RuntimeReportResponse,
    options: &ThermostatNormalizeOptions,
    fallback_thermostat_id: &str,
) -> Result<RuntimeBatch, ParseError> {
    let mut batch = RuntimeBatch::default();
    for report in &response.report_list {
        let thermostat_id = report
            .thermostat_identifier
            .as_ref()
            .map(ToString::to_string)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| fallback_thermostat_id.to_string());
        let columns: Vec<&str> = report
            .columns
            .as_deref()
            .unwrap_or(response.columns.as_str())
            .split(',')
            .map(str::trim)
            .filter(|column| !column.is_empty())
            .collect();
        if columns.is_empty() && !report.row_list.is_empty() {
            return Err(ParseError::new(
                CONTEXT,
                format!("report for {thermostat_id} has rows but no columns"),
            ));
        }
        let mut per_column: Vec<Vec<Reading>> = vec![Vec::new(); columns.len()];
        let mut previous: Option<DateTime<Utc>> = None;

        for row in report.row_list.iter().step_by(options.row_step()) {
            let cells = row.cells();
            let [date, time, values @ ..] = cells.as_slice() else {
                debug!(cells = cells.len(), "runtime row without date and time");
                batch.skipped_rows += 1;
                continue;
            };
            let at = match parse_row_time(date, time, options.clock, previous) {
                Ok(at) => at,
                Err(reason) => {
                    debug!(%reason, "runtime row skipped");
                    batch.skipped_rows += 1;
                    continue;
                }
            };
            previous = Some(at);
            for ((column, readings), cell) in columns.iter().zip(per_column.iter_mut()).zip(values) {
                if cell.is_empty() {
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(value) if value.is_finite() => readings.push(Reading::new(
                        ReadingKey::from_datetime(at),
                        value,
                        column_unit(column),
                    )),
                    _ => {
                        batch.skipped_cells += 1;
                        batch.non_numeric_columns.insert((*column).to_string());
                    }
                }
            }
        }

        for (column, readings) in columns.iter().zip(per_column) {
            if readings.is_empty() {
                continue;
            }
            batch.series.push(Series::with_readings(
                SeriesKey::new(SERIES_KIND, format!("{thermostat_id}:{column}")),
                column_unit(column),
                FlowDirection::Unspecified,
                readings,
            ));
        }
    }
    if batch.skipped_rows > 0 {
        warn!(
            skipped = batch.skipped_rows,
            "runtime rows without a usable date and time skipped"
        );
    }
    if batch.skipped_cells > 0 {
        info!(
            skipped = batch.skipped_cells,
            columns = ?batch.non_numeric_columns,
            "non-numeric runtime cells dropped"
        );
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn options(store_interval_minutes: u32) -> ThermostatNormalizeOptions {
        ThermostatNormalizeOptions {
            store_interval_minutes,
            ..ThermostatNormalizeOptions::default()
        }
    }

    fn report(rows: serde_json::Value) -> RuntimeReportResponse {
        serde_json::from_value(serde_json::json!({
            "columns": "zoneAveTemp,zoneHumidity,fan",
            "reportList": [{"thermostatIdentifier": "5110", "rowList": rows}]
        }))
        .expect("schema")
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, 0).single().expect("valid")
    }

    #[test]
    fn each_column_becomes_its_own_series() {
        let response = report(serde_json::json!([
            "2026-01-05,00:00:00,70.5,41,300",
            "2026-01-05,00:05:00,70.6,,",
        ]));
        let batch = normalize_runtime_report(&response, &options(5), "x").expect("normalize");
        let keys: Vec<String> = batch.series.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "THERMOSTAT:5110:zoneAveTemp",
                "THERMOSTAT:5110:zoneHumidity",
                "THERMOSTAT:5110:fan"
            ]
        );
        assert_eq!(batch.series[0].len(), 2);
        assert_eq!(batch.series[0].unit, "degF");
        assert_eq!(batch.series[1].unit, "%");
        assert_eq!(batch.series[2].unit, "s");
        assert_eq!(batch.series[2].readings()[0].timestamp(), Some(at(0, 0)));
        assert_eq!(batch.skipped_cells, 0);
    }

    #[test]
    fn rows_are_thinned_to_store_interval() {
        let rows: Vec<String> = (0..12)
            .map(|i| format!("2026-01-05,00:{:02}:00,{i},,", i * 5))
            .collect();
        let batch =
            normalize_runtime_report(&report(serde_json::json!(rows)), &options(15), "x").expect("normalize");
        let times: Vec<_> = batch.series[0]
            .readings()
            .iter()
            .filter_map(|r| r.timestamp())
            .collect();
        assert_eq!(times, vec![at(0, 0), at(0, 15), at(0, 30), at(0, 45)]);
    }

    #[test]
    fn non_numeric_cells_are_counted_not_fatal() {
        let response = report(serde_json::json!([
            ["2026-01-05", "00:00:00", "n/a", "40", ""],
        ]));
        let batch = normalize_runtime_report(&response, &options(5), "x").expect("normalize");
        assert_eq!(batch.skipped_cells, 1);
        assert_eq!(batch.series.len(), 1);
        assert_eq!(batch.series[0].key.channel, "5110:zoneHumidity");
    }

    #[test]
    fn local_report_clock_is_shifted_to_utc() {
        let response = report(serde_json::json!(["2026-01-05,00:00:00,70,,"]));
        let opts = ThermostatNormalizeOptions {
            store_interval_minutes: 5,
            clock: ReportClock::Fixed(FixedOffset::west_opt(6 * 3600).expect("offset")),
        };
        let batch = normalize_runtime_report(&response, &opts, "x").expect("normalize");
        assert_eq!(
            batch.series[0].readings()[0].timestamp(),
            Some(at(0, 0) + Duration::hours(6))
        );
    }

    fn chicago(store_interval_minutes: u32) -> ThermostatNormalizeOptions {
        ThermostatNormalizeOptions {
            store_interval_minutes,
            clock: ReportClock::Zone(chrono_tz::America::Chicago),
        }
    }

    fn instants(batch: &RuntimeBatch) -> Vec<DateTime<Utc>> {
        batch.series[0]
            .readings()
            .iter()
            .filter_map(|reading| reading.timestamp())
            .collect()
    }

    fn utc(month: u32, day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, day, h, m, 0).single().expect("valid")
    }

    #[test]
    fn named_zone_follows_spring_daylight_saving_change() {
        let response = report(serde_json::json!([
            "2026-03-07,12:00:00,70,,",
            "2026-03-08,02:30:00,70,,",
            "2026-03-09,12:00:00,71,,",
        ]));
        let batch = normalize_runtime_report(&response, &chicago(5), "x").expect("normalize");
        // Standard time before the change, daylight time after; 02:30 never happened.
        assert_eq!(instants(&batch), vec![utc(3, 7, 18, 0), utc(3, 9, 17, 0)]);
        assert_eq!(batch.skipped_rows, 1);
    }

    #[test]
    fn repeated_fall_back_hour_keeps_distinct_instants() {
        let response = report(serde_json::json!([
            "2026-11-01,00:30:00,70,,",
            "2026-11-01,01:00:00,70,,",
            "2026-11-01,01:30:00,70,,",
            "2026-11-01,01:00:00,69,,",
            "2026-11-01,01:30:00,69,,",
            "2026-11-01,02:00:00,68,,",
        ]));
        let batch = normalize_runtime_report(&response, &chicago(5), "x").expect("normalize");
        assert_eq!(
            instants(&batch),
            vec![
                utc(11, 1, 5, 30),
                utc(11, 1, 6, 0),
                utc(11, 1, 6, 30),
                utc(11, 1, 7, 0),
                utc(11, 1, 7, 30),
                utc(11, 1, 8, 0),
            ]
        );
        assert_eq!(batch.skipped_rows, 0);
    }

    #[test]
    fn malformed_rows_are_skipped_among_good_rows() {
        let response = report(serde_json::json!([
            "2026-01-05,00:00:00,70,40,",
            "2026-01-05",
            "2026-01-05,25:99:00,70,,",
            ["2026-01-05", "00:10:00", "71", "", "hvacMode"],
        ]));
        let batch = normalize_runtime_report(&response, &options(5), "x").expect("normalize");
        assert_eq!(batch.skipped_rows, 2);
        assert_eq!(instants(&batch), vec![at(0, 0), at(0, 10)]);
        assert_eq!(batch.skipped_cells, 1);
        assert_eq!(
            batch.non_numeric_columns.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["fan"]
        );
    }

    #[test]
    fn rows_without_columns_are_a_parse_error() {
        let response: RuntimeReportResponse = serde_json::from_value(serde_json::json!({
            "columns": "",
            "reportList": [{"thermostatIdentifier": "5110", "rowList": ["2026-01-05,00:00:00,1"]}]
        }))
        .expect("schema");
        assert_matches!(
            normalize_runtime_report(&response, &options(5), "x"),
            Err(ParseError { .. })
        );
    }

    #[test]
    fn missing_identifier_uses_fallback_and_empty_report_is_empty() {
        let response: RuntimeReportResponse = serde_json::from_value(serde_json::json!({
            "columns": "outdoorTemp",
            "reportList": [{"rowList": ["2026-01-05,00:00:00,12"]}]
        }))
        .expect("schema");
        let batch = normalize_runtime_report(&response, &options(5), "abc").expect("normalize");
        assert_eq!(batch.series[0].key.to_string(), "THERMOSTAT:abc:outdoorTemp");

        let empty: RuntimeReportResponse =
            serde_json::from_value(serde_json::json!({"reportList": null})).expect("schema");
        assert_eq!(
            normalize_runtime_report(&empty, &options(5), "abc").expect("normalize"),
            RuntimeBatch::default()
        );
    }
}
