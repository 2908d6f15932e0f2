//! Usage-explorer report of the utility portal.
//!
//! `data` maps an industry to a list of service blocks. Metered blocks pair
//! `meters[]` with `series[]` by meter number; unmetered blocks (water)
//! carry their own `data[]` points or only a `current` billing-month total.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use super::LooseId;
use super::null_as_default;
use crate::error::ParseError;
use crate::fetch::PollStatus;
use crate::model::FlowDirection;
use crate::model::Reading;
use crate::model::ReadingKey;
use crate::model::Series;
use crate::model::SeriesKey;

const CONTEXT: &str = "utility usage report";
const UNKNOWN_CHANNEL: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Industry {
    Electric,
    Gas,
    Water,
}

impl Industry {
    pub const ALL: [Industry; 3] = [Industry::Electric, Industry::Gas, Industry::Water];

    pub fn as_str(self) -> &'static str {
        match self {
            Industry::Electric => "ELECTRIC",
            Industry::Gas => "GAS",
            Industry::Water => "WATER",
        }
    }

    /// Water is only reported per billing month.
    pub fn default_interval(self) -> ReportInterval {
        match self {
            Industry::Electric | Industry::Gas => ReportInterval::Hourly,
            Industry::Water => ReportInterval::Monthly,
        }
    }

    fn default_unit(self) -> &'static str {
        match self {
            Industry::Water => "GAL",
            Industry::Electric | Industry::Gas => "",
        }
    }
}

impl fmt::Display for Industry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportInterval {
    #[serde(alias = "15_MIN")]
    FifteenMinute,
    Hourly,
    Daily,
    Monthly,
}

impl ReportInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportInterval::FifteenMinute => "FIFTEEN_MINUTE",
            ReportInterval::Hourly => "HOURLY",
            ReportInterval::Daily => "DAILY",
            ReportInterval::Monthly => "MONTHLY",
        }
    }
}

impl FromStr for ReportInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "15_MIN" | "FIFTEEN_MINUTE" => Ok(ReportInterval::FifteenMinute),
            "HOURLY" => Ok(ReportInterval::Hourly),
            "DAILY" => Ok(ReportInterval::Daily),
            "MONTHLY" => Ok(ReportInterval::Monthly),
            other => Err(format!("unknown report interval '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsagePollResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Option<BTreeMap<String, Option<Vec<ServiceBlock>>>>,
}

impl PollStatus for UsagePollResponse {
    fn is_complete(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("COMPLETE"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBlock {
    #[serde(default, deserialize_with = "null_as_default")]
    pub meters: Vec<Meter>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub series: Vec<NamedSeries>,
    #[serde(default)]
    pub unit_of_measure: Option<String>,
    #[serde(default)]
    pub service_location_number: Option<LooseId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<Point>,
    #[serde(default)]
    pub current: Option<CurrentPeriod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    #[serde(default)]
    pub meter_number: Option<LooseId>,
    #[serde(default)]
    pub unit_of_measure: Option<String>,
    #[serde(default)]
    pub flow_direction: Option<FlowDirection>,
    #[serde(default)]
    pub is_net_meter: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedSeries {
    #[serde(default)]
    pub name: Option<LooseId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<Point>,
}

/// `x` is epoch milliseconds, `y` the usage in the series unit.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPeriod {
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub usage: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub units_of_measure: Vec<String>,
}

/// Points without an `x` are dropped; a missing `y` counts as zero usage.
fn point_readings(points: &[Point], unit: &str) -> Vec<Reading> {
    points
        .iter()
        .filter_map(|point| {
            let x = point.x.filter(|x| x.is_finite())?;
            Some(Reading::new(
                ReadingKey::Instant(x as i64),
                point.y.unwrap_or(0.0),
                unit,
            ))
        })
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn metered_series(kind: &str, block: &ServiceBlock, default_unit: &str) -> Vec<Series> {
    let single_pair = block.meters.len() == 1 && block.series.len() == 1;
    block
        .meters
        .iter()
        .map(|meter| {
            let channel = meter
                .meter_number
                .as_ref()
                .or(block.service_location_number.as_ref())
                .map(ToString::to_string)
                .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());
            let points = block
                .series
                .iter()
                .find(|series| series.name.as_ref().is_some_and(|name| name.to_string() == channel))
                .or_else(|| block.series.first().filter(|_| single_pair))
                .map(|series| series.data.as_slice())
                .unwrap_or_default();
            let unit = non_empty(meter.unit_of_measure.as_deref())
                .or(non_empty(block.unit_of_measure.as_deref()))
                .unwrap_or(default_unit);
            let flow_direction = match (meter.flow_direction, meter.is_net_meter) {
                (Some(direction), _) => direction,
                (None, Some(true)) => FlowDirection::Net,
                (None, _) => FlowDirection::Delivered,
            };
            Series::with_readings(
                SeriesKey::new(kind, channel),
                unit,
                flow_direction,
                point_readings(points, unit),
            )
        })
        .collect()
}

fn unmetered_series(kind: &str, block: &ServiceBlock, default_unit: &str) -> Option<Series> {
    let channel = block
        .service_location_number
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());
    let mut unit = non_empty(block.unit_of_measure.as_deref())
        .unwrap_or(default_unit)
        .to_string();
    let mut readings = point_readings(&block.data, &unit);

    if readings.is_empty() {
        // Reduced-granularity record: keyed by billing month, no instant.
        let current = block.current.as_ref()?;
        let (Some(year), Some(month)) = (current.year, current.month) else {
            return None;
        };
        if let Some(current_unit) = non_empty(current.units_of_measure.first().map(String::as_str)) {
            unit = current_unit.to_string();
        }
        readings.push(Reading::new(
            ReadingKey::Month { year, month },
            current.usage.unwrap_or(0.0),
            unit.clone(),
        ));
    }

    Some(Series::with_readings(
        SeriesKey::new(kind, channel),
        unit,
        FlowDirection::Delivered,
        readings,
    ))
}

/// Converts a completed report into one series per meter (or per service
/// location for unmetered industries).
pub fn normalize_usage(response: &UsagePollResponse) -> Result<Vec<Series>, ParseError> {
    let data = response
        .data
        .as_ref()
        .ok_or_else(|| ParseError::new(CONTEXT, "completed report has no `data` object"))?;

    let mut out = Vec::new();
    for (industry_name, blocks) in data {
        let Some(blocks) = blocks else {
            continue;
        };
        let kind = industry_name.trim().to_ascii_uppercase();
        let default_unit = kind
            .parse::<Industry>()
            .map(Industry::default_unit)
            .unwrap_or("");
        for block in blocks {
            if block.meters.is_empty() {
                out.extend(unmetered_series(&kind, block, default_unit));
            } else {
                out.extend(
                    metered_series(&kind, block, default_unit)
                        .into_iter()
                        .filter(|series| !series.is_empty()),
                );
            }
        }
    }
    Ok(out)
}

impl FromStr for Industry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ELECTRIC" => Ok(Industry::Electric),
            "GAS" => Ok(Industry::Gas),
            "WATER" => Ok(Industry::Water),
            other => Err(format!("unknown industry '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn parse(json: serde_json::Value) -> UsagePollResponse {
        serde_json::from_value(json).expect("schema")
    }

    #[test]
    fn pairs_meters_with_series_by_name() {
        let response = parse(serde_json::json!({
            "status": "COMPLETE",
            "data": {
                "ELECTRIC": [{
                    "meters": [
                        {"meterNumber": "M-1", "unitOfMeasure": "KWH", "flowDirection": "DELIVERED"},
                        {"meterNumber": 77, "unitOfMeasure": "KWH", "isNetMeter": true}
                    ],
                    "series": [
                        {"name": "77", "data": [{"x": 3600000, "y": 0.5}]},
                        {"name": "M-1", "data": [{"x": 7200000, "y": 1.25}, {"x": 3600000}, {"y": 9}]}
                    ]
                }]
            }
        }));
        assert!(response.is_complete());

        let series = normalize_usage(&response).expect("normalize");
        assert_eq!(series.len(), 2);
        let m1 = &series[0];
        assert_eq!(m1.key.to_string(), "ELECTRIC:M-1");
        assert_eq!(m1.unit, "KWH");
        // sorted, missing y defaulted, point without x dropped
        let values: Vec<(i64, f64)> = m1
            .readings()
            .iter()
            .map(|r| (r.key.timestamp_millis().unwrap_or_default(), r.value))
            .collect();
        assert_eq!(values, vec![(3_600_000, 0.0), (7_200_000, 1.25)]);

        assert_eq!(series[1].key.to_string(), "ELECTRIC:77");
        assert_eq!(series[1].flow_direction, FlowDirection::Net);
    }

    #[test]
    fn water_without_points_becomes_month_keyed_reading() {
        let response = parse(serde_json::json!({
            "status": "COMPLETE",
            "data": {
                "WATER": [{
                    "serviceLocationNumber": 501234,
                    "current": {"month": 2, "year": 2026, "usage": 3400, "unitsOfMeasure": ["CGAL"]}
                }],
                "GAS": null
            }
        }));
        let series = normalize_usage(&response).expect("normalize");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].key.to_string(), "WATER:501234");
        assert_eq!(series[0].unit, "CGAL");
        assert_eq!(
            series[0].readings()[0].key,
            ReadingKey::Month {
                year: 2026,
                month: 2
            }
        );
        assert_eq!(series[0].readings()[0].value, 3400.0);
    }

    #[test]
    fn water_points_take_precedence_and_default_to_gallons() {
        let response = parse(serde_json::json!({
            "status": "COMPLETE",
            "data": {"WATER": [{
                "data": [{"x": 1000, "y": 12}],
                "current": {"month": 2, "year": 2026, "usage": 3400}
            }]}
        }));
        let series = normalize_usage(&response).expect("normalize");
        assert_eq!(series[0].key.to_string(), "WATER:UNKNOWN");
        assert_eq!(series[0].unit, "GAL");
        assert_eq!(series[0].len(), 1);
        assert_eq!(series[0].readings()[0].key, ReadingKey::Instant(1000));
    }

    #[test]
    fn current_period_without_month_is_dropped() {
        let response = parse(serde_json::json!({
            "status": "COMPLETE",
            "data": {"WATER": [{"current": {"year": 2026, "usage": 10}}]}
        }));
        assert!(normalize_usage(&response).expect("normalize").is_empty());
    }

    #[test]
    fn completed_report_without_data_is_a_parse_error() {
        let response = parse(serde_json::json!({"status": "COMPLETE"}));
        assert_matches!(normalize_usage(&response), Err(ParseError { .. }));
    }

    #[test]
    fn normalization_is_deterministic() {
        let payload = serde_json::json!({
            "status": "COMPLETE",
            "data": {
                "GAS": [{"meters": [{"meterNumber": "G"}], "series": [{"name": "G", "data": [{"x": 5, "y": 1}]}]}],
                "ELECTRIC": [{"meters": [{"meterNumber": "E"}], "series": [{"name": "E", "data": [{"x": 5, "y": 2}]}]}]
            }
        });
        let first = normalize_usage(&parse(payload.clone())).expect("normalize");
        let second = normalize_usage(&parse(payload)).expect("normalize");
        assert_eq!(first, second);
        assert_eq!(first[0].key.kind, "ELECTRIC");
    }

    #[test]
    fn interval_accepts_short_alias() {
        assert_eq!("15_MIN".parse::<ReportInterval>(), Ok(ReportInterval::FifteenMinute));
        let parsed: ReportInterval = serde_json::from_str("\"15_MIN\"").expect("alias");
        assert_eq!(parsed, ReportInterval::FifteenMinute);
        assert_eq!(Industry::Water.default_interval(), ReportInterval::Monthly);
    }
}
