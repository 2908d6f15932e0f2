//! Canonical reading/series model shared by every source.
//!
//! A [`Series`] keeps its readings strictly ascending by [`ReadingKey`] with
//! no duplicate keys. The only way to add readings is [`Series::absorb`] (or
//! the free [`merge`] function), which enforces that invariant.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::SecondsFormat;
use chrono::TimeZone;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// The two upstream providers the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Utility,
    Thermostat,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [SourceId::Utility, SourceId::Thermostat];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::Utility => "utility",
            SourceId::Thermostat => "thermostat",
        }
    }

    /// Prefix used for environment variables that carry this source's secrets.
    pub fn env_prefix(self) -> &'static str {
        match self {
            SourceId::Utility => "USAGE_SYNC_UTILITY",
            SourceId::Thermostat => "USAGE_SYNC_THERMOSTAT",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utility" => Ok(SourceId::Utility),
            "thermostat" => Ok(SourceId::Thermostat),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Dedup/sort key of a reading.
///
/// Interval data carries an exact instant (epoch milliseconds). Reduced
/// granularity "current period" records only know their billing month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKey {
    Instant(i64),
    Month { year: i32, month: u32 },
}

impl ReadingKey {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        ReadingKey::Instant(at.timestamp_millis())
    }

    /// Millisecond position used for ordering. A month sorts at its first
    /// instant; an impossible month sorts first.
    pub fn sort_millis(&self) -> i64 {
        match *self {
            ReadingKey::Instant(ms) => ms,
            ReadingKey::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or(i64::MIN),
        }
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        match *self {
            ReadingKey::Instant(ms) => Some(ms),
            ReadingKey::Month { .. } => None,
        }
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.timestamp_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Human readable form written next to the raw timestamp in data files.
    pub fn display_datetime(&self) -> String {
        match *self {
            ReadingKey::Instant(_) => self
                .instant()
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            ReadingKey::Month { year, month } => format!("{month}/{year}"),
        }
    }

    /// Inverse of [`display_datetime`](Self::display_datetime) for month keys.
    pub fn parse_month(text: &str) -> Option<Self> {
        let (month, year) = text.trim().split_once('/')?;
        let month: u32 = month.trim().parse().ok()?;
        let year: i32 = year.trim().parse().ok()?;
        Some(ReadingKey::Month { year, month })
    }

    fn variant_rank(&self) -> u8 {
        match self {
            ReadingKey::Instant(_) => 0,
            ReadingKey::Month { .. } => 1,
        }
    }
}

impl Ord for ReadingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_millis()
            .cmp(&other.sort_millis())
            .then_with(|| self.variant_rank().cmp(&other.variant_rank()))
            .then_with(|| match (self, other) {
                (
                    ReadingKey::Month { year, month },
                    ReadingKey::Month {
                        year: other_year,
                        month: other_month,
                    },
                ) => (year, month).cmp(&(other_year, other_month)),
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for ReadingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One immutable measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub key: ReadingKey,
    pub value: f64,
    pub unit: String,
}

impl Reading {
    pub fn new(key: ReadingKey, value: f64, unit: impl Into<String>) -> Self {
        Self {
            key,
            value,
            unit: unit.into(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.key.instant()
    }
}

/// Identifies a series: the kind of meter/channel plus its upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub kind: String,
    pub channel: String,
}

impl SeriesKey {
    pub fn new(kind: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.channel)
    }
}

impl FromStr for SeriesKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, channel)) if !kind.is_empty() && !channel.is_empty() => {
                Ok(SeriesKey::new(kind, channel))
            }
            _ => Err(format!("series key '{s}' is not of the form KIND:CHANNEL")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDirection {
    Delivered,
    Received,
    Net,
    #[default]
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub key: SeriesKey,
    pub unit: String,
    pub flow_direction: FlowDirection,
    readings: Vec<Reading>,
}

impl Series {
    pub fn new(key: SeriesKey, unit: impl Into<String>, flow_direction: FlowDirection) -> Self {
        Self {
            key,
            unit: unit.into(),
            flow_direction,
            readings: Vec::new(),
        }
    }

    /// Builds a series from arbitrary readings, applying the same dedup and
    /// ordering rules as a merge into an empty series.
    pub fn with_readings(
        key: SeriesKey,
        unit: impl Into<String>,
        flow_direction: FlowDirection,
        readings: Vec<Reading>,
    ) -> Self {
        let mut series = Self::new(key, unit, flow_direction);
        series.absorb(readings);
        series
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn latest_key(&self) -> Option<ReadingKey> {
        self.readings.last().map(|r| r.key)
    }

    /// Latest exact instant in the series, ignoring month-only records.
    pub fn latest_instant(&self) -> Option<DateTime<Utc>> {
        self.readings.iter().rev().find_map(Reading::timestamp)
    }

    /// Inserts readings whose key is not present yet and returns how many
    /// were added. Existing readings always win over incoming ones, and the
    /// first occurrence wins within the incoming batch.
    pub fn absorb(&mut self, incoming: Vec<Reading>) -> usize {
        let mut seen: HashSet<ReadingKey> = self.readings.iter().map(|r| r.key).collect();
        let before = self.readings.len();
        for reading in incoming {
            if seen.insert(reading.key) {
                self.readings.push(reading);
            }
        }
        let added = self.readings.len() - before;
        if added > 0 {
            self.readings.sort_by_key(|r| r.key);
        }
        added
    }
}

/// `merge(existingSeries, newReadings) -> (mergedSeries, addedCount)`.
pub fn merge(existing: Series, new_readings: Vec<Reading>) -> (Series, usize) {
    let mut merged = existing;
    let added = merged.absorb(new_readings);
    (merged, added)
}

/// Everything persisted for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub checkpoint: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub series: BTreeMap<SeriesKey, Series>,
}

impl SourceState {
    pub fn total_readings(&self) -> usize {
        self.series.values().map(Series::len).sum()
    }

    pub fn latest_instant(&self) -> Option<DateTime<Utc>> {
        self.series.values().filter_map(Series::latest_instant).max()
    }

    /// Merges a normalized batch, creating series on first sight. Returns the
    /// number of genuinely new readings.
    pub fn merge_batch(&mut self, batch: Vec<Series>) -> usize {
        let mut added = 0;
        for incoming in batch {
            let Series {
                key,
                unit,
                flow_direction,
                readings,
            } = incoming;
            let target = self
                .series
                .entry(key.clone())
                .or_insert_with(|| Series::new(key, unit.clone(), flow_direction));
            if target.unit.is_empty() && !unit.is_empty() {
                target.unit = unit;
            }
            if target.flow_direction == FlowDirection::Unspecified {
                target.flow_direction = flow_direction;
            }
            added += target.absorb(readings);
        }
        added
    }

    /// Moves the checkpoint to the latest merged instant, optionally capped,
    /// never backwards.
    pub fn advance_checkpoint(&mut self, cap: Option<DateTime<Utc>>) {
        let Some(latest) = self.latest_instant() else {
            return;
        };
        let candidate = match cap {
            Some(cap) => latest.min(cap),
            None => latest,
        };
        self.checkpoint = Some(match self.checkpoint {
            Some(current) => current.max(candidate),
            None => candidate,
        });
    }
}
