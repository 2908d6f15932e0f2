//! Splits the range that still needs fetching into request-sized windows.

use std::fmt;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::error::FetchError;

/// Closed date range submitted as one fetch request. `start <= end` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Window covering the single calendar day that starts at `day_start`.
    pub fn single_day(day_start: DateTime<Utc>) -> Self {
        Self {
            start: day_start,
            end: day_start + Duration::days(1),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// How far back a source without a checkpoint should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lookback {
    Days(u32),
    AllHistory,
}

impl<'de> Deserialize<'de> for Lookback {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Days(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Days(days) => Ok(Lookback::Days(days)),
            Raw::Text(text) if text.eq_ignore_ascii_case("all") => Ok(Lookback::AllHistory),
            Raw::Text(text) => text.trim().parse().map(Lookback::Days).map_err(|_| {
                serde::de::Error::custom(format!(
                    "lookback must be a day count or \"all\", got '{text}'"
                ))
            }),
        }
    }
}

/// No source keeps readings older than this; planning never reaches past it.
pub const HISTORY_FLOOR: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// `at` moved back by `days`, saturating at [`HISTORY_FLOOR`].
fn days_before(at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    at.checked_sub_signed(Duration::days(i64::from(days)))
        .map_or(HISTORY_FLOOR, |earlier| earlier.max(HISTORY_FLOOR))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub max_window_days: u32,
    pub overlap_days: u32,
    pub default_lookback_days: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowPlanner {
    policy: WindowPolicy,
}

impl WindowPlanner {
    pub fn new(policy: WindowPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Start of the range to fetch.
    ///
    /// A checkpoint always wins and is pulled back by the overlap margin.
    /// Without one the lookback applies; `AllHistory` uses the discovered
    /// boundary and falls back to the default lookback when discovery found
    /// nothing.
    pub fn effective_start(
        &self,
        checkpoint: Option<DateTime<Utc>>,
        lookback: Option<Lookback>,
        discovered_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let default_start = days_before(now, self.policy.default_lookback_days);
        let start = match (checkpoint, lookback) {
            (Some(checkpoint), _) => days_before(checkpoint, self.policy.overlap_days),
            (None, Some(Lookback::Days(days))) => days_before(now, days),
            (None, Some(Lookback::AllHistory)) => discovered_start.unwrap_or(default_start),
            (None, None) => default_start,
        };
        start.clamp(HISTORY_FLOOR.min(now), now)
    }

    /// Ordered (oldest first) windows covering `[effective_start, now]`.
    pub fn plan(
        &self,
        checkpoint: Option<DateTime<Utc>>,
        lookback: Option<Lookback>,
        discovered_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<SyncWindow> {
        let start = self.effective_start(checkpoint, lookback, discovered_start, now);
        self.plan_range(start, now)
    }

    /// Walks backward from `now` in steps of at most the maximum window size
    /// until `start` is reached, then returns the windows oldest first.
    /// Adjacent windows share exactly one boundary instant.
    pub fn plan_range(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Vec<SyncWindow> {
        let start = start.clamp(HISTORY_FLOOR.min(now), now);
        let step = Duration::days(i64::from(self.policy.max_window_days.max(1)));
        let mut windows = Vec::new();
        let mut end = now;
        loop {
            let window_start = end
                .checked_sub_signed(step)
                .map_or(start, |candidate| candidate.max(start));
            windows.push(SyncWindow {
                start: window_start,
                end,
            });
            if window_start <= start {
                break;
            }
            end = window_start;
        }
        windows.reverse();
        debug!(
            windows = windows.len(),
            start = %start,
            end = %now,
            "planned sync windows"
        );
        windows
    }
}

/// Bounds for the "all available history" probing procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub coarse_step_days: u32,
    pub max_days_back: u32,
    pub min_valid_samples: u64,
    pub max_consecutive_misses: u32,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            coarse_step_days: 10,
            max_days_back: 365,
            min_valid_samples: 50,
            max_consecutive_misses: 3,
        }
    }
}

/// Counts how many samples a source returns for one day.
#[async_trait]
pub trait SampleProbe: Send + Sync {
    async fn samples_in(&self, day: SyncWindow) -> Result<u64, FetchError>;
}

/// Best-effort estimate of where a source's history begins.
///
/// Probes single days going back in coarse steps until a day comes back
/// (near) empty, then walks day by day past the last good coarse point and
/// stops after `max_consecutive_misses` empty days in a row. Never reaches
/// beyond `max_days_back`. Returns `Ok(None)` when even the first coarse
/// probe has no data.
///
/// A failed probe counts as an empty day, except an auth rejection, which
/// is returned so the caller can re-authenticate.
pub async fn discover_history_start<P>(
    probe: &P,
    policy: DiscoveryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, FetchError>
where
    P: SampleProbe + ?Sized,
{
    let coarse_step = policy.coarse_step_days.max(1);

    let mut last_valid: Option<u32> = None;
    let mut days_back = coarse_step;
    while days_back <= policy.max_days_back {
        let valid = day_has_data(probe, &policy, now, days_back).await?;
        debug!(days_back, valid, "coarse history probe");
        if !valid {
            break;
        }
        last_valid = Some(days_back);
        days_back = days_back.saturating_add(coarse_step);
    }
    let Some(mut boundary) = last_valid else {
        return Ok(None);
    };

    let mut misses = 0;
    let mut days_back = boundary.saturating_add(1);
    while misses < policy.max_consecutive_misses && days_back <= policy.max_days_back {
        if day_has_data(probe, &policy, now, days_back).await? {
            boundary = days_back;
            misses = 0;
        } else {
            misses += 1;
        }
        days_back = days_back.saturating_add(1);
    }
    debug!(boundary, "history boundary found");
    Ok(Some(days_before(now, boundary)))
}

async fn day_has_data<P>(
    probe: &P,
    policy: &DiscoveryPolicy,
    now: DateTime<Utc>,
    days_back: u32,
) -> Result<bool, FetchError>
where
    P: SampleProbe + ?Sized,
{
    let day = SyncWindow::single_day(days_before(now, days_back));
    match probe.samples_in(day).await {
        Ok(count) => Ok(count >= policy.min_valid_samples),
        Err(err) if err.is_auth_rejected() => Err(err),
        Err(err) => {
            warn!(%day, error = %err, "history sample fetch failed, counting the day as empty");
            Ok(false)
        }
    }
}
