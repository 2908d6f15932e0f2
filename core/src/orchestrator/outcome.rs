use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::auth::AuthState;
use crate::model::FlowDirection;
use crate::model::Series;
use crate::model::SourceId;
use crate::model::SourceState;
use crate::window::SyncWindow;

/// What happened to one planned window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowStatus {
    Completed {
        readings: usize,
        added: usize,
    },
    /// Some channels of the window failed; the others were merged.
    Partial {
        readings: usize,
        added: usize,
        #[serde(rename = "skippedChannels")]
        skipped_channels: Vec<String>,
    },
    /// The report job never completed.
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl WindowStatus {
    /// Whether anything from the window reached the store.
    pub fn merged(&self) -> bool {
        matches!(self, WindowStatus::Completed { .. } | WindowStatus::Partial { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub status: WindowStatus,
}

impl WindowReport {
    pub fn new(window: &SyncWindow, status: WindowStatus) -> Self {
        Self {
            start: window.start(),
            end: window.end(),
            status,
        }
    }
}

/// Result of one sync pass, handed back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub source: SourceId,
    pub ok: bool,
    pub detail: String,
    pub last_update: Option<DateTime<Utc>>,
    pub added: usize,
    pub total: usize,
    pub checkpoint: Option<DateTime<Utc>>,
    pub windows: Vec<WindowReport>,
    /// Problems that did not affect the windows, such as a failed billing
    /// history request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SyncOutcome {
    pub(crate) fn failed(
        source: SourceId,
        detail: impl Into<String>,
        state: Option<&SourceState>,
    ) -> Self {
        Self {
            source,
            ok: false,
            detail: detail.into(),
            last_update: state.and_then(|state| state.updated_at),
            added: 0,
            total: state.map_or(0, SourceState::total_readings),
            checkpoint: state.and_then(|state| state.checkpoint),
            windows: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn skipped_windows(&self) -> usize {
        self.windows
            .iter()
            .filter(|report| !report.status.merged())
            .count()
    }
}

/// Result of a credential/token check without fetching data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub source: SourceId,
    pub ok: bool,
    pub detail: String,
    pub auth_state: AuthState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSummary {
    pub key: String,
    pub unit: String,
    pub flow_direction: FlowDirection,
    pub readings: usize,
    pub first: Option<String>,
    pub last: Option<String>,
}

impl SeriesSummary {
    fn from_series(series: &Series) -> Self {
        let readings = series.readings();
        Self {
            key: series.key.to_string(),
            unit: series.unit.clone(),
            flow_direction: series.flow_direction,
            readings: readings.len(),
            first: readings.first().map(|reading| reading.key.display_datetime()),
            last: readings.last().map(|reading| reading.key.display_datetime()),
        }
    }
}

/// Read-only view of a source's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub source: SourceId,
    pub checkpoint: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub series: Vec<SeriesSummary>,
}

impl SourceSummary {
    pub fn new(source: SourceId, state: &SourceState) -> Self {
        Self {
            source,
            checkpoint: state.checkpoint,
            updated_at: state.updated_at,
            total: state.total_readings(),
            series: state.series.values().map(SeriesSummary::from_series).collect(),
        }
    }
}
