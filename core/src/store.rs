//! Persisted per-source state: `<home>/<source>_data.json`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StoreError;
use crate::model::FlowDirection;
use crate::model::Reading;
use crate::model::ReadingKey;
use crate::model::Series;
use crate::model::SeriesKey;
use crate::model::SourceId;
use crate::model::SourceState;

/// Replaces `path` with `bytes` via a temp file in the same directory, so a
/// crash leaves either the old or the new contents. The file ends up
/// readable by the owner only.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataFile {
    #[serde(default)]
    checkpoint: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    series: BTreeMap<String, StoredSeries>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSeries {
    #[serde(default)]
    unit: String,
    #[serde(default)]
    flow_direction: FlowDirection,
    #[serde(default)]
    total_readings: usize,
    #[serde(default)]
    readings: Vec<StoredReading>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredReading {
    /// Epoch milliseconds; `null` for month-only records.
    timestamp: Option<i64>,
    #[serde(default)]
    datetime: String,
    usage: f64,
}

impl StoredReading {
    fn from_reading(reading: &Reading) -> Self {
        Self {
            timestamp: reading.key.timestamp_millis(),
            datetime: reading.key.display_datetime(),
            usage: reading.value,
        }
    }

    fn key(&self) -> Option<ReadingKey> {
        match self.timestamp {
            Some(ms) => Some(ReadingKey::Instant(ms)),
            None => ReadingKey::parse_month(&self.datetime),
        }
    }
}

/// Counts reported after a merge was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub total: usize,
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Sole reader and writer of one source's data file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_source(home: &Path, source: SourceId) -> Self {
        Self::new(home.join(format!("{source}_data.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty state; the first successful pass creates it.
    pub fn load(&self) -> Result<SourceState, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourceState::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let file: DataFile =
            serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        self.decode(file)
    }

    pub fn save(&self, state: &SourceState) -> Result<(), StoreError> {
        let file = encode(state);
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &json).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), series = file.series.len(), "state saved");
        Ok(())
    }

    /// Merges `batch`, advances the checkpoint (bounded by `cap`) and writes
    /// the result. `state` is only updated once the write succeeded.
    pub fn merge_and_commit(
        &self,
        state: &mut SourceState,
        batch: Vec<Series>,
        cap: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<MergeSummary, StoreError> {
        let mut next = state.clone();
        let added = next.merge_batch(batch);
        next.advance_checkpoint(cap);
        next.updated_at = Some(now);
        self.save(&next)?;
        *state = next;
        Ok(MergeSummary {
            added,
            total: state.total_readings(),
            checkpoint: state.checkpoint,
        })
    }

    fn decode(&self, file: DataFile) -> Result<SourceState, StoreError> {
        let invalid = |message: String| StoreError::InvalidEntry {
            path: self.path.clone(),
            message,
        };
        let mut series = BTreeMap::new();
        for (name, stored) in file.series {
            let key: SeriesKey = name.parse().map_err(invalid)?;
            let mut readings = Vec::with_capacity(stored.readings.len());
            for entry in &stored.readings {
                let reading_key = entry.key().ok_or_else(|| {
                    invalid(format!("{key}: reading without timestamp or month '{}'", entry.datetime))
                })?;
                readings.push(Reading::new(reading_key, entry.usage, stored.unit.clone()));
            }
            let value = Series::with_readings(key.clone(), stored.unit, stored.flow_direction, readings);
            series.insert(key, value);
        }
        let mut state = SourceState {
            checkpoint: file.checkpoint,
            updated_at: file.updated_at,
            series,
        };
        if state.checkpoint.is_none() {
            state.checkpoint = state.latest_instant();
        }
        Ok(state)
    }
}

fn encode(state: &SourceState) -> DataFile {
    let series = state
        .series
        .iter()
        .map(|(key, series)| {
            (
                key.to_string(),
                StoredSeries {
                    unit: series.unit.clone(),
                    flow_direction: series.flow_direction,
                    total_readings: series.len(),
                    readings: series.readings().iter().map(StoredReading::from_reading).collect(),
                },
            )
        })
        .collect();
    DataFile {
        checkpoint: state.checkpoint,
        updated_at: state.updated_at,
        series,
    }
}
