//! Source adapters: how one window is requested and normalized for each
//! upstream service.

mod thermostat;
mod utility;

pub use thermostat::ThermostatSource;
pub use utility::AccountContext;
pub use utility::BillingOptions;
pub use utility::UtilityPortalSource;

use async_trait::async_trait;

use crate::auth::AccessToken;
use crate::auth::TokenProbe;
use crate::error::FetchError;
use crate::model::Series;
use crate::model::SourceId;
use crate::window::SyncWindow;

/// A channel (industry, report column group...) whose sub-request failed
/// while the rest of the window succeeded.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: FetchError,
}

#[derive(Debug, Default)]
pub struct WindowData {
    pub series: Vec<Series>,
    pub skipped_channels: Vec<ChannelFailure>,
}

impl WindowData {
    pub fn reading_count(&self) -> usize {
        self.series.iter().map(Series::len).sum()
    }

    /// Largest number of readings any single series got, used to judge
    /// whether a probed day carries real data.
    pub fn max_series_len(&self) -> usize {
        self.series.iter().map(Series::len).max().unwrap_or(0)
    }
}

#[async_trait]
pub trait UsageSource: TokenProbe {
    fn id(&self) -> SourceId;

    /// Fetches and normalizes one window. An auth rejection anywhere in the
    /// window is returned as an error so the caller can re-authenticate.
    async fn fetch_window(
        &self,
        token: &AccessToken,
        window: &SyncWindow,
    ) -> Result<WindowData, FetchError>;

    /// Records that are not organized by window, such as billing history.
    /// Fetched once per pass after the windows.
    async fn fetch_supplemental(&self, _token: &AccessToken) -> Result<Vec<Series>, FetchError> {
        Ok(Vec::new())
    }
}
