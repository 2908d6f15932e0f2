use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use super::UsageSource;
use super::WindowData;
use crate::auth::AccessToken;
use crate::auth::TokenProbe;
use crate::error::FetchError;
use crate::error::ParseError;
use crate::fetch::Fetcher;
use crate::model::SourceId;
use crate::normalize::LooseId;
use crate::normalize::null_as_default;
use crate::normalize::thermostat::RuntimeReportResponse;
use crate::normalize::thermostat::ThermostatNormalizeOptions;
use crate::normalize::thermostat::normalize_runtime_report;
use crate::window::SyncWindow;

const USER_ENDPOINT: &str = "thermostat user";
const REPORT_ENDPOINT: &str = "thermostat runtime report";
/// Last 5-minute interval of a day.
const LAST_INTERVAL_OF_DAY: u32 = 287;

#[derive(Debug, Deserialize)]
struct UserResponse {
    #[serde(default)]
    user: Option<UserInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    #[serde(default)]
    default_thermostat_identifier: Option<LooseId>,
    #[serde(default, deserialize_with = "null_as_default")]
    thermostat_list: Vec<ThermostatEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ThermostatEntry {
    Id(LooseId),
    Detailed { identifier: LooseId },
}

impl ThermostatEntry {
    fn identifier(&self) -> String {
        match self {
            ThermostatEntry::Id(id) | ThermostatEntry::Detailed { identifier: id } => id.to_string(),
        }
    }
}

/// Thermostat cloud API. One synchronous runtime report per window.
pub struct ThermostatSource {
    fetcher: Fetcher,
    api_base: String,
    columns: Vec<String>,
    options: ThermostatNormalizeOptions,
    thermostat_id: OnceCell<String>,
}

impl ThermostatSource {
    pub fn new(
        fetcher: Fetcher,
        api_base: impl Into<String>,
        columns: Vec<String>,
        options: ThermostatNormalizeOptions,
    ) -> Self {
        Self {
            fetcher,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            columns,
            options,
            thermostat_id: OnceCell::new(),
        }
    }

    pub fn thermostat_id(&self) -> Option<&str> {
        self.thermostat_id.get().map(String::as_str)
    }

    async fn load_thermostat_id(&self, token: &AccessToken) -> Result<String, FetchError> {
        let url = format!("{}/user", self.api_base);
        let response: UserResponse = self
            .fetcher
            .execute(USER_ENDPOINT, |client| {
                client
                    .get(&url)
                    .query(&[("format", "json"), ("json", "{}")])
                    .bearer_auth(token.secret())
            })
            .await?;
        let user = response.user.unwrap_or_default();
        let id = user
            .default_thermostat_identifier
            .as_ref()
            .map(ToString::to_string)
            .filter(|id| !id.is_empty())
            .or_else(|| user.thermostat_list.first().map(ThermostatEntry::identifier))
            .ok_or_else(|| ParseError::new(USER_ENDPOINT, "no thermostat on this account"))?;
        debug!(thermostat = %id, "resolved thermostat");
        Ok(id)
    }

    fn report_body(&self, thermostat_id: &str, window: &SyncWindow) -> serde_json::Value {
        serde_json::json!({
            "selection": {
                "selectionType": "thermostats",
                "selectionMatch": thermostat_id,
            },
            "startDate": self.options.clock.local_date(window.start()).format("%Y-%m-%d").to_string(),
            "endDate": self.options.clock.local_date(window.end()).format("%Y-%m-%d").to_string(),
            "startInterval": 0,
            "endInterval": LAST_INTERVAL_OF_DAY,
            "columns": self.columns.join(","),
            "includeSensors": false,
        })
    }
}

#[async_trait]
impl TokenProbe for ThermostatSource {
    async fn probe(&self, token: &AccessToken) -> Result<(), FetchError> {
        let id = self.load_thermostat_id(token).await?;
        let _ = self.thermostat_id.set(id);
        Ok(())
    }
}

#[async_trait]
impl UsageSource for ThermostatSource {
    fn id(&self) -> SourceId {
        SourceId::Thermostat
    }

    async fn fetch_window(
        &self,
        token: &AccessToken,
        window: &SyncWindow,
    ) -> Result<WindowData, FetchError> {
        let thermostat_id = self
            .thermostat_id
            .get_or_try_init(|| self.load_thermostat_id(token))
            .await?;
        let url = format!("{}/runtimeReport", self.api_base);
        let body = self.report_body(thermostat_id, window).to_string();
        let response: RuntimeReportResponse = self
            .fetcher
            .execute(REPORT_ENDPOINT, |client| {
                client
                    .get(&url)
                    .query(&[("format", "json"), ("body", body.as_str())])
                    .bearer_auth(token.secret())
            })
            .await?;
        let batch = normalize_runtime_report(&response, &self.options, thermostat_id)?;
        Ok(WindowData {
            series: batch.series,
            skipped_channels: Vec::new(),
        })
    }
}
