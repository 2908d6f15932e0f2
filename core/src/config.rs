//! `config.toml` in the data home, resolved into per-source settings.
//!
//! Every key is optional; an absent file yields the defaults below.
//!
//! ```toml
//! [utility]
//! lookback = 30            # days, or "all"
//! electric_interval = "15_MIN"
//!
//! [thermostat]
//! time_zone = "America/Chicago"   # or utc_offset_minutes = -300
//! login_command = ["node", "ecobee-login.js"]
//! ```

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::fetch::PollPolicy;
use crate::fetch::RetryPolicy;
use crate::model::SourceId;
use crate::normalize::thermostat::DEFAULT_COLUMNS;
use crate::normalize::thermostat::REPORT_INTERVAL_MINUTES;
use crate::normalize::thermostat::ReportClock;
use crate::normalize::thermostat::ThermostatNormalizeOptions;
use crate::normalize::utility::Industry;
use crate::normalize::utility::ReportInterval;
use crate::sources::BillingOptions;
use crate::window::DiscoveryPolicy;
use crate::window::Lookback;
use crate::window::WindowPolicy;

pub const CONFIG_TOML_FILE: &str = "config.toml";
pub const BILLS_DIR: &str = "bills";
pub const HOME_ENV_VAR: &str = "USAGE_SYNC_HOME";
const DEFAULT_HOME_DIR: &str = ".usage-sync";

pub const DEFAULT_UTILITY_BASE_URL: &str = "https://hsvutil.smarthub.coop";
pub const DEFAULT_THERMOSTAT_API_BASE_URL: &str = "https://api.ecobee.com/1";

/// Ceiling for every day-count setting, roughly a century.
pub const MAX_DAYS: u32 = 36_500;

/// `USAGE_SYNC_HOME` when set, otherwise `~/.usage-sync`.
pub fn find_home() -> Result<PathBuf, ConfigError> {
    find_home_with(std::env::var_os(HOME_ENV_VAR))
}

fn find_home_with(env_value: Option<OsString>) -> Result<PathBuf, ConfigError> {
    match env_value {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => dirs::home_dir()
            .map(|home| home.join(DEFAULT_HOME_DIR))
            .ok_or(ConfigError::NoHome),
    }
}

/// Knobs shared by both sources.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyToml {
    pub max_window_days: Option<u32>,
    pub overlap_days: Option<u32>,
    pub default_lookback_days: Option<u32>,
    pub lookback: Option<Lookback>,
    pub min_valid_samples: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_polls: Option<u32>,
    pub window_delay_ms: Option<u64>,
    pub channel_delay_ms: Option<u64>,
    pub request_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtilityToml {
    #[serde(flatten)]
    pub policy: PolicyToml,
    pub base_url: Option<String>,
    /// Restricts which industries are requested.
    pub industries: Option<Vec<Industry>>,
    pub electric_interval: Option<ReportInterval>,
    pub gas_interval: Option<ReportInterval>,
    pub water_interval: Option<ReportInterval>,
    /// Billing history is merged as a `BILL:<account>` series. On by default.
    pub billing_history: Option<bool>,
    /// Also save each bill document under `<home>/bills`.
    pub download_bills: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThermostatToml {
    #[serde(flatten)]
    pub policy: PolicyToml,
    pub api_base_url: Option<String>,
    pub columns: Option<Vec<String>>,
    pub store_interval_minutes: Option<u32>,
    pub utc_offset_minutes: Option<i32>,
    /// IANA zone name of the thermostat clock.
    pub time_zone: Option<String>,
    /// `[program, args...]` of the browser-automation login script.
    pub login_command: Option<Vec<String>>,
    pub login_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    #[serde(default)]
    pub utility: UtilityToml,
    #[serde(default)]
    pub thermostat: ThermostatToml,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    pub window: WindowPolicy,
    pub lookback: Option<Lookback>,
    /// Per-day sample count a probed day needs to count as "has data".
    pub min_valid_samples: u64,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub window_delay: Duration,
    pub channel_delay: Duration,
    pub request_timeout: Duration,
}

impl SourcePolicy {
    pub fn defaults_for(source: SourceId) -> Self {
        let (window, min_valid_samples) = match source {
            SourceId::Utility => (
                WindowPolicy {
                    max_window_days: 360,
                    overlap_days: 3,
                    default_lookback_days: 7,
                },
                20,
            ),
            SourceId::Thermostat => (
                WindowPolicy {
                    max_window_days: 30,
                    overlap_days: 2,
                    default_lookback_days: 7,
                },
                50,
            ),
        };
        Self {
            window,
            lookback: None,
            min_valid_samples,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            window_delay: Duration::from_millis(500),
            channel_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn discovery(&self) -> DiscoveryPolicy {
        DiscoveryPolicy {
            min_valid_samples: self.min_valid_samples,
            ..DiscoveryPolicy::default()
        }
    }

    fn apply(&mut self, section: &str, toml: &PolicyToml) -> Result<(), ConfigError> {
        if let Some(days) = toml.max_window_days {
            self.window.max_window_days = day_count(section, "max_window_days", days, 1)?;
        }
        if let Some(days) = toml.overlap_days {
            self.window.overlap_days = day_count(section, "overlap_days", days, 0)?;
        }
        if let Some(days) = toml.default_lookback_days {
            self.window.default_lookback_days =
                day_count(section, "default_lookback_days", days, 0)?;
        }
        if let Some(lookback) = toml.lookback {
            if let Lookback::Days(days) = lookback {
                day_count(section, "lookback", days, 0)?;
            }
            self.lookback = Some(lookback);
        }
        if let Some(samples) = toml.min_valid_samples {
            self.min_valid_samples = samples;
        }
        if let Some(attempts) = toml.retry_attempts {
            if attempts == 0 {
                return Err(invalid(section, "retry_attempts", "must be at least 1"));
            }
            self.retry.max_attempts = attempts;
        }
        if let Some(ms) = toml.retry_delay_ms {
            self.retry.delay = Duration::from_millis(ms);
        }
        if let Some(ms) = toml.poll_interval_ms {
            self.poll.interval = Duration::from_millis(ms);
        }
        if let Some(polls) = toml.max_polls {
            self.poll.max_polls = polls;
        }
        if let Some(ms) = toml.window_delay_ms {
            self.window_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = toml.channel_delay_ms {
            self.channel_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = toml.request_timeout_sec {
            if secs == 0 {
                return Err(invalid(section, "request_timeout_sec", "must be at least 1"));
            }
            self.request_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }
}

fn day_count(section: &str, key: &str, days: u32, min: u32) -> Result<u32, ConfigError> {
    if days < min {
        return Err(invalid(section, key, format!("must be at least {min}")));
    }
    if days > MAX_DAYS {
        return Err(invalid(section, key, format!("must be at most {MAX_DAYS}")));
    }
    Ok(days)
}

fn invalid(section: &str, key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: format!("{section}.{key}"),
        message: message.into(),
    }
}

fn base_url(
    section: &str,
    key: &str,
    value: Option<&str>,
    default: &str,
) -> Result<String, ConfigError> {
    let url = value.unwrap_or(default).trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(invalid(section, key, format!("'{url}' is not an http(s) URL")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilitySettings {
    pub policy: SourcePolicy,
    pub base_url: String,
    pub industries: Vec<(Industry, ReportInterval)>,
    pub billing: BillingOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatSettings {
    pub policy: SourcePolicy,
    pub api_base_url: String,
    pub columns: Vec<String>,
    pub normalize: ThermostatNormalizeOptions,
    pub login_command: Option<Vec<String>>,
    pub login_timeout: Duration,
}

/// Fully resolved configuration handed to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub home: PathBuf,
    pub utility: UtilitySettings,
    pub thermostat: ThermostatSettings,
}

impl SyncConfig {
    /// Reads `<home>/config.toml`; a missing file means all defaults.
    pub fn load(home: PathBuf) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_TOML_FILE);
        let toml = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_config_toml(&path, &contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::from_toml(home, toml)
    }

    pub fn defaults(home: PathBuf) -> Self {
        Self {
            home,
            utility: UtilitySettings {
                policy: SourcePolicy::defaults_for(SourceId::Utility),
                base_url: DEFAULT_UTILITY_BASE_URL.to_string(),
                industries: Industry::ALL
                    .iter()
                    .map(|industry| (*industry, industry.default_interval()))
                    .collect(),
                billing: BillingOptions {
                    enabled: true,
                    pdf_dir: None,
                },
            },
            thermostat: ThermostatSettings {
                policy: SourcePolicy::defaults_for(SourceId::Thermostat),
                api_base_url: DEFAULT_THERMOSTAT_API_BASE_URL.to_string(),
                columns: DEFAULT_COLUMNS.iter().map(ToString::to_string).collect(),
                normalize: ThermostatNormalizeOptions::default(),
                login_command: None,
                login_timeout: Duration::from_secs(180),
            },
        }
    }

    pub fn from_toml(home: PathBuf, toml: ConfigToml) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(home);

        let utility = &toml.utility;
        config.utility.policy.apply("utility", &utility.policy)?;
        config.utility.base_url = base_url(
            "utility",
            "base_url",
            utility.base_url.as_deref(),
            DEFAULT_UTILITY_BASE_URL,
        )?;
        let interval_for = |industry: Industry| {
            let configured = match industry {
                Industry::Electric => utility.electric_interval,
                Industry::Gas => utility.gas_interval,
                Industry::Water => utility.water_interval,
            };
            configured.unwrap_or_else(|| industry.default_interval())
        };
        let selected: Vec<Industry> = match &utility.industries {
            Some(list) if list.is_empty() => {
                return Err(invalid("utility", "industries", "must name at least one industry"));
            }
            Some(list) => list.clone(),
            None => Industry::ALL.to_vec(),
        };
        config.utility.industries = selected
            .into_iter()
            .map(|industry| (industry, interval_for(industry)))
            .collect();
        let billing_history = utility.billing_history.unwrap_or(true);
        if utility.download_bills == Some(true) && !billing_history {
            return Err(invalid(
                "utility",
                "download_bills",
                "needs billing_history enabled",
            ));
        }
        config.utility.billing = BillingOptions {
            enabled: billing_history,
            pdf_dir: (utility.download_bills == Some(true))
                .then(|| config.home.join(BILLS_DIR)),
        };

        let thermostat = &toml.thermostat;
        config.thermostat.policy.apply("thermostat", &thermostat.policy)?;
        config.thermostat.api_base_url = base_url(
            "thermostat",
            "api_base_url",
            thermostat.api_base_url.as_deref(),
            DEFAULT_THERMOSTAT_API_BASE_URL,
        )?;
        if let Some(columns) = &thermostat.columns {
            let columns: Vec<String> = columns
                .iter()
                .map(|column| column.trim().to_string())
                .filter(|column| !column.is_empty())
                .collect();
            if columns.is_empty() {
                return Err(invalid("thermostat", "columns", "must name at least one column"));
            }
            config.thermostat.columns = columns;
        }
        if let Some(minutes) = thermostat.store_interval_minutes {
            if minutes == 0 || minutes % REPORT_INTERVAL_MINUTES != 0 {
                return Err(invalid(
                    "thermostat",
                    "store_interval_minutes",
                    format!("must be a positive multiple of {REPORT_INTERVAL_MINUTES}"),
                ));
            }
            config.thermostat.normalize.store_interval_minutes = minutes;
        }
        match (&thermostat.time_zone, thermostat.utc_offset_minutes) {
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "thermostat",
                    "time_zone",
                    "set either time_zone or utc_offset_minutes, not both",
                ));
            }
            (Some(name), None) => {
                let zone: Tz = name.trim().parse().map_err(|err| {
                    invalid("thermostat", "time_zone", format!("unknown zone '{name}': {err}"))
                })?;
                config.thermostat.normalize.clock = ReportClock::Zone(zone);
            }
            (None, Some(minutes)) => {
                let offset = minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| invalid("thermostat", "utc_offset_minutes", "out of range"))?;
                config.thermostat.normalize.clock = ReportClock::Fixed(offset);
            }
            (None, None) => {}
        }
        if let Some(command) = &thermostat.login_command {
            if command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(invalid("thermostat", "login_command", "must name a program"));
            }
            config.thermostat.login_command = Some(command.clone());
        }
        if let Some(secs) = thermostat.login_timeout_sec {
            config.thermostat.login_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    pub fn policy(&self, source: SourceId) -> &SourcePolicy {
        match source {
            SourceId::Utility => &self.utility.policy,
            SourceId::Thermostat => &self.thermostat.policy,
        }
    }

    /// Zeroes every politeness, retry and poll delay.
    pub fn without_delays(mut self) -> Self {
        for policy in [&mut self.utility.policy, &mut self.thermostat.policy] {
            policy.retry.delay = Duration::ZERO;
            policy.poll.interval = Duration::ZERO;
            policy.window_delay = Duration::ZERO;
            policy.channel_delay = Duration::ZERO;
        }
        self
    }
}

pub fn parse_config_toml(path: &Path, contents: &str) -> Result<ConfigToml, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
