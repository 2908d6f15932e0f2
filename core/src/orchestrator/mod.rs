//! Drives one synchronization pass per source:
//! auth, window planning, fetch, merge, outcome.
//!
//! Sources run one after another and windows within a source run oldest
//! first, separated by the source's politeness delay. A pass never returns
//! an error; everything is folded into a [`SyncOutcome`].

mod outcome;

pub use outcome::CheckOutcome;
pub use outcome::SeriesSummary;
pub use outcome::SourceSummary;
pub use outcome::SyncOutcome;
pub use outcome::WindowReport;
pub use outcome::WindowStatus;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tracing::info;
use tracing::warn;

use crate::auth::AccessToken;
use crate::auth::AuthManager;
use crate::auth::AuthState;
use crate::auth::BrowserAutomation;
use crate::auth::BrowserLoginProvider;
use crate::auth::CommandBrowserAutomation;
use crate::auth::PortalPasswordProvider;
use crate::auth::TokenCache;
use crate::auth::UnconfiguredBrowserAutomation;
use crate::config::SourcePolicy;
use crate::config::SyncConfig;
use crate::credentials::CredentialStore;
use crate::default_client::create_client;
use crate::error::ConfigError;
use crate::error::FetchError;
use crate::fetch::Fetcher;
use crate::model::SourceId;
use crate::model::SourceState;
use crate::sources::ThermostatSource;
use crate::sources::UsageSource;
use crate::sources::UtilityPortalSource;
use crate::sources::WindowData;
use crate::store::CheckpointStore;
use crate::window::Lookback;
use crate::window::SampleProbe;
use crate::window::SyncWindow;
use crate::window::WindowPlanner;
use crate::window::discover_history_start;

pub const THERMOSTAT_SESSION_FILE: &str = "thermostat_session.json";

/// Everything needed to run passes for one source.
pub struct SourceRuntime {
    source: Arc<dyn UsageSource>,
    auth: AuthManager,
    store: CheckpointStore,
    policy: SourcePolicy,
}

enum WindowAttempt {
    Fetched(WindowData),
    Failed(FetchError),
    /// The token is unusable for the rest of the pass.
    AuthLost(String),
}

impl SourceRuntime {
    pub fn new(
        source: Arc<dyn UsageSource>,
        auth: AuthManager,
        store: CheckpointStore,
        policy: SourcePolicy,
    ) -> Self {
        Self {
            source,
            auth,
            store,
            policy,
        }
    }

    pub fn id(&self) -> SourceId {
        self.source.id()
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    async fn check(&mut self) -> CheckOutcome {
        let source = self.id();
        let (ok, detail) = match self.auth.access_token(&*self.source).await {
            Ok(_) => (true, "ok".to_string()),
            Err(err) => (false, err.to_string()),
        };
        CheckOutcome {
            source,
            ok,
            detail,
            auth_state: self.auth.state(),
        }
    }

    async fn run_pass(&mut self, now: DateTime<Utc>) -> SyncOutcome {
        let source = self.id();
        info!(%source, "sync pass started");

        let mut state = match self.store.load() {
            Ok(state) => state,
            Err(err) => {
                warn!(%source, error = %err, "cannot load persisted state");
                return SyncOutcome::failed(source, err.to_string(), None);
            }
        };
        let mut token = match self.auth.access_token(&*self.source).await {
            Ok(token) => token,
            Err(err) => {
                warn!(%source, error = %err, "authentication failed");
                return SyncOutcome::failed(
                    source,
                    format!("authentication failed: {err}"),
                    Some(&state),
                );
            }
        };

        let mut reauthenticated = false;
        let discovered = match self.discover_start(&state, &token, now).await {
            Ok(start) => start,
            Err(rejection) => {
                reauthenticated = true;
                warn!(%source, error = %rejection, "access token rejected during discovery, re-authenticating");
                self.auth.invalidate();
                let retried = match self.auth.reauthenticate().await {
                    Ok(fresh) => {
                        token = fresh;
                        self.discover_start(&state, &token, now)
                            .await
                            .map_err(|err| format!("token rejected after re-authentication: {err}"))
                    }
                    Err(err) => Err(format!("re-authentication failed: {err}")),
                };
                match retried {
                    Ok(start) => start,
                    Err(reason) => {
                        warn!(%source, %reason, "abandoning pass");
                        return SyncOutcome::failed(source, reason, Some(&state));
                    }
                }
            }
        };
        let windows = WindowPlanner::new(self.policy.window).plan(
            state.checkpoint,
            self.policy.lookback,
            discovered,
            now,
        );

        let mut reports = Vec::with_capacity(windows.len());
        let mut cap: Option<DateTime<Utc>> = None;
        let mut added = 0;
        let mut pass_error: Option<String> = None;
        for (index, window) in windows.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.policy.window_delay).await;
            }
            let attempt = self
                .fetch_window(&mut token, window, &mut reauthenticated)
                .await;
            let status = match attempt {
                WindowAttempt::Fetched(data) => {
                    let readings = data.reading_count();
                    let skipped_channels: Vec<String> = data
                        .skipped_channels
                        .iter()
                        .map(|failure| format!("{}: {}", failure.channel, failure.error))
                        .collect();
                    if !skipped_channels.is_empty() {
                        cap.get_or_insert(window.start());
                    }
                    match self.store.merge_and_commit(&mut state, data.series, cap, now) {
                        Ok(summary) => {
                            added += summary.added;
                            info!(%source, %window, readings, added = summary.added, "window merged");
                            if skipped_channels.is_empty() {
                                WindowStatus::Completed {
                                    readings,
                                    added: summary.added,
                                }
                            } else {
                                WindowStatus::Partial {
                                    readings,
                                    added: summary.added,
                                    skipped_channels,
                                }
                            }
                        }
                        Err(err) => {
                            let reason = format!("failed to persist merged readings: {err}");
                            warn!(%source, %window, error = %err, "merge not committed");
                            reports.push(WindowReport::new(
                                window,
                                WindowStatus::Failed {
                                    reason: reason.clone(),
                                },
                            ));
                            pass_error = Some(reason);
                            break;
                        }
                    }
                }
                WindowAttempt::Failed(err) => {
                    cap.get_or_insert(window.start());
                    if matches!(err, FetchError::PollTimeout { .. }) {
                        warn!(%source, %window, error = %err, "window skipped");
                        WindowStatus::Skipped {
                            reason: err.to_string(),
                        }
                    } else {
                        warn!(%source, %window, error = %err, "window failed");
                        WindowStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                }
                WindowAttempt::AuthLost(reason) => {
                    warn!(%source, %window, %reason, "abandoning pass");
                    reports.push(WindowReport::new(
                        window,
                        WindowStatus::Failed {
                            reason: reason.clone(),
                        },
                    ));
                    pass_error = Some(reason);
                    break;
                }
            };
            reports.push(WindowReport::new(window, status));
        }

        let mut warnings = Vec::new();
        if pass_error.is_none() {
            match self.source.fetch_supplemental(&token).await {
                Ok(series) if series.is_empty() => {}
                Ok(series) => match self.store.merge_and_commit(&mut state, series, cap, now) {
                    Ok(summary) => {
                        added += summary.added;
                        info!(%source, added = summary.added, "supplemental records merged");
                    }
                    Err(err) => {
                        warn!(%source, error = %err, "supplemental records not committed");
                        warnings.push(format!("supplemental records not persisted: {err}"));
                    }
                },
                Err(err) => {
                    warn!(%source, error = %err, "supplemental records skipped");
                    warnings.push(format!("supplemental records skipped: {err}"));
                }
            }
        }

        let merged = reports.iter().filter(|report| report.status.merged()).count();
        let unmerged = reports.len() - merged;
        let ok = pass_error.is_none() && (windows.is_empty() || merged > 0);
        let detail = match pass_error {
            Some(reason) => reason,
            None if !ok => format!("no progress: all {} windows failed", windows.len()),
            None if unmerged > 0 => format!(
                "partial: {unmerged} of {} windows skipped or failed",
                windows.len()
            ),
            None => "ok".to_string(),
        };
        info!(
            %source,
            ok,
            added,
            total = state.total_readings(),
            windows = windows.len(),
            "sync pass finished"
        );
        SyncOutcome {
            source,
            ok,
            detail,
            last_update: state.updated_at,
            added,
            total: state.total_readings(),
            checkpoint: state.checkpoint,
            windows: reports,
            warnings,
        }
    }

    /// Runs history discovery when asked for all history and nothing has
    /// been synced yet. Only an auth rejection is returned as an error.
    async fn discover_start(
        &self,
        state: &SourceState,
        token: &AccessToken,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, FetchError> {
        if self.policy.lookback != Some(Lookback::AllHistory) || state.checkpoint.is_some() {
            return Ok(None);
        }
        let probe = WindowSampleProbe {
            source: &*self.source,
            token,
            delay: self.policy.window_delay,
        };
        let start = discover_history_start(&probe, self.policy.discovery(), now).await?;
        info!(source = %self.id(), start = ?start, "history discovery finished");
        Ok(start)
    }

    /// Fetches one window. An auth rejection triggers one invalidate,
    /// re-authenticate and retry cycle per pass.
    async fn fetch_window(
        &mut self,
        token: &mut AccessToken,
        window: &SyncWindow,
        reauthenticated: &mut bool,
    ) -> WindowAttempt {
        let rejection = match self.source.fetch_window(token, window).await {
            Ok(data) => return WindowAttempt::Fetched(data),
            Err(err) if err.is_auth_rejected() => err,
            Err(err) => return WindowAttempt::Failed(err),
        };
        if *reauthenticated {
            return WindowAttempt::AuthLost(format!(
                "token rejected after re-authentication: {rejection}"
            ));
        }
        *reauthenticated = true;
        warn!(source = %self.id(), %window, error = %rejection, "access token rejected, re-authenticating");
        self.auth.invalidate();
        match self.auth.reauthenticate().await {
            Ok(fresh) => *token = fresh,
            Err(err) => {
                return WindowAttempt::AuthLost(format!("re-authentication failed: {err}"));
            }
        }
        match self.source.fetch_window(token, window).await {
            Ok(data) => WindowAttempt::Fetched(data),
            Err(err) if err.is_auth_rejected() => WindowAttempt::AuthLost(format!(
                "token rejected after re-authentication: {err}"
            )),
            Err(err) => WindowAttempt::Failed(err),
        }
    }
}

/// Counts a day's samples by fetching it as a one-day window.
struct WindowSampleProbe<'a> {
    source: &'a dyn UsageSource,
    token: &'a AccessToken,
    delay: Duration,
}

#[async_trait]
impl<'a> SampleProbe for WindowSampleProbe<'a> {
    async fn samples_in(&self, day: SyncWindow) -> Result<u64, FetchError> {
        tokio::time::sleep(self.delay).await;
        let data = self.source.fetch_window(self.token, &day).await?;
        Ok(u64::try_from(data.max_series_len()).unwrap_or(u64::MAX))
    }
}

#[derive(Default)]
pub struct SyncOrchestrator {
    runtimes: BTreeMap<SourceId, SourceRuntime>,
    /// Sources that could not be set up, with the reason.
    unavailable: BTreeMap<SourceId, String>,
}

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires both sources from configuration. A source whose setup needs a
    /// missing credential is recorded as unavailable rather than failing
    /// the whole orchestrator.
    pub fn from_config(
        config: &SyncConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ConfigError> {
        let mut orchestrator = Self::new();

        let utility = &config.utility;
        match credentials.get_credential(SourceId::Utility) {
            Ok(credential) => {
                let policy = utility.policy.clone();
                let fetcher = Fetcher::new(
                    create_client(policy.request_timeout)?,
                    policy.retry,
                    policy.poll,
                );
                let source = UtilityPortalSource::new(
                    fetcher,
                    utility.base_url.clone(),
                    credential.username.clone(),
                    utility.industries.clone(),
                    policy.channel_delay,
                )
                .with_billing(utility.billing.clone());
                let provider =
                    PortalPasswordProvider::new(utility.base_url.clone(), policy.request_timeout);
                let auth = AuthManager::new(
                    SourceId::Utility,
                    Arc::new(provider),
                    Arc::clone(&credentials),
                    TokenCache::for_source(&config.home, SourceId::Utility),
                );
                orchestrator.register(SourceRuntime::new(
                    Arc::new(source),
                    auth,
                    CheckpointStore::for_source(&config.home, SourceId::Utility),
                    policy,
                ));
            }
            Err(err) => {
                orchestrator
                    .unavailable
                    .insert(SourceId::Utility, err.to_string());
            }
        }

        let thermostat = &config.thermostat;
        let policy = thermostat.policy.clone();
        let fetcher = Fetcher::new(
            create_client(policy.request_timeout)?,
            policy.retry,
            policy.poll,
        );
        let source = ThermostatSource::new(
            fetcher,
            thermostat.api_base_url.clone(),
            thermostat.columns.clone(),
            thermostat.normalize,
        );
        let automation: Arc<dyn BrowserAutomation> = match thermostat
            .login_command
            .as_deref()
            .and_then(|command| {
                CommandBrowserAutomation::from_command_line(command, thermostat.login_timeout)
            }) {
            Some(command) => Arc::new(command),
            None => Arc::new(UnconfiguredBrowserAutomation),
        };
        let provider =
            BrowserLoginProvider::new(automation, config.home.join(THERMOSTAT_SESSION_FILE));
        let auth = AuthManager::new(
            SourceId::Thermostat,
            Arc::new(provider),
            credentials,
            TokenCache::for_source(&config.home, SourceId::Thermostat),
        );
        orchestrator.register(SourceRuntime::new(
            Arc::new(source),
            auth,
            CheckpointStore::for_source(&config.home, SourceId::Thermostat),
            policy,
        ));

        Ok(orchestrator)
    }

    /// Adds or replaces the runtime for its source.
    pub fn register(&mut self, runtime: SourceRuntime) {
        let id = runtime.id();
        self.unavailable.remove(&id);
        self.runtimes.insert(id, runtime);
    }

    pub fn runtime(&self, source: SourceId) -> Option<&SourceRuntime> {
        self.runtimes.get(&source)
    }

    pub fn unavailable_reason(&self, source: SourceId) -> Option<&str> {
        self.unavailable.get(&source).map(String::as_str)
    }

    pub fn auth_history(&self, source: SourceId) -> Option<&[AuthState]> {
        self.runtimes.get(&source).map(|runtime| runtime.auth.history())
    }

    pub async fn run_sync_pass(&mut self, source: SourceId) -> SyncOutcome {
        self.run_sync_pass_at(source, Utc::now()).await
    }

    /// Same as [`Self::run_sync_pass`] with an explicit "now".
    pub async fn run_sync_pass_at(&mut self, source: SourceId, now: DateTime<Utc>) -> SyncOutcome {
        match self.runtimes.get_mut(&source) {
            Some(runtime) => runtime.run_pass(now).await,
            None => SyncOutcome::failed(source, self.missing_reason(source), None),
        }
    }

    /// One pass per source, sequentially.
    pub async fn run_all(&mut self) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(SourceId::ALL.len());
        for source in SourceId::ALL {
            outcomes.push(self.run_sync_pass(source).await);
        }
        outcomes
    }

    /// Obtains (and probes) a token without fetching any data.
    pub async fn check_source(&mut self, source: SourceId) -> CheckOutcome {
        match self.runtimes.get_mut(&source) {
            Some(runtime) => runtime.check().await,
            None => CheckOutcome {
                source,
                ok: false,
                detail: self.missing_reason(source),
                auth_state: AuthState::NoCredential,
            },
        }
    }

    fn missing_reason(&self, source: SourceId) -> String {
        self.unavailable
            .get(&source)
            .cloned()
            .unwrap_or_else(|| format!("{source} is not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProvider;
    use crate::auth::TokenProbe;
    use crate::credentials::Credential;
    use crate::credentials::StaticCredentialStore;
    use crate::error::AuthError;
    use crate::model::FlowDirection;
    use crate::model::Reading;
    use crate::model::ReadingKey;
    use crate::model::Series;
    use crate::model::SeriesKey;
    use crate::sources::ChannelFailure;
    use crate::window::WindowPolicy;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    type Responder = Box<dyn Fn(&str, &SyncWindow) -> Result<WindowData, FetchError> + Send + Sync>;

    struct FakeSource {
        respond: Responder,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new(
            respond: impl Fn(&str, &SyncWindow) -> Result<WindowData, FetchError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl TokenProbe for FakeSource {
        async fn probe(&self, _token: &AccessToken) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[async_trait]
    impl UsageSource for FakeSource {
        fn id(&self) -> SourceId {
            SourceId::Utility
        }

        async fn fetch_window(
            &self,
            token: &AccessToken,
            window: &SyncWindow,
        ) -> Result<WindowData, FetchError> {
            self.calls.lock().expect("lock").push(token.secret().to_string());
            (self.respond)(token.secret(), window)
        }
    }

    /// Issues `tok-1`, `tok-2`, ... or always rejects.
    struct SequenceProvider {
        issued: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl AuthProvider for SequenceProvider {
        async fn login(&self, _credential: &Credential) -> Result<AccessToken, AuthError> {
            if self.reject {
                return Err(AuthError::Rejected {
                    reason: "bad password".to_string(),
                });
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(format!("tok-{n}"), None, Utc::now()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().expect("valid")
    }

    fn hourly_series(window: &SyncWindow) -> WindowData {
        let mut readings = Vec::new();
        let mut at = window.start();
        while at < window.end() {
            readings.push(Reading::new(ReadingKey::from_datetime(at), 1.5, "kWh"));
            at += chrono::Duration::hours(6);
        }
        WindowData {
            series: vec![Series::with_readings(
                SeriesKey::new("ELECTRIC", "M1"),
                "kWh",
                FlowDirection::Delivered,
                readings,
            )],
            skipped_channels: Vec::new(),
        }
    }

    fn policy(max_window_days: u32, lookback: Option<Lookback>) -> SourcePolicy {
        let mut policy = SourcePolicy::defaults_for(SourceId::Utility);
        policy.window = WindowPolicy {
            max_window_days,
            overlap_days: 2,
            default_lookback_days: 7,
        };
        policy.lookback = lookback;
        policy.window_delay = Duration::ZERO;
        policy.channel_delay = Duration::ZERO;
        policy
    }

    fn orchestrator(
        home: &TempDir,
        source: Arc<FakeSource>,
        reject_login: bool,
        policy: SourcePolicy,
    ) -> SyncOrchestrator {
        let credentials = StaticCredentialStore::new().with(Credential::new(
            SourceId::Utility,
            "me@example.com",
            "pw",
        ));
        let auth = AuthManager::new(
            SourceId::Utility,
            Arc::new(SequenceProvider {
                issued: AtomicUsize::new(0),
                reject: reject_login,
            }),
            Arc::new(credentials),
            TokenCache::for_source(home.path(), SourceId::Utility),
        );
        let mut orchestrator = SyncOrchestrator::new();
        orchestrator.register(SourceRuntime::new(
            source,
            auth,
            CheckpointStore::for_source(home.path(), SourceId::Utility),
            policy,
        ));
        orchestrator
    }

    #[tokio::test]
    async fn fresh_pass_fetches_one_window_and_persists() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, window| Ok(hourly_series(window)));
        let mut orchestrator = orchestrator(&home, Arc::clone(&source), false, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok, "{}", outcome.detail);
        assert_eq!(outcome.detail, "ok");
        assert_eq!(outcome.windows.len(), 1);
        assert_eq!(outcome.windows[0].start, now() - chrono::Duration::days(7));
        assert_eq!(outcome.added, 28);
        assert_eq!(outcome.total, 28);
        assert_eq!(outcome.last_update, Some(now()));
        assert!(home.path().join("utility_data.json").exists());
        assert_eq!(source.calls(), vec!["tok-1".to_string()]);
    }

    #[tokio::test]
    async fn second_pass_adds_nothing_and_keeps_checkpoint() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, window| Ok(hourly_series(window)));
        let mut orchestrator = orchestrator(&home, source, false, policy(30, None));

        let first = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;
        let second = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(second.ok);
        assert_eq!(second.added, 0);
        assert_eq!(second.total, first.total);
        assert!(second.checkpoint >= first.checkpoint);
        // Incremental window: checkpoint minus the two-day overlap.
        let checkpoint = first.checkpoint.expect("checkpoint");
        assert_eq!(second.windows[0].start, checkpoint - chrono::Duration::days(2));
    }

    #[tokio::test]
    async fn rejected_token_reauthenticates_once_and_retries() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|token, window| {
            if token == "tok-1" {
                Err(FetchError::AuthRejected {
                    endpoint: "usage".to_string(),
                    status: 401,
                })
            } else {
                Ok(hourly_series(window))
            }
        });
        let mut orchestrator = orchestrator(&home, Arc::clone(&source), false, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok, "{}", outcome.detail);
        assert_eq!(source.calls(), vec!["tok-1".to_string(), "tok-2".to_string()]);
        assert_eq!(
            orchestrator.auth_history(SourceId::Utility).expect("registered"),
            &[
                AuthState::NoCredential,
                AuthState::Authenticating,
                AuthState::Authenticated,
                AuthState::Expired,
                AuthState::Authenticating,
                AuthState::Authenticated,
            ]
        );
    }

    #[tokio::test]
    async fn repeated_rejection_fails_the_pass() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, _| {
            Err(FetchError::AuthRejected {
                endpoint: "usage".to_string(),
                status: 401,
            })
        });
        let mut orchestrator = orchestrator(&home, Arc::clone(&source), false, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(!outcome.ok);
        assert!(outcome.detail.contains("after re-authentication"), "{}", outcome.detail);
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn poll_timeout_skips_window_and_caps_checkpoint() {
        let home = TempDir::new().expect("tempdir");
        let oldest_start = now() - chrono::Duration::days(60);
        let source = FakeSource::new(move |_, window| {
            if window.start() == oldest_start {
                Err(FetchError::PollTimeout {
                    endpoint: "usage poll".to_string(),
                    polls: 30,
                })
            } else {
                Ok(hourly_series(window))
            }
        });
        let mut orchestrator =
            orchestrator(&home, source, false, policy(30, Some(Lookback::Days(60))));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok, "{}", outcome.detail);
        assert_eq!(outcome.detail, "partial: 1 of 2 windows skipped or failed");
        assert!(matches!(outcome.windows[0].status, WindowStatus::Skipped { .. }));
        assert!(matches!(outcome.windows[1].status, WindowStatus::Completed { .. }));
        assert_eq!(outcome.checkpoint, Some(oldest_start));
        assert_eq!(outcome.added, 120);
    }

    #[tokio::test]
    async fn failed_channel_marks_window_partial() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, window| {
            let mut data = hourly_series(window);
            data.skipped_channels.push(ChannelFailure {
                channel: "WATER".to_string(),
                error: FetchError::Http {
                    endpoint: "usage poll".to_string(),
                    status: 400,
                },
            });
            Ok(data)
        });
        let mut orchestrator = orchestrator(&home, source, false, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok);
        assert_eq!(
            outcome.windows[0].status,
            WindowStatus::Partial {
                readings: 28,
                added: 28,
                skipped_channels: vec!["WATER: usage poll returned 400".to_string()],
            }
        );
        assert_eq!(outcome.checkpoint, Some(now() - chrono::Duration::days(7)));
    }

    #[tokio::test]
    async fn all_windows_failing_is_no_progress() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, _| {
            Err(FetchError::TransientHttp {
                endpoint: "usage".to_string(),
                status: 503,
            })
        });
        let mut orchestrator = orchestrator(&home, source, false, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "no progress: all 1 windows failed");
        assert_eq!(outcome.checkpoint, None);
    }

    #[tokio::test]
    async fn login_failure_makes_no_data_requests() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|_, window| Ok(hourly_series(window)));
        let mut orchestrator = orchestrator(&home, Arc::clone(&source), true, policy(30, None));

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(!outcome.ok);
        assert!(outcome.detail.starts_with("authentication failed"), "{}", outcome.detail);
        assert!(source.calls().is_empty());
        assert!(!home.path().join("utility_data.json").exists());
    }

    #[tokio::test]
    async fn all_history_starts_at_discovered_boundary() {
        let home = TempDir::new().expect("tempdir");
        let history_start = now() - chrono::Duration::days(45);
        let source = FakeSource::new(move |_, window| {
            if window.end() <= history_start {
                Ok(WindowData::default())
            } else {
                Ok(hourly_series(window))
            }
        });
        let mut policy = policy(30, Some(Lookback::AllHistory));
        policy.min_valid_samples = 4;
        let mut orchestrator = orchestrator(&home, source, false, policy);

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok, "{}", outcome.detail);
        let first = outcome.windows.first().expect("windows");
        assert!(first.start >= now() - chrono::Duration::days(50), "{}", first.start);
        assert!(first.start <= history_start, "{}", first.start);
    }

    #[tokio::test]
    async fn rejected_token_during_discovery_reauthenticates() {
        let home = TempDir::new().expect("tempdir");
        let source = FakeSource::new(|token, window| {
            if token == "tok-1" {
                Err(FetchError::AuthRejected {
                    endpoint: "usage".to_string(),
                    status: 401,
                })
            } else {
                Ok(hourly_series(window))
            }
        });
        let mut policy = policy(360, Some(Lookback::AllHistory));
        policy.min_valid_samples = 4;
        let mut orchestrator = orchestrator(&home, Arc::clone(&source), false, policy);

        let outcome = orchestrator.run_sync_pass_at(SourceId::Utility, now()).await;

        assert!(outcome.ok, "{}", outcome.detail);
        let calls = source.calls();
        assert_eq!(calls[0], "tok-1");
        assert!(calls[1..].iter().all(|token| token == "tok-2"), "{calls:?}");
        // Unlimited fake history: discovery stops at its 365-day bound.
        assert_eq!(
            outcome.windows.first().map(|report| report.start),
            Some(now() - chrono::Duration::days(365))
        );
    }

    #[tokio::test]
    async fn unavailable_source_reports_reason() {
        let config = SyncConfig::defaults(std::path::PathBuf::from("/nonexistent"));
        let mut orchestrator =
            SyncOrchestrator::from_config(&config, Arc::new(StaticCredentialStore::new()))
                .expect("orchestrator");

        let outcome = orchestrator.run_sync_pass(SourceId::Utility).await;

        assert!(!outcome.ok);
        assert!(outcome.detail.contains("USAGE_SYNC_UTILITY_USERNAME"), "{}", outcome.detail);
        assert!(orchestrator.runtime(SourceId::Thermostat).is_some());
    }
}
