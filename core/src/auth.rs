//! Access-token lifecycle for one source.
//!
//! ```text
//! NoCredential -> Authenticating -> Authenticated -> Expired
//!                      ^                  |             |
//!                      +------------------+-------------+
//! ```
//!
//! A cached token (in memory or in `<source>_token.json`) lets a pass start
//! in `Authenticated`; it is confirmed with a cheap probe before use.

mod browser;
mod password;

pub use browser::BrowserAutomation;
pub use browser::BrowserLogin;
pub use browser::BrowserLoginProvider;
pub use browser::CommandBrowserAutomation;
pub use browser::UnconfiguredBrowserAutomation;
pub use password::PortalPasswordProvider;

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::credentials::Credential;
use crate::credentials::CredentialStore;
use crate::error::AuthError;
use crate::error::FetchError;
use crate::model::SourceId;
use crate::store::write_atomic;

/// Tokens this close to their expiry are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    #[serde(rename = "accessToken", alias = "authorizationToken")]
    value: String,
    #[serde(default, rename = "expiry", skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    issued_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(
        value: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            value: value.into(),
            expires_at,
            issued_at,
        }
    }

    /// The bearer value. Keep it out of logs.
    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Tokens without a known expiry are only invalidated by the server.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expiry| expiry - Duration::seconds(EXPIRY_SKEW_SECS) <= now)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// `<home>/<source>_token.json`.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_source(home: &Path, source: SourceId) -> Self {
        Self::new(home.join(format!("{source}_token.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> std::io::Result<Option<AccessToken>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn store(&self, token: &AccessToken) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(token)?;
        write_atomic(&self.path, &json)
    }

    /// Returns whether a cached token was removed.
    pub fn clear(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NoCredential,
    Authenticating,
    Authenticated,
    Expired,
}

/// Source-specific login protocol.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn login(&self, credential: &Credential) -> Result<AccessToken, AuthError>;
}

/// Cheap read-only call used to confirm that a cached token still works.
#[async_trait]
pub trait TokenProbe: Send + Sync {
    async fn probe(&self, token: &AccessToken) -> Result<(), FetchError>;
}

pub struct AuthManager {
    source: SourceId,
    provider: Arc<dyn AuthProvider>,
    credentials: Arc<dyn CredentialStore>,
    cache: TokenCache,
    state: AuthState,
    token: Option<AccessToken>,
    history: Vec<AuthState>,
}

impl AuthManager {
    pub fn new(
        source: SourceId,
        provider: Arc<dyn AuthProvider>,
        credentials: Arc<dyn CredentialStore>,
        cache: TokenCache,
    ) -> Self {
        Self {
            source,
            provider,
            credentials,
            cache,
            state: AuthState::NoCredential,
            token: None,
            history: vec![AuthState::NoCredential],
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Every state entered so far, starting with `NoCredential`.
    pub fn history(&self) -> &[AuthState] {
        &self.history
    }

    /// Returns a usable token, reusing a cached one when the probe accepts
    /// it and logging in otherwise.
    pub async fn access_token<P>(&mut self, probe: &P) -> Result<AccessToken, AuthError>
    where
        P: TokenProbe + ?Sized,
    {
        if let Some(token) = self.cached_token(Utc::now()) {
            self.transition(AuthState::Authenticated);
            match probe.probe(&token).await {
                Ok(()) => {
                    self.token = Some(token.clone());
                    return Ok(token);
                }
                Err(err) => {
                    warn!(source = %self.source, error = %err, "cached token failed probe");
                    self.discard_token();
                }
            }
        }
        self.authenticate().await
    }

    /// The source rejected the current token.
    pub fn invalidate(&mut self) {
        self.transition(AuthState::Expired);
        self.discard_token();
    }

    /// Runs the login flow regardless of any cached token.
    pub async fn reauthenticate(&mut self) -> Result<AccessToken, AuthError> {
        self.authenticate().await
    }

    async fn authenticate(&mut self) -> Result<AccessToken, AuthError> {
        self.transition(AuthState::Authenticating);
        let result = match self.credentials.get_credential(self.source) {
            Ok(credential) => self.provider.login(&credential).await,
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(token) => {
                if let Err(err) = self.cache.store(&token) {
                    warn!(
                        source = %self.source,
                        path = %self.cache.path().display(),
                        error = %err,
                        "failed to persist access token"
                    );
                }
                self.token = Some(token.clone());
                self.transition(AuthState::Authenticated);
                Ok(token)
            }
            Err(err) => {
                self.token = None;
                self.transition(AuthState::NoCredential);
                Err(err)
            }
        }
    }

    fn cached_token(&mut self, now: DateTime<Utc>) -> Option<AccessToken> {
        let token = match self.token.take() {
            Some(token) => Some(token),
            None => match self.cache.load() {
                Ok(token) => token,
                Err(err) => {
                    warn!(source = %self.source, error = %err, "ignoring unreadable token cache");
                    None
                }
            },
        }?;
        if token.is_expired(now) {
            info!(source = %self.source, "cached token has expired");
            self.transition(AuthState::Expired);
            self.discard_token();
            return None;
        }
        Some(token)
    }

    fn discard_token(&mut self) {
        self.token = None;
        if let Err(err) = self.cache.clear() {
            warn!(source = %self.source, error = %err, "failed to remove token cache");
        }
    }

    fn transition(&mut self, next: AuthState) {
        if self.state == next {
            return;
        }
        info!(source = %self.source, from = ?self.state, to = ?next, "auth state change");
        self.state = next;
        self.history.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialStore;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct CountingProvider {
        logins: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl AuthProvider for CountingProvider {
        async fn login(&self, credential: &Credential) -> Result<AccessToken, AuthError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Err(AuthError::Rejected {
                    reason: "bad password".to_string(),
                });
            }
            Ok(AccessToken::new(
                format!("{}-{n}", credential.username),
                Some(Utc::now() + Duration::hours(1)),
                Utc::now(),
            ))
        }
    }

    struct Probe(bool);

    #[async_trait]
    impl TokenProbe for Probe {
        async fn probe(&self, _token: &AccessToken) -> Result<(), FetchError> {
            if self.0 {
                Ok(())
            } else {
                Err(FetchError::AuthRejected {
                    endpoint: "probe".to_string(),
                    status: 401,
                })
            }
        }
    }

    fn manager(home: &TempDir, reject: bool) -> (AuthManager, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            logins: AtomicUsize::new(0),
            reject,
        });
        let credentials = StaticCredentialStore::new().with(Credential::new(
            SourceId::Utility,
            "me",
            "pw",
        ));
        let manager = AuthManager::new(
            SourceId::Utility,
            provider.clone(),
            Arc::new(credentials),
            TokenCache::for_source(home.path(), SourceId::Utility),
        );
        (manager, provider)
    }

    #[tokio::test]
    async fn first_use_logs_in_and_persists_token() {
        let home = TempDir::new().expect("tempdir");
        let (mut auth, provider) = manager(&home, false);
        let token = auth.access_token(&Probe(true)).await.expect("token");
        assert_eq!(token.secret(), "me-1");
        assert_eq!(
            auth.history(),
            &[
                AuthState::NoCredential,
                AuthState::Authenticating,
                AuthState::Authenticated
            ]
        );
        assert_eq!(provider.logins.load(Ordering::SeqCst), 1);

        let cached = TokenCache::for_source(home.path(), SourceId::Utility)
            .load()
            .expect("read cache");
        assert_eq!(cached, Some(token));
    }

    #[tokio::test]
    async fn valid_cached_token_skips_login() {
        let home = TempDir::new().expect("tempdir");
        let cache = TokenCache::for_source(home.path(), SourceId::Utility);
        cache
            .store(&AccessToken::new("cached", None, Utc::now()))
            .expect("seed cache");

        let (mut auth, provider) = manager(&home, false);
        let token = auth.access_token(&Probe(true)).await.expect("token");
        assert_eq!(token.secret(), "cached");
        assert_eq!(provider.logins.load(Ordering::SeqCst), 0);
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn failed_probe_forces_login() {
        let home = TempDir::new().expect("tempdir");
        TokenCache::for_source(home.path(), SourceId::Utility)
            .store(&AccessToken::new("stale", None, Utc::now()))
            .expect("seed cache");

        let (mut auth, provider) = manager(&home, false);
        let token = auth.access_token(&Probe(false)).await.expect("token");
        assert_eq!(token.secret(), "me-1");
        assert_eq!(provider.logins.load(Ordering::SeqCst), 1);
        assert_eq!(
            auth.history(),
            &[
                AuthState::NoCredential,
                AuthState::Authenticated,
                AuthState::Authenticating,
                AuthState::Authenticated
            ]
        );
    }

    #[tokio::test]
    async fn invalidate_then_reauthenticate_walks_expired_path() {
        let home = TempDir::new().expect("tempdir");
        let (mut auth, _) = manager(&home, false);
        auth.access_token(&Probe(true)).await.expect("token");

        auth.invalidate();
        assert_eq!(auth.state(), AuthState::Expired);
        let token = auth.reauthenticate().await.expect("token");
        assert_eq!(token.secret(), "me-2");
        assert_eq!(
            &auth.history()[2..],
            &[
                AuthState::Authenticated,
                AuthState::Expired,
                AuthState::Authenticating,
                AuthState::Authenticated
            ]
        );
    }

    #[tokio::test]
    async fn rejected_login_is_terminal_for_the_attempt() {
        let home = TempDir::new().expect("tempdir");
        let (mut auth, _) = manager(&home, true);
        let err = auth.access_token(&Probe(true)).await.unwrap_err();
        assert_matches!(err, AuthError::Rejected { .. });
        assert_eq!(auth.state(), AuthState::NoCredential);
        assert!(!home.path().join("utility_token.json").exists());
    }

    #[test]
    fn token_cache_accepts_provider_field_name() {
        let token: AccessToken = serde_json::from_str(
            r#"{"authorizationToken":"abc","expiry":"2026-01-01T00:00:00Z","issuedAt":"2025-12-31T23:00:00Z"}"#,
        )
        .expect("parse");
        assert_eq!(token.secret(), "abc");
        assert!(token.is_expired(Utc::now()));
        assert!(!format!("{token:?}").contains("abc"));
    }

    #[test]
    fn clearing_a_missing_cache_is_not_an_error() {
        let home = TempDir::new().expect("tempdir");
        let cache = TokenCache::for_source(home.path(), SourceId::Thermostat);
        assert!(!cache.clear().expect("clear"));
    }
}
