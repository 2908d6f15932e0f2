//! Second-factor login delegated to an external browser-automation tool.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

use super::AccessToken;
use super::AuthProvider;
use crate::credentials::Credential;
use crate::error::AuthError;
use crate::store::write_atomic;

pub const LOGIN_USERNAME_ENV: &str = "USAGE_SYNC_LOGIN_USERNAME";
pub const LOGIN_PASSWORD_ENV: &str = "USAGE_SYNC_LOGIN_PASSWORD";
pub const LOGIN_SECOND_FACTOR_ENV: &str = "USAGE_SYNC_LOGIN_SECOND_FACTOR";
pub const LOGIN_SESSION_PATH_ENV: &str = "USAGE_SYNC_LOGIN_SESSION_PATH";

/// Result of one scripted login.
#[derive(Debug, Clone)]
pub struct BrowserLogin {
    pub token: AccessToken,
    /// Replacement session state, when the tool produced one.
    pub session_artifact: Option<Vec<u8>>,
}

#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    async fn login(
        &self,
        credential: &Credential,
        second_factor: Option<&str>,
        session_artifact: &Path,
    ) -> Result<BrowserLogin, AuthError>;
}

pub struct BrowserLoginProvider {
    automation: Arc<dyn BrowserAutomation>,
    session_path: PathBuf,
}

impl BrowserLoginProvider {
    pub fn new(automation: Arc<dyn BrowserAutomation>, session_path: PathBuf) -> Self {
        Self {
            automation,
            session_path,
        }
    }
}

#[async_trait]
impl AuthProvider for BrowserLoginProvider {
    async fn login(&self, credential: &Credential) -> Result<AccessToken, AuthError> {
        let second_factor = credential.second_factor();
        // Without a saved session the site always asks for a code.
        if second_factor.is_none() && !self.session_path.exists() {
            return Err(AuthError::SecondFactorRequired);
        }

        let login = self
            .automation
            .login(credential, second_factor, &self.session_path)
            .await?;
        if let Some(artifact) = login.session_artifact {
            write_atomic(&self.session_path, &artifact).map_err(|source| AuthError::Persist {
                path: self.session_path.clone(),
                source,
            })?;
            debug!(path = %self.session_path.display(), "session artifact updated");
        }
        Ok(login.token)
    }
}

/// Runs a login script (for example a Playwright driver) and reads
/// `{"token", "expiresAt"?, "sessionArtifact"?}` from its stdout.
///
/// Secrets travel through the child's environment, never its argv.
#[derive(Debug, Clone)]
pub struct CommandBrowserAutomation {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptOutput {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    session_artifact: Option<serde_json::Value>,
}

impl CommandBrowserAutomation {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a configured `[program, args...]` list.
    pub fn from_command_line(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), timeout))
    }
}

#[async_trait]
impl BrowserAutomation for CommandBrowserAutomation {
    async fn login(
        &self,
        credential: &Credential,
        second_factor: Option<&str>,
        session_artifact: &Path,
    ) -> Result<BrowserLogin, AuthError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(LOGIN_USERNAME_ENV, &credential.username)
            .env(LOGIN_PASSWORD_ENV, credential.secret())
            .env(LOGIN_SESSION_PATH_ENV, session_artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(code) = second_factor {
            command.env(LOGIN_SECOND_FACTOR_ENV, code);
        }

        info!(program = %self.program, "running browser login");
        let child = command.spawn().map_err(|err| AuthError::Interactive {
            message: format!("failed to start {}: {err}", self.program),
        })?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(AuthError::Interactive {
                    message: format!("{} failed: {err}", self.program),
                });
            }
            Err(_) => {
                return Err(AuthError::Interactive {
                    message: format!(
                        "{} did not finish within {}s",
                        self.program,
                        self.timeout.as_secs()
                    ),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim();
            return Err(AuthError::Interactive {
                message: format!("{} exited with {}: {reason}", self.program, output.status),
            });
        }

        let parsed: ScriptOutput =
            serde_json::from_slice(&output.stdout).map_err(|err| AuthError::Malformed {
                message: format!("login script output: {err}"),
            })?;
        if parsed.token.trim().is_empty() {
            return Err(AuthError::Malformed {
                message: "login script returned an empty token".to_string(),
            });
        }
        let session_artifact = parsed
            .session_artifact
            .map(|value| serde_json::to_vec_pretty(&value))
            .transpose()
            .map_err(|err| AuthError::Malformed {
                message: format!("session artifact: {err}"),
            })?;
        Ok(BrowserLogin {
            token: AccessToken::new(parsed.token.trim(), parsed.expires_at, Utc::now()),
            session_artifact,
        })
    }
}

/// Placeholder used when no login command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredBrowserAutomation;

#[async_trait]
impl BrowserAutomation for UnconfiguredBrowserAutomation {
    async fn login(
        &self,
        _credential: &Credential,
        _second_factor: Option<&str>,
        _session_artifact: &Path,
    ) -> Result<BrowserLogin, AuthError> {
        Err(AuthError::Interactive {
            message: "no browser login command configured (thermostat.login_command)".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceId;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingAutomation {
        seen_codes: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl BrowserAutomation for RecordingAutomation {
        async fn login(
            &self,
            _credential: &Credential,
            second_factor: Option<&str>,
            _session_artifact: &Path,
        ) -> Result<BrowserLogin, AuthError> {
            self.seen_codes
                .lock()
                .expect("lock")
                .push(second_factor.map(str::to_string));
            Ok(BrowserLogin {
                token: AccessToken::new("browser-token", None, Utc::now()),
                session_artifact: Some(br#"{"cookies":[]}"#.to_vec()),
            })
        }
    }

    fn provider(home: &TempDir) -> (BrowserLoginProvider, Arc<RecordingAutomation>) {
        let automation = Arc::new(RecordingAutomation {
            seen_codes: Mutex::new(Vec::new()),
        });
        let provider =
            BrowserLoginProvider::new(automation.clone(), home.path().join("thermostat_session.json"));
        (provider, automation)
    }

    #[tokio::test]
    async fn first_login_without_code_needs_second_factor() {
        let home = TempDir::new().expect("tempdir");
        let (provider, automation) = provider(&home);
        let credential = Credential::new(SourceId::Thermostat, "me", "pw");
        let err = provider.login(&credential).await.unwrap_err();
        assert_matches!(err, AuthError::SecondFactorRequired);
        assert!(automation.seen_codes.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn successful_login_persists_session_artifact() {
        let home = TempDir::new().expect("tempdir");
        let (provider, automation) = provider(&home);
        let credential =
            Credential::new(SourceId::Thermostat, "me", "pw").with_second_factor("424242");

        let token = provider.login(&credential).await.expect("token");
        assert_eq!(token.secret(), "browser-token");
        let saved = std::fs::read_to_string(home.path().join("thermostat_session.json"))
            .expect("session file");
        assert_eq!(saved, r#"{"cookies":[]}"#);

        // The saved session now lets a code-less login through.
        let plain = Credential::new(SourceId::Thermostat, "me", "pw");
        provider.login(&plain).await.expect("token");
        assert_eq!(
            *automation.seen_codes.lock().expect("lock"),
            vec![Some("424242".to_string()), None]
        );
    }

    #[tokio::test]
    async fn unconfigured_automation_reports_interactive_failure() {
        let home = TempDir::new().expect("tempdir");
        let credential = Credential::new(SourceId::Thermostat, "me", "pw");
        let err = UnconfiguredBrowserAutomation
            .login(&credential, Some("1"), &home.path().join("s.json"))
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::Interactive { .. });
    }

    #[cfg(unix)]
    mod command {
        use super::*;
        use pretty_assertions::assert_eq;

        fn sh(script: &str, timeout: Duration) -> CommandBrowserAutomation {
            CommandBrowserAutomation::new("sh", vec!["-c".to_string(), script.to_string()], timeout)
        }

        #[tokio::test]
        async fn reads_token_and_artifact_from_stdout() {
            let script = r#"printf '{"token":"%s-%s","sessionArtifact":{"origins":[]}}' "$USAGE_SYNC_LOGIN_USERNAME" "$USAGE_SYNC_LOGIN_SECOND_FACTOR""#;
            let credential = Credential::new(SourceId::Thermostat, "me", "pw");
            let login = sh(script, Duration::from_secs(10))
                .login(&credential, Some("777"), Path::new("/tmp/unused.json"))
                .await
                .expect("login");
            assert_eq!(login.token.secret(), "me-777");
            let artifact: serde_json::Value =
                serde_json::from_slice(&login.session_artifact.expect("artifact")).expect("json");
            assert_eq!(artifact, serde_json::json!({"origins": []}));
        }

        #[tokio::test]
        async fn failing_script_surfaces_its_last_stderr_line() {
            let credential = Credential::new(SourceId::Thermostat, "me", "pw");
            let err = sh("echo 'code rejected' >&2; exit 3", Duration::from_secs(10))
                .login(&credential, Some("1"), Path::new("/tmp/unused.json"))
                .await
                .unwrap_err();
            assert_matches!(err, AuthError::Interactive { ref message } if message.contains("code rejected"));
        }

        #[tokio::test]
        async fn hung_script_is_bounded_by_timeout() {
            let credential = Credential::new(SourceId::Thermostat, "me", "pw");
            let err = sh("sleep 5", Duration::from_millis(100))
                .login(&credential, None, Path::new("/tmp/unused.json"))
                .await
                .unwrap_err();
            assert_matches!(err, AuthError::Interactive { ref message } if message.contains("did not finish"));
        }
    }
}
