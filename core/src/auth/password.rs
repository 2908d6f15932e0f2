use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::AccessToken;
use super::AuthProvider;
use crate::credentials::Credential;
use crate::default_client::create_session_client;
use crate::error::AuthError;

/// The portal serves its login form only to browser-like agents.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

/// Cookie login followed by a username/password token exchange.
#[derive(Debug, Clone)]
pub struct PortalPasswordProvider {
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenExchange {
    #[serde(default)]
    authorization_token: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    expiration: Option<i64>,
}

impl PortalPasswordProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn open_session(
        &self,
        client: &reqwest::Client,
        credential: &Credential,
    ) -> Result<(), AuthError> {
        let response = client
            .post(format!("{}/login", self.base_url))
            .form(&[
                ("username", credential.username.as_str()),
                ("password", credential.secret()),
            ])
            .send()
            .await?;
        let landed = response.url().as_str();
        debug!(status = response.status().as_u16(), "portal login submitted");
        if landed.contains("/ui/") || landed.to_ascii_lowercase().contains("dashboard") {
            Ok(())
        } else {
            Err(AuthError::Rejected {
                reason: format!("login did not reach the dashboard (ended at {})", response.url().path()),
            })
        }
    }
}

#[async_trait]
impl AuthProvider for PortalPasswordProvider {
    async fn login(&self, credential: &Credential) -> Result<AccessToken, AuthError> {
        // A fresh cookie jar per attempt so a stale session never leaks in.
        let client = create_session_client(self.timeout, BROWSER_USER_AGENT)?;
        self.open_session(&client, credential).await?;

        let response = client
            .post(format!("{}/services/oauth/auth/v2", self.base_url))
            .form(&[
                ("userId", credential.username.as_str()),
                ("password", credential.secret()),
            ])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected {
                reason: format!("token exchange returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(AuthError::Malformed {
                message: format!("token exchange returned {status}"),
            });
        }
        let body: TokenExchange = response.json().await.map_err(|err| AuthError::Malformed {
            message: err.to_string(),
        })?;

        let value = body
            .authorization_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::Malformed {
                message: "authorizationToken missing".to_string(),
            })?;
        let expires_at = body
            .expiration
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Ok(AccessToken::new(value, expires_at, Utc::now()))
    }
}
