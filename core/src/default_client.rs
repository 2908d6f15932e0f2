use std::time::Duration;

pub const USER_AGENT: &str = concat!("usage-sync/", env!("CARGO_PKG_VERSION"));

/// Shared client for token-authenticated API calls.
pub fn create_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Client that keeps cookies across requests, for form-based logins.
pub fn create_session_client(
    timeout: Duration,
    user_agent: &str,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .cookie_store(true)
        .build()
}
