//! Executes requests against a source with bounded retry and polling.

mod poll;

pub use poll::PollMachine;
pub use poll::PollPolicy;
pub use poll::PollState;

use std::future::Future;
use std::time::Duration;

use reqwest::RequestBuilder;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

use crate::error::FetchError;
use crate::error::ParseError;

/// Number of body bytes quoted in parse errors.
const BODY_SNIPPET_LEN: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Responses of a submit/poll endpoint expose whether the job is done.
pub trait PollStatus {
    fn is_complete(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, retry: RetryPolicy, poll: PollPolicy) -> Self {
        Self {
            client,
            retry,
            poll,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends the request built by `build` and decodes a JSON body.
    ///
    /// Server errors and connect/timeout failures are retried after a fixed
    /// delay up to the retry ceiling. An auth rejection is returned straight
    /// away so the orchestrator can re-authenticate.
    pub async fn execute<T, F>(&self, endpoint: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.retrying(endpoint, || self.execute_once(endpoint, &build))
            .await
    }

    /// Same retry rules as [`Self::execute`], returning the raw body.
    pub async fn download<F>(&self, endpoint: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.retrying(endpoint, || self.download_once(endpoint, &build))
            .await
    }

    async fn retrying<T, Op, Fut>(&self, endpoint: &str, op: Op) -> Result<T, FetchError>
    where
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(endpoint, attempt, error = %err, "transient failure, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send<F>(&self, endpoint: &str, build: &F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let response = build(&self.client)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "response received");
        check_status(endpoint, status)?;
        Ok(response)
    }

    async fn execute_once<T, F>(&self, endpoint: &str, build: &F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let body = self
            .send(endpoint, build)
            .await?
            .text()
            .await
            .map_err(|source| FetchError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        decode_body(endpoint, &body)
    }

    async fn download_once<F>(&self, endpoint: &str, build: &F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let bytes = self
            .send(endpoint, build)
            .await?
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        Ok(bytes.to_vec())
    }

    /// Submits a report job and re-polls it until it reports completion or
    /// the poll budget runs out.
    pub async fn submit_and_poll<T, F>(&self, endpoint: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned + PollStatus,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut machine = PollMachine::new(self.poll);
        loop {
            let response: T = self.execute(endpoint, &build).await?;
            match machine.observe(response.is_complete()) {
                PollState::Complete => return Ok(response),
                PollState::TimedOut { polls } => {
                    return Err(FetchError::PollTimeout {
                        endpoint: endpoint.to_string(),
                        polls,
                    });
                }
                PollState::Polling { polls } => {
                    debug!(endpoint, polls, "report job still running");
                    tokio::time::sleep(self.poll.interval).await;
                }
                PollState::Pending => {}
            }
        }
    }
}

fn check_status(endpoint: &str, status: StatusCode) -> Result<(), FetchError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(FetchError::AuthRejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    if status.is_server_error() {
        return Err(FetchError::TransientHttp {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(FetchError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

pub(crate) fn decode_body<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|err| {
        let snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
        FetchError::Parse(ParseError::new(
            endpoint,
            format!("{err}; body starts with {snippet:?}"),
        ))
    })
}
