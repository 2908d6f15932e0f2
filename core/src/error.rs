use std::path::PathBuf;

use thiserror::Error;

use crate::model::SourceId;

/// Payload did not match the schema the normalizer expects.
#[derive(Debug, Error)]
#[error("unexpected payload from {context}: {message}")]
pub struct ParseError {
    pub context: String,
    pub message: String,
}

impl ParseError {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential configured for {source_id} (set {variable})")]
    Missing { source_id: SourceId, variable: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("credentials rejected: {reason}")]
    Rejected { reason: String },
    #[error("a second-factor code is required and none was supplied")]
    SecondFactorRequired,
    #[error("interactive login step failed: {message}")]
    Interactive { message: String },
    #[error("token response was malformed: {message}")]
    Malformed { message: String },
    #[error("login request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to persist session artifact {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single request or report job.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server error {status} from {endpoint}")]
    TransientHttp { endpoint: String, status: u16 },
    #[error("{endpoint} rejected the access token ({status})")]
    AuthRejected { endpoint: String, status: u16 },
    #[error("report job at {endpoint} still pending after {polls} polls")]
    PollTimeout { endpoint: String, polls: u32 },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{endpoint} returned {status}")]
    Http { endpoint: String, status: u16 },
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// Whether the Fetcher may repeat the same request locally.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::TransientHttp { .. } => true,
            FetchError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            FetchError::AuthRejected { .. }
            | FetchError::PollTimeout { .. }
            | FetchError::Parse(_)
            | FetchError::Http { .. } => false,
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, FetchError::AuthRejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a valid data file: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} contains an invalid entry: {message}")]
    InvalidEntry { path: PathBuf, message: String },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("could not determine a home directory; set USAGE_SYNC_HOME")]
    NoHome,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
