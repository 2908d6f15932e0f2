//! Per-source secrets. Nothing here is ever written to disk.

use std::collections::HashMap;
use std::fmt;

use zeroize::Zeroizing;

use crate::error::CredentialError;
use crate::model::SourceId;

#[derive(Clone)]
pub struct Credential {
    pub source: SourceId,
    pub username: String,
    secret: Zeroizing<String>,
    second_factor: Option<Zeroizing<String>>,
}

impl Credential {
    pub fn new(source: SourceId, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            source,
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
            second_factor: None,
        }
    }

    pub fn with_second_factor(mut self, code: impl Into<String>) -> Self {
        let code = code.into();
        self.second_factor = if code.trim().is_empty() {
            None
        } else {
            Some(Zeroizing::new(code))
        };
        self
    }

    pub fn secret(&self) -> &str {
        self.secret.as_str()
    }

    pub fn second_factor(&self) -> Option<&str> {
        self.second_factor.as_ref().map(|code| code.as_str())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field(
                "second_factor",
                &self.second_factor.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, source: SourceId) -> Result<Credential, CredentialError>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `USAGE_SYNC_<SOURCE>_USERNAME`, `_PASSWORD` and the optional
/// `_SECOND_FACTOR` from the process environment.
pub struct EnvCredentialStore {
    lookup: Lookup,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn required(&self, source: SourceId, suffix: &str) -> Result<String, CredentialError> {
        let variable = format!("{}_{suffix}", source.env_prefix());
        (self.lookup)(&variable)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(CredentialError::Missing {
                source_id: source,
                variable,
            })
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get_credential(&self, source: SourceId) -> Result<Credential, CredentialError> {
        let username = self.required(source, "USERNAME")?;
        let password = self.required(source, "PASSWORD")?;
        let mut credential = Credential::new(source, username, password);
        if let Ok(code) = self.required(source, "SECOND_FACTOR") {
            credential = credential.with_second_factor(code);
        }
        Ok(credential)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    entries: HashMap<SourceId, Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential: Credential) -> Self {
        self.insert(credential);
        self
    }

    pub fn insert(&mut self, credential: Credential) {
        self.entries.insert(credential.source, credential);
    }
}

impl CredentialStore for StaticCredentialStore {
    fn get_credential(&self, source: SourceId) -> Result<Credential, CredentialError> {
        self.entries
            .get(&source)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                source_id: source,
                variable: format!("{}_USERNAME", source.env_prefix()),
            })
    }
}
