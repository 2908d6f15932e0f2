//! Incremental sync engine for a utility-usage portal and a thermostat
//! cloud API: authenticate, plan windows, fetch, normalize, merge.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod default_client;
pub mod error;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod sources;
mod store;
pub mod window;

pub use auth::AccessToken;
pub use auth::AuthManager;
pub use auth::AuthState;
pub use config::SyncConfig;
pub use config::find_home;
pub use credentials::Credential;
pub use credentials::CredentialStore;
pub use credentials::EnvCredentialStore;
pub use error::AuthError;
pub use error::FetchError;
pub use error::StoreError;
pub use model::Reading;
pub use model::Series;
pub use model::SourceId;
pub use model::SourceState;
pub use orchestrator::CheckOutcome;
pub use orchestrator::SourceSummary;
pub use orchestrator::SyncOrchestrator;
pub use orchestrator::SyncOutcome;
pub use store::CheckpointStore;
pub use store::MergeSummary;
pub use window::SyncWindow;
