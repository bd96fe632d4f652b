//! Error types for the engine.
//!
//! Library-level errors are wrapped with the operation that failed and
//! propagated upward. Handlers report errors to the dispatcher, which marks
//! the task `error` and keeps draining the queue; provider failures inside
//! the planner never surface here at all (they become a synthetic `ask`
//! task). The only fatal errors are the startup ones: opening the database,
//! running migrations, connecting the Docker client, spawning the browser.

use std::time::Duration;

use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence gateway errors. The gateway does not retry; callers decide.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database operation '{op}' timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("database operation '{op}' failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("database pool unavailable: {reason}")]
    Pool { reason: String },

    #[error("database row for '{op}' could not be decoded: {reason}")]
    Decode { op: &'static str, reason: String },
}

/// Sandbox container runtime errors. Carries the runtime container id where
/// one is known.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker {op} failed for container '{container_id}': {source}")]
    Runtime {
        op: &'static str,
        container_id: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("docker client unavailable: {source}")]
    Client {
        #[source]
        source: bollard::errors::Error,
    },

    #[error("sandbox container for flow {flow_id} is not running")]
    NotRunning { flow_id: i64 },

    #[error("failed to build file archive for '{path}': {source}")]
    Archive {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Headless-browser control errors.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("could not connect to the browser (tried {attempts} endpoint(s), last: {last})")]
    Connect { attempts: usize, last: String },

    #[error("browser page operation '{op}' failed: {reason}")]
    Page { op: &'static str, reason: String },

    #[error("navigation to '{url}' failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("failed to write screenshot: {source}")]
    Screenshot {
        #[source]
        source: std::io::Error,
    },
}

/// LLM provider errors. `provider` names the backend; `is_retryable`
/// classifies transient failures for callers that want to fail over.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider {provider}: request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("provider {provider}: rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("provider {provider}: authentication failed")]
    AuthFailed { provider: String },

    #[error("provider {provider}: invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("provider {provider}: timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("unknown provider tag '{tag}'")]
    UnknownProvider { tag: String },
}

impl LlmError {
    /// The backend the error came from, or "unknown" for factory failures.
    pub fn provider(&self) -> &str {
        match self {
            Self::RequestFailed { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::AuthFailed { provider }
            | Self::InvalidResponse { provider, .. }
            | Self::Timeout { provider, .. } => provider,
            Self::UnknownProvider { .. } => "unknown",
        }
    }

    /// Transient errors are worth retrying on a fresh request; auth and
    /// factory failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. }
                | Self::RateLimited { .. }
                | Self::InvalidResponse { .. }
                | Self::Timeout { .. }
        )
    }
}

/// A rejected input, carrying the field that failed.
#[derive(Debug, Error)]
#[error("validation failed for {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Coarse error classification exposed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Unauthorized,
    Internal,
    Timeout,
    Unavailable,
    RateLimited,
    Provider,
    Container,
    Validation,
}

/// Unified engine error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::InvalidInput,
            Self::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Store(StoreError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Store(_) => ErrorKind::Internal,
            Self::Sandbox(SandboxError::NotRunning { .. }) => ErrorKind::Unavailable,
            Self::Sandbox(_) => ErrorKind::Container,
            Self::Browser(_) => ErrorKind::Unavailable,
            Self::Llm(LlmError::RateLimited { .. }) => ErrorKind::RateLimited,
            Self::Llm(LlmError::AuthFailed { .. }) => ErrorKind::Unauthorized,
            Self::Llm(LlmError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Llm(_) => ErrorKind::Provider,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
