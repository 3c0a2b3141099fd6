use thiserror::Error;

/// Top-level application error type
///
/// Every error that can surface at the HTTP boundary is a variant here;
/// the web layer maps each variant to exactly one status code.
#[derive(Error, Debug)]
pub enum AmpsError {
    /// Missing or invalid authentication token
    #[error("unauthorized: valid token required")]
    Unauthorized,

    /// Region check failed
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Resource not found errors
    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    /// CRUD id collision
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Malformed request body, unknown variant, bad schedule, ...
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Transcoder failed to start or exceeded its restart budget
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Configuration errors, fatal at boot
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Relay layer errors
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Transcoder manager specific errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Variant name is not valid against the parent channel's variant set
    #[error("channel {channel} has no variant '{variant}'")]
    BadVariant { channel: u32, variant: String },

    /// Channel has neither a resolvable profile nor an inline command
    #[error("channel {channel} has no usable launch configuration: {message}")]
    NoLaunchSpec { channel: u32, message: String },

    /// Child process could not be spawned
    #[error("failed to spawn transcoder: {message}")]
    SpawnFailed { message: String },

    /// Child exited inside the spawn health window
    #[error("transcoder exited during startup: {message}")]
    StartupExit { message: String },

    /// Source resolver failed or timed out
    #[error("source resolution failed: {message}")]
    ResolveFailed { message: String },

    /// Restart budget exhausted; record is a `Failed` sink
    #[error("transcoder for {key} exceeded its restart budget")]
    RestartBudgetExhausted { key: String },

    /// No live record for the given stream key
    #[error("no live transcoder for {key}")]
    RecordNotFound { key: String },

    /// Record refused new subscribers (stopping or failed)
    #[error("transcoder for {key} is not accepting subscribers")]
    NotAccepting { key: String },

    /// Manager is shutting down
    #[error("transcoder manager is shutting down")]
    ShuttingDown,

    /// I/O errors talking to the child process
    #[error("transcoder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmpsError {
    pub fn not_found(resource: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
