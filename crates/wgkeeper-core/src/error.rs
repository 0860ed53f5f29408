// ── Core error types ──
//
// Domain errors for wgkeeper-core. Callers never see raw protocol
// sentences; the `From<wgkeeper_api::Error>` impl classifies device
// failures into the sentinels the state machine acts on.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    /// The device already holds an entry with this identity. Drives the
    /// keypair retry loop; never surfaced for creation.
    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    // ── Capacity errors ──────────────────────────────────────────────
    #[error("No device connection available for backend {backend}")]
    Unavailable { backend: String },

    #[error("Address pool for tunnel {tunnel} ({network}) is exhausted")]
    AddressesExhausted { tunnel: String, network: String },

    // ── Request errors ───────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Device / network errors (opaque) ─────────────────────────────
    #[error("{message}")]
    Transient { message: String },

    // ── Collaborator errors ──────────────────────────────────────────
    #[error("Repository error: {message}")]
    Repository { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity_type: &str, identifier: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_owned(),
            identifier: identifier.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    pub fn repository(message: impl std::fmt::Display) -> Self {
        Self::Repository {
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

// ── Conversion from protocol errors ──────────────────────────────────

impl From<wgkeeper_api::Error> for CoreError {
    fn from(err: wgkeeper_api::Error) -> Self {
        if err.is_already_exists() {
            return CoreError::AlreadyExists {
                message: err.device_message().unwrap_or_default().to_owned(),
            };
        }
        if err.is_no_such_item() {
            return CoreError::NotFound {
                entity_type: "Remote item".into(),
                identifier: err.device_message().unwrap_or_default().to_owned(),
            };
        }
        match err {
            wgkeeper_api::Error::PoolExhausted { address, .. } => {
                CoreError::Unavailable { backend: address }
            }
            wgkeeper_api::Error::Trap { message, .. } => CoreError::Transient { message },
            other => CoreError::Transient {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Repository {
            message: format!("snapshot encoding: {err}"),
        }
    }
}
