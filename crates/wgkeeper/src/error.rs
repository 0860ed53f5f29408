//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and distinct exit codes.

use miette::Diagnostic;
use thiserror::Error;

use wgkeeper_config::ConfigError;
use wgkeeper_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file not found")]
    #[diagnostic(
        code(wgkeeper::no_config),
        help(
            "Create one or point at it with --config / WGKEEPER_CONFIG.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(wgkeeper::validation))]
    Validation { field: String, reason: String },

    #[error("No password configured for backend '{backend}'")]
    #[diagnostic(
        code(wgkeeper::no_credentials),
        help(
            "Set password_env, store it in the OS keyring under service 'wgkeeper'\n\
             and entry '{backend}/password', or set password in the config file."
        )
    )]
    NoCredentials { backend: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(code(wgkeeper::config))]
    Config { message: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(wgkeeper::not_found), help("Run: wgkeeper {list_command}"))]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("{message}")]
    #[diagnostic(code(wgkeeper::conflict))]
    Conflict { message: String },

    #[error("Address pool of tunnel {tunnel} ({network}) is exhausted")]
    #[diagnostic(
        code(wgkeeper::addresses_exhausted),
        help("Delete unused peers or widen the interface network on the device.")
    )]
    AddressesExhausted { tunnel: String, network: String },

    // ── Device ───────────────────────────────────────────────────────
    #[error("No connection available to backend {backend}")]
    #[diagnostic(
        code(wgkeeper::unavailable),
        help("All pooled sessions are busy. Retry, or raise pool_size for this backend.")
    )]
    Unavailable { backend: String },

    #[error("Device error: {message}")]
    #[diagnostic(
        code(wgkeeper::device),
        help("Check that the router API service is enabled and reachable.")
    )]
    Device { message: String },

    #[error("Authentication failed: {message}")]
    #[diagnostic(code(wgkeeper::auth_failed))]
    AuthFailed { message: String },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(wgkeeper::internal))]
    Internal { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Cannot render JSON: {0}")]
    #[diagnostic(code(wgkeeper::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unavailable { .. } | Self::Device { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } | Self::AddressesExhausted { .. } => exit_code::CONFLICT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound {
                entity_type,
                identifier,
            } => {
                let list_command = match entity_type.as_str() {
                    "Peer" => "peer list",
                    "Tunnel" | "Profile" => "tunnels",
                    _ => "config check",
                };
                CliError::NotFound {
                    resource_type: entity_type,
                    identifier,
                    list_command: list_command.into(),
                }
            }
            CoreError::AlreadyExists { message } => CliError::Conflict { message },
            CoreError::Unavailable { backend } => CliError::Unavailable { backend },
            CoreError::AddressesExhausted { tunnel, network } => CliError::AddressesExhausted { tunnel, network },
            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "request".into(),
                reason: message,
            },
            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },
            CoreError::Transient { message } => CliError::Device { message },
            CoreError::Config { message } => CliError::Config { message },
            other @ (CoreError::Repository { .. } | CoreError::QueueClosed | CoreError::Internal(_)) => {
                CliError::Internal {
                    message: other.to_string(),
                }
            }
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound { path } => CliError::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoCredentials { backend } => CliError::NoCredentials { backend },
            other @ (ConfigError::Serialization(_) | ConfigError::Figment(_)) => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_exit_codes() {
        let not_found: CliError = CoreError::not_found("Peer", "42").into();
        assert_eq!(not_found.exit_code(), exit_code::NOT_FOUND);
        assert!(matches!(not_found, CliError::NotFound { ref list_command, .. } if list_command == "peer list"));

        let bad_psk: CliError = CoreError::validation("preshared key must be 32 bytes").into();
        assert_eq!(bad_psk.exit_code(), exit_code::USAGE);

        let busy: CliError = CoreError::Unavailable { backend: "edge".into() }.into();
        assert_eq!(busy.exit_code(), exit_code::CONNECTION);

        let internal: CliError = CoreError::QueueClosed.into();
        assert_eq!(internal.exit_code(), exit_code::GENERAL);
    }

    #[test]
    fn missing_config_names_the_path() {
        let err: CliError = ConfigError::NotFound {
            path: "/etc/wgkeeper.toml".into(),
        }
        .into();
        assert!(matches!(err, CliError::NoConfig { ref path } if path == "/etc/wgkeeper.toml"));
    }
}
