use thiserror::Error;

/// Top-level error type for the `wgkeeper-api` crate.
///
/// Covers every failure mode of the RouterOS API surface: dialing,
/// authentication, framing, device-reported traps, and pool bookkeeping.
/// `wgkeeper-core` maps these into its domain taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket read/write failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect failed (refused, unreachable, DNS failure).
    #[error("Cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// Dialing did not complete within the configured timeout.
    #[error("Connection to {address} timed out after {timeout_secs}s")]
    Timeout { address: String, timeout_secs: u64 },

    // ── Authentication ──────────────────────────────────────────────
    /// `/login` was rejected by the device.
    #[error("Login failed: {message}")]
    Login { message: String },

    // ── Device replies ──────────────────────────────────────────────
    /// The device answered with a `!trap` sentence.
    #[error("Device error: {message}")]
    Trap {
        message: String,
        category: Option<String>,
    },

    /// The device answered with `!fatal` and closed the connection.
    #[error("Fatal device error: {0}")]
    Fatal(String),

    /// Malformed framing or an unexpected reply word.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ── Pool ────────────────────────────────────────────────────────
    /// The pool was closed; no further clients are handed out.
    #[error("Client pool for {address} is closed")]
    PoolClosed { address: String },

    /// Every slot is busy; the caller must treat this as "unavailable".
    #[error("All {capacity} connections to {address} are in use")]
    PoolExhausted { address: String, capacity: usize },

    /// A client was released that this pool never handed out.
    #[error("Released client #{slot} is not tracked by the pool for {address}")]
    UntrackedClient { address: String, slot: u64 },
}

impl Error {
    /// The device reported that the entry being added already exists.
    pub fn is_already_exists(&self) -> bool {
        self.trap_contains("entry already exists")
    }

    /// The device reported that the referenced item does not exist.
    pub fn is_no_such_item(&self) -> bool {
        self.trap_contains("no such item")
    }

    /// Returns `true` if the connection that produced this error can no
    /// longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Fatal(_) | Self::Protocol(_))
    }

    /// The opaque device message, if this error came from a `!trap`.
    pub fn device_message(&self) -> Option<&str> {
        match self {
            Self::Trap { message, .. } => Some(message),
            _ => None,
        }
    }

    fn trap_contains(&self, phrase: &str) -> bool {
        self.device_message()
            .is_some_and(|m| m.to_lowercase().contains(phrase))
    }
}
