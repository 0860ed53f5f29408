// ── Runtime service configuration ──
//
// These types describe what the service manages and how to reach each
// backend. They carry credentials but never touch disk; `wgkeeper-config`
// builds a `ServiceConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use secrecy::SecretString;
use wgkeeper_api::PoolConfig;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TASK_QUEUE_SIZE: usize = 64;
pub const DEFAULT_KEY_ATTEMPTS: u32 = 3;

/// Everything the service needs to run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Period of the reconciliation pass. Zero disables the ticker.
    pub reconcile_interval: Duration,
    pub task_queue_size: usize,
    /// Keypairs tried before a creation collision is terminal.
    pub key_attempts: u32,
    /// JSON snapshot backing the in-memory store, if any.
    pub state_file: Option<PathBuf>,
    pub backends: Vec<BackendConfig>,
    pub tunnels: Vec<TunnelConfig>,
    pub users: Vec<UserConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            task_queue_size: DEFAULT_TASK_QUEUE_SIZE,
            key_attempts: DEFAULT_KEY_ATTEMPTS,
            state_file: None,
            backends: Vec::new(),
            tunnels: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// One router and the pool used to talk to it.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub pool: PoolConfig,
    pub endpoint: EndpointConfig,
}

/// Where the public endpoint host of a tunnel comes from, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Explicit host name or address.
    pub host: Option<String>,
    /// Interface whose current address is the public one.
    pub source_interface: Option<String>,
    /// Fall back to the device's cloud / DDNS address.
    pub use_cloud: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub backend: String,
    /// Device interface name; usually the tunnel name.
    pub interface: String,
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileConfig {
    pub name: String,
    pub ranges: Vec<IpNet>,
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: Option<SecretString>,
}
