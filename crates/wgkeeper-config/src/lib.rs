//! Configuration for wgkeeper.
//!
//! A TOML file overlaid with `WGKEEPER_` environment variables, backend
//! password resolution (env var, OS keyring, plaintext), validation, and
//! translation to `wgkeeper_core::ServiceConfig`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use ipnet::IpNet;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wgkeeper_api::{ClientConfig, DEFAULT_CAPACITY, DEFAULT_DIAL_TIMEOUT, DEFAULT_IDLE_TIMEOUT, PoolConfig};
use wgkeeper_core::{
    BackendConfig, EndpointConfig, ProfileConfig, ServiceConfig, TunnelConfig, UserConfig,
    config::{DEFAULT_KEY_ATTEMPTS, DEFAULT_RECONCILE_INTERVAL, DEFAULT_TASK_QUEUE_SIZE},
};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WGKEEPER_CONFIG";

const ENV_PREFIX: &str = "WGKEEPER_";
const KEYRING_SERVICE: &str = "wgkeeper";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no password configured for backend '{backend}'")]
    NoCredentials { backend: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub backends: Vec<BackendEntry>,

    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,

    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSection {
    /// Seconds between reconciliation passes; 0 disables them.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,

    #[serde(default = "default_key_attempts")]
    pub key_attempts: u32,

    /// JSON snapshot of peers and interfaces.
    pub state_file: Option<PathBuf>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            task_queue_size: default_task_queue_size(),
            key_attempts: default_key_attempts(),
            state_file: None,
        }
    }
}

fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL.as_secs()
}
fn default_task_queue_size() -> usize {
    DEFAULT_TASK_QUEUE_SIZE
}
fn default_key_attempts() -> u32 {
    DEFAULT_KEY_ATTEMPTS
}

/// A RouterOS device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendEntry {
    pub name: String,

    /// `host` or `host:port` of the API service.
    pub address: String,

    pub username: String,

    /// Plaintext password (prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable containing the password.
    pub password_env: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Public endpoint host handed to clients.
    pub endpoint_host: Option<String>,

    /// Interface whose address is the public endpoint.
    pub source_interface: Option<String>,

    /// Use the device's cloud DDNS name as a last resort.
    #[serde(default)]
    pub use_cloud: bool,
}

fn default_pool_size() -> usize {
    DEFAULT_CAPACITY
}
fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}
fn default_dial_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelEntry {
    pub name: String,
    pub backend: String,

    /// WireGuard interface on the device; defaults to the tunnel name.
    pub interface: Option<String>,

    #[serde(default)]
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileEntry {
    pub name: String,

    /// CIDR ranges granted to peers of this profile.
    #[serde(default)]
    pub ranges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserEntry {
    pub username: String,
    pub password: Option<String>,
}

// ── Config file path ────────────────────────────────────────────────

/// Platform config location, e.g. `~/.config/wgkeeper/config.toml`.
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("net", "wgkeeper", "wgkeeper").map_or_else(
        || PathBuf::from("wgkeeper.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Explicit path, else `WGKEEPER_CONFIG`, else the platform default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

// ── Config loading ──────────────────────────────────────────────────

/// Load a config file overlaid with `WGKEEPER_` environment variables.
/// Nested keys use `__`, e.g. `WGKEEPER_SERVICE__KEY_ATTEMPTS=5`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]));

    let config: Config = figment.extract()?;
    Ok(config)
}

impl Config {
    /// Check cross-references and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.task_queue_size == 0 {
            return Err(invalid("service.task_queue_size", "must be at least 1"));
        }
        if self.service.key_attempts == 0 {
            return Err(invalid("service.key_attempts", "must be at least 1"));
        }

        let mut backends = BTreeSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(invalid("backends.name", "must not be empty"));
            }
            if !backends.insert(backend.name.as_str()) {
                return Err(invalid("backends.name", format!("duplicate backend '{}'", backend.name)));
            }
            if backend.address.trim().is_empty() {
                return Err(invalid(format!("backends.{}.address", backend.name), "must not be empty"));
            }
            if backend.pool_size == 0 {
                return Err(invalid(format!("backends.{}.pool_size", backend.name), "must be at least 1"));
            }
        }

        let mut tunnels = BTreeSet::new();
        for tunnel in &self.tunnels {
            if tunnel.name.trim().is_empty() {
                return Err(invalid("tunnels.name", "must not be empty"));
            }
            if !tunnels.insert(tunnel.name.as_str()) {
                return Err(invalid("tunnels.name", format!("duplicate tunnel '{}'", tunnel.name)));
            }
            if !backends.contains(tunnel.backend.as_str()) {
                return Err(invalid(
                    format!("tunnels.{}.backend", tunnel.name),
                    format!("unknown backend '{}'", tunnel.backend),
                ));
            }
            let mut profiles = BTreeSet::new();
            for profile in &tunnel.profiles {
                if !profiles.insert(profile.name.as_str()) {
                    return Err(invalid(
                        format!("tunnels.{}.profiles", tunnel.name),
                        format!("duplicate profile '{}'", profile.name),
                    ));
                }
                parse_ranges(&tunnel.name, profile)?;
            }
        }

        let mut users = BTreeSet::new();
        for user in &self.users {
            if !users.insert(user.username.as_str()) {
                return Err(invalid("users.username", format!("duplicate user '{}'", user.username)));
            }
        }
        Ok(())
    }

    /// Validate, resolve backend passwords, and build the runtime config.
    pub fn to_service_config(&self) -> Result<ServiceConfig, ConfigError> {
        self.validate()?;

        let backends = self
            .backends
            .iter()
            .map(|b| backend_config(b, resolve_password(b)?))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let tunnels = self
            .tunnels
            .iter()
            .map(|t| {
                let profiles = t
                    .profiles
                    .iter()
                    .map(|p| {
                        Ok(ProfileConfig {
                            name: p.name.clone(),
                            ranges: parse_ranges(&t.name, p)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok(TunnelConfig {
                    name: t.name.clone(),
                    backend: t.backend.clone(),
                    interface: t.interface.clone().unwrap_or_else(|| t.name.clone()),
                    profiles,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let users = self
            .users
            .iter()
            .map(|u| UserConfig {
                username: u.username.clone(),
                password: u.password.clone().map(SecretString::from),
            })
            .collect();

        Ok(ServiceConfig {
            reconcile_interval: Duration::from_secs(self.service.reconcile_interval_secs),
            task_queue_size: self.service.task_queue_size,
            key_attempts: self.service.key_attempts,
            state_file: self.service.state_file.clone(),
            backends,
            tunnels,
            users,
        })
    }

    /// TOML rendering with every password replaced by `***`.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut redacted = self.clone();
        for backend in &mut redacted.backends {
            if backend.password.is_some() {
                backend.password = Some("***".into());
            }
        }
        for user in &mut redacted.users {
            if user.password.is_some() {
                user.password = Some("***".into());
            }
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}

fn parse_ranges(tunnel: &str, profile: &ProfileEntry) -> Result<Vec<IpNet>, ConfigError> {
    profile
        .ranges
        .iter()
        .map(|r| {
            r.trim().parse::<IpNet>().map_err(|_| {
                invalid(
                    format!("tunnels.{tunnel}.profiles.{}.ranges", profile.name),
                    format!("'{r}' is not a CIDR range"),
                )
            })
        })
        .collect()
}

fn backend_config(entry: &BackendEntry, password: SecretString) -> Result<BackendConfig, ConfigError> {
    let mut client = ClientConfig::new(&entry.address, entry.username.clone(), password);
    if entry.dial_timeout_secs == 0 {
        return Err(invalid(format!("backends.{}.dial_timeout_secs", entry.name), "must be at least 1"));
    }
    client.dial_timeout = Duration::from_secs(entry.dial_timeout_secs);

    let mut pool = PoolConfig::new(client);
    pool.capacity = entry.pool_size;
    pool.idle_timeout = Duration::from_secs(entry.idle_timeout_secs);

    Ok(BackendConfig {
        name: entry.name.clone(),
        pool,
        endpoint: EndpointConfig {
            host: entry.endpoint_host.clone(),
            source_interface: entry.source_interface.clone(),
            use_cloud: entry.use_cloud,
        },
    })
}

// ── Credential resolution ───────────────────────────────────────────

/// `password_env` → keyring (`wgkeeper`, `<backend>/password`) → plaintext.
pub fn resolve_password(backend: &BackendEntry) -> Result<SecretString, ConfigError> {
    resolve_password_with(backend, |name| std::env::var(name).ok(), keyring_password)
}

fn keyring_password(backend: &str) -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{backend}/password"))
        .ok()?
        .get_password()
        .ok()
}

fn resolve_password_with(
    backend: &BackendEntry,
    env: impl Fn(&str) -> Option<String>,
    keyring: impl Fn(&str) -> Option<String>,
) -> Result<SecretString, ConfigError> {
    // 1. Env var named by the backend
    if let Some(value) = backend.password_env.as_deref().and_then(&env) {
        return Ok(SecretString::from(value));
    }

    // 2. System keyring
    if let Some(value) = keyring(&backend.name) {
        return Ok(SecretString::from(value));
    }

    // 3. Plaintext in config
    if let Some(ref value) = backend.password {
        return Ok(SecretString::from(value.clone()));
    }

    Err(ConfigError::NoCredentials {
        backend: backend.name.clone(),
    })
}
