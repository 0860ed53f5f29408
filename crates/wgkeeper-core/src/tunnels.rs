// ── Tunnel directory ──
//
// In-memory registry of configured tunnels. `refresh()` pulls the live
// interface state from each backend, persists interface records on first
// sight or change, and reports transitions to the registered listener.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::CoreError;
use crate::model::{Profile, ProfileId, Tunnel, TunnelId, TunnelInterface};
use crate::provider::ProviderRegistry;
use crate::repository::{InterfaceRecord, InterfaceRepository};

/// A change in a tunnel interface observed during refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Present before, absent now.
    Down(TunnelId),
    /// Absent before, present now. Never sent on first sight.
    Up(TunnelId),
    /// Endpoint or public key changed while present.
    ConfigChanged(TunnelId),
}

/// Receives tunnel transitions. Called from inside `refresh()`, so
/// implementations must not block.
pub trait TunnelListener: Send + Sync {
    fn on_tunnel_event(&self, event: TunnelEvent);
}

pub(crate) fn build_tunnel(config: &TunnelConfig) -> Tunnel {
    let profiles = config
        .profiles
        .iter()
        .map(|p| {
            let id = ProfileId::from_names(&config.name, &p.name);
            (
                id,
                Profile {
                    id,
                    name: p.name.clone(),
                    ranges: p.ranges.clone(),
                },
            )
        })
        .collect();
    Tunnel {
        id: TunnelId::from_name(&config.name),
        name: config.name.clone(),
        backend: config.backend.clone(),
        interface: TunnelInterface {
            name: config.interface.clone(),
            ..TunnelInterface::default()
        },
        profiles,
    }
}

/// Registry of configured tunnels and their live interface state.
pub struct TunnelDirectory {
    tunnels: DashMap<TunnelId, Tunnel>,
    providers: Arc<ProviderRegistry>,
    interfaces: Arc<dyn InterfaceRepository>,
    listener: RwLock<Option<Arc<dyn TunnelListener>>>,
}

impl TunnelDirectory {
    /// Build from configuration. Every tunnel must name a known backend.
    pub fn new(
        configs: &[TunnelConfig],
        providers: Arc<ProviderRegistry>,
        interfaces: Arc<dyn InterfaceRepository>,
    ) -> Result<Self, CoreError> {
        let tunnels = DashMap::new();
        for config in configs {
            if !providers.contains(&config.backend) {
                return Err(CoreError::Config {
                    message: format!(
                        "tunnel '{}' references unknown backend '{}'",
                        config.name, config.backend
                    ),
                });
            }
            let tunnel = build_tunnel(config);
            if tunnels.insert(tunnel.id, tunnel).is_some() {
                return Err(CoreError::Config {
                    message: format!("tunnel '{}' is configured twice", config.name),
                });
            }
        }
        Ok(Self {
            tunnels,
            providers,
            interfaces,
            listener: RwLock::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn TunnelListener>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = Some(listener);
        }
    }

    pub fn get(&self, id: TunnelId) -> Result<Tunnel, CoreError> {
        self.tunnels
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or_else(|| CoreError::not_found("Tunnel", id))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Tunnel, CoreError> {
        self.get(TunnelId::from_name(name))
    }

    /// Tunnel and profile together, `NotFound` if either is missing.
    pub fn profile(&self, tunnel_id: TunnelId, profile_id: ProfileId) -> Result<(Tunnel, Profile), CoreError> {
        let tunnel = self.get(tunnel_id)?;
        let profile = tunnel
            .profile(profile_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Profile", profile_id))?;
        Ok((tunnel, profile))
    }

    /// Every tunnel, ordered by name.
    pub fn list(&self) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));
        tunnels
    }

    pub fn is_present(&self, id: TunnelId) -> bool {
        self.tunnels.get(&id).is_some_and(|t| t.interface.present)
    }

    /// Query every backend for its interfaces and apply what changed.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let mut by_backend: BTreeMap<String, BTreeMap<String, InterfaceRecord>> = BTreeMap::new();
        for backend in self.providers.backends() {
            let records = self.interfaces.find_all_by_backend(backend).await?;
            by_backend.insert(
                backend.to_owned(),
                records.into_iter().map(|r| (r.name.clone(), r)).collect(),
            );
        }

        for tunnel in self.list() {
            let stored = by_backend
                .get(&tunnel.backend)
                .and_then(|records| records.get(&tunnel.interface.name));
            self.refresh_one(tunnel, stored).await;
        }
        Ok(())
    }

    async fn refresh_one(&self, tunnel: Tunnel, stored: Option<&InterfaceRecord>) {
        let provider = match self.providers.get(&tunnel.backend) {
            Ok(p) => p,
            Err(e) => {
                warn!(tunnel = %tunnel.name, error = %e, "no provider for tunnel");
                return;
            }
        };

        let previous = tunnel.interface.clone();
        let mut next = previous.clone();
        match provider.get_tunnel_interface_info(&previous.name).await {
            Ok(info) => {
                next.present = info.enabled;
                next.public_key = Some(info.public_key);
                // An unresolvable endpoint keeps the last known one.
                if info.endpoint.is_some() {
                    next.endpoint = info.endpoint;
                }
            }
            Err(e) if e.is_not_found() => {
                next.present = false;
            }
            Err(e) => {
                warn!(tunnel = %tunnel.name, backend = %tunnel.backend, error = %e, "interface refresh failed");
                return;
            }
        }
        next.refreshed_at = Some(Utc::now());
        if next.record_id.is_none() {
            next.record_id = stored.map(|r| r.id.clone());
        }

        let first_sight = previous.refreshed_at.is_none();
        let changed = first_sight
            || previous.present != next.present
            || previous.public_key != next.public_key
            || previous.endpoint != next.endpoint;

        if changed {
            match self.persist_interface(&tunnel, &mut next).await {
                Ok(()) => {}
                Err(e) => warn!(tunnel = %tunnel.name, error = %e, "cannot persist interface record"),
            }
        }

        if let Some(mut entry) = self.tunnels.get_mut(&tunnel.id) {
            entry.interface = next.clone();
        }

        let event = if first_sight {
            // A tunnel that was up before a restart and is gone now is still a drop.
            match stored {
                Some(r) if r.present && !next.present => Some(TunnelEvent::Down(tunnel.id)),
                _ => None,
            }
        } else if previous.present && !next.present {
            Some(TunnelEvent::Down(tunnel.id))
        } else if !previous.present && next.present {
            Some(TunnelEvent::Up(tunnel.id))
        } else if next.present
            && (previous.public_key != next.public_key || previous.endpoint != next.endpoint)
        {
            Some(TunnelEvent::ConfigChanged(tunnel.id))
        } else {
            None
        };

        if let Some(event) = event {
            info!(tunnel = %tunnel.name, ?event, "tunnel interface transition");
            self.notify(event);
        } else {
            debug!(tunnel = %tunnel.name, present = next.present, "tunnel interface refreshed");
        }
    }

    async fn persist_interface(&self, tunnel: &Tunnel, iface: &mut TunnelInterface) -> Result<(), CoreError> {
        let mut record = InterfaceRecord {
            id: iface.record_id.clone().unwrap_or_default(),
            backend: tunnel.backend.clone(),
            tunnel_id: tunnel.id,
            name: iface.name.clone(),
            public_key: iface.public_key.clone(),
            endpoint: iface.endpoint.clone(),
            present: iface.present,
            updated_at: Utc::now(),
        };
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
            self.interfaces.save(&record).await?;
            iface.record_id = Some(record.id);
        } else {
            self.interfaces.update(&record).await?;
        }
        Ok(())
    }

    fn notify(&self, event: TunnelEvent) {
        let listener = self.listener.read().ok().and_then(|l| l.clone());
        if let Some(listener) = listener {
            listener.on_tunnel_event(event);
        }
    }
}
