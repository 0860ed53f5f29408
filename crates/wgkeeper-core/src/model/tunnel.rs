// ── Tunnel and profile types ──
//
// Tunnels are built once from configuration; only the interface
// sub-record changes at runtime, refreshed from the provider.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for name-derived tunnel and profile ids.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x5b0e_71d2_3c4a_4f0e_9a61_0c2f_77d4_e1a9);

super::uuid_id!(
    /// Deterministic id of a configured tunnel, derived from its name.
    TunnelId
);

super::uuid_id!(
    /// Deterministic id of a profile, derived from tunnel and profile names.
    ProfileId
);

impl TunnelId {
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&ID_NAMESPACE, format!("tunnel/{name}").as_bytes()))
    }
}

impl ProfileId {
    pub fn from_names(tunnel: &str, profile: &str) -> Self {
        Self(Uuid::new_v5(
            &ID_NAMESPACE,
            format!("profile/{tunnel}/{profile}").as_bytes(),
        ))
    }
}

/// A named set of CIDR ranges granted to peers created under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub ranges: Vec<IpNet>,
}

/// Live state of the device interface backing a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInterface {
    pub name: String,
    pub public_key: Option<String>,
    /// `host:port` peers connect to.
    pub endpoint: Option<String>,
    pub present: bool,
    /// Id of the persisted interface record, once written.
    pub record_id: Option<String>,
    /// `None` until the first refresh observed the device.
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// A configured VPN interface on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    pub backend: String,
    pub interface: TunnelInterface,
    pub profiles: BTreeMap<ProfileId, Profile>,
}

impl Tunnel {
    pub fn profile(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.get(&id)
    }

    pub fn profile_by_name(&self, name: &str) -> Option<&Profile> {
        self.profiles.values().find(|p| p.name == name)
    }
}
