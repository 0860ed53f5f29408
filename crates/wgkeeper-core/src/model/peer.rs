// ── Peer domain type ──

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::secret_serde;
use super::tunnel::{ProfileId, TunnelId};

super::uuid_id!(
    /// Opaque unique identifier of a peer record.
    PeerId
);

impl PeerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a peer. Changed only by the state machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PeerState {
    Created,
    Provisioning,
    Provisioned,
    Unprovisioning,
    Unprovisioned,
    Deleting,
    Deleted,
    Error,
}

/// A VPN endpoint belonging to a user on a tunnel profile.
///
/// `public_key` and `private_key` are set together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub username: String,
    pub tunnel_id: TunnelId,
    pub profile_id: ProfileId,
    pub public_key: Option<String>,
    #[serde(with = "secret_serde", default)]
    pub private_key: Option<SecretString>,
    #[serde(with = "secret_serde", default)]
    pub preshared_key: Option<SecretString>,
    pub description: Option<String>,
    pub address: Option<IpAddr>,
    pub state: PeerState,
    /// Last provisioning failure; cleared on success.
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Peer {
    /// A fresh record in [`PeerState::Created`].
    pub fn new(username: impl Into<String>, tunnel_id: TunnelId, profile_id: ProfileId) -> Self {
        Self {
            id: PeerId::new(),
            username: username.into(),
            tunnel_id,
            profile_id,
            public_key: None,
            private_key: None,
            preshared_key: None,
            description: None,
            address: None,
            state: PeerState::Created,
            status: None,
            created_at: Utc::now(),
        }
    }

    pub fn has_keypair(&self) -> bool {
        self.public_key.is_some() && self.private_key.is_some()
    }
}
