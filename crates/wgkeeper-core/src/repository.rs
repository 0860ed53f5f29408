// ── Collaborator interfaces ──
//
// Persistence and user directory seams. The core only needs CRUD and a
// handful of queries; implementations decide how records are stored.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{Peer, PeerId, TunnelId};

/// Peer record storage. Each call is atomic per record.
#[async_trait]
pub trait PeerRepository: Send + Sync {
    async fn save(&self, peer: &Peer) -> Result<(), CoreError>;

    /// Replace an existing record. Fails with `NotFound` if none matched.
    async fn update_by_id(&self, peer: &Peer) -> Result<(), CoreError>;

    async fn delete_by_id(&self, id: PeerId) -> Result<(), CoreError>;

    async fn find_by_id(&self, id: PeerId) -> Result<Option<Peer>, CoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Vec<Peer>, CoreError>;

    async fn find_by_tunnel_id(&self, tunnel_id: TunnelId) -> Result<Vec<Peer>, CoreError>;

    async fn find_all(&self) -> Result<Vec<Peer>, CoreError>;

    async fn distinct_tunnel_ids(&self) -> Result<BTreeSet<TunnelId>, CoreError>;
}

/// Last observed state of a tunnel interface on its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub id: String,
    pub backend: String,
    pub tunnel_id: TunnelId,
    pub name: String,
    pub public_key: Option<String>,
    pub endpoint: Option<String>,
    pub present: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait InterfaceRepository: Send + Sync {
    async fn save(&self, record: &InterfaceRecord) -> Result<(), CoreError>;

    /// Replace an existing record. Fails with `NotFound` if none matched.
    async fn update(&self, record: &InterfaceRecord) -> Result<(), CoreError>;

    async fn delete_by_id(&self, id: &str) -> Result<(), CoreError>;

    async fn find_all_by_backend(&self, backend: &str) -> Result<Vec<InterfaceRecord>, CoreError>;
}

/// Source of the users allowed to own peers.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_valid_usernames(&self) -> Result<BTreeSet<String>, CoreError>;

    async fn authenticate(&self, username: &str, password: &SecretString) -> Result<(), CoreError>;
}
