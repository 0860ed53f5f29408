// ── In-memory record store ──
//
// `DashMap`-backed implementation of both repositories. With a snapshot
// path, every mutation rewrites a JSON file (write to temp, then rename)
// and the file is loaded on open, so separate processes share state.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::model::{Peer, PeerId, TunnelId};
use crate::repository::{InterfaceRecord, InterfaceRepository, PeerRepository};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    peers: Vec<Peer>,
    #[serde(default)]
    interfaces: Vec<InterfaceRecord>,
}

/// Concurrent record store with optional file persistence.
#[derive(Default)]
pub struct MemoryStore {
    peers: DashMap<PeerId, Peer>,
    interfaces: DashMap<String, InterfaceRecord>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest state always lands last.
    write_lock: Mutex<()>,
}

impl MemoryStore {
    /// A purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading it if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            snapshot_path: Some(path.clone()),
            ..Self::default()
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                debug!(
                    path = %path.display(),
                    peers = snapshot.peers.len(),
                    interfaces = snapshot.interfaces.len(),
                    "loaded state snapshot"
                );
                for peer in snapshot.peers {
                    store.peers.insert(peer.id, peer);
                }
                for record in snapshot.interfaces {
                    store.interfaces.insert(record.id.clone(), record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state snapshot yet");
            }
            Err(e) => {
                return Err(CoreError::repository(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        }
        Ok(store)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    async fn persist(&self) -> Result<(), CoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut interfaces: Vec<InterfaceRecord> =
            self.interfaces.iter().map(|e| e.value().clone()).collect();
        interfaces.sort_by(|a, b| a.id.cmp(&b.id));

        let bytes = serde_json::to_vec_pretty(&Snapshot { peers, interfaces })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::repository(format!("cannot create {}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| CoreError::repository(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CoreError::repository(format!("cannot replace {}: {e}", path.display())))?;
        trace!(path = %path.display(), bytes = bytes.len(), "state snapshot written");
        Ok(())
    }
}

// ── PeerRepository ───────────────────────────────────────────────────

#[async_trait]
impl PeerRepository for MemoryStore {
    async fn save(&self, peer: &Peer) -> Result<(), CoreError> {
        self.peers.insert(peer.id, peer.clone());
        self.persist().await
    }

    async fn update_by_id(&self, peer: &Peer) -> Result<(), CoreError> {
        {
            let Some(mut existing) = self.peers.get_mut(&peer.id) else {
                return Err(CoreError::not_found("Peer", peer.id));
            };
            *existing = peer.clone();
        }
        self.persist().await
    }

    async fn delete_by_id(&self, id: PeerId) -> Result<(), CoreError> {
        if self.peers.remove(&id).is_none() {
            return Err(CoreError::not_found("Peer", id));
        }
        self.persist().await
    }

    async fn find_by_id(&self, id: PeerId) -> Result<Option<Peer>, CoreError> {
        Ok(self.peers.get(&id).map(|p| p.value().clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Vec<Peer>, CoreError> {
        Ok(collect_sorted(
            self.peers
                .iter()
                .filter(|p| p.username == username)
                .map(|p| p.value().clone()),
        ))
    }

    async fn find_by_tunnel_id(&self, tunnel_id: TunnelId) -> Result<Vec<Peer>, CoreError> {
        Ok(collect_sorted(
            self.peers
                .iter()
                .filter(|p| p.tunnel_id == tunnel_id)
                .map(|p| p.value().clone()),
        ))
    }

    async fn find_all(&self) -> Result<Vec<Peer>, CoreError> {
        Ok(collect_sorted(self.peers.iter().map(|p| p.value().clone())))
    }

    async fn distinct_tunnel_ids(&self) -> Result<BTreeSet<TunnelId>, CoreError> {
        Ok(self.peers.iter().map(|p| p.tunnel_id).collect())
    }
}

fn collect_sorted(peers: impl Iterator<Item = Peer>) -> Vec<Peer> {
    let mut peers: Vec<Peer> = peers.collect();
    peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    peers
}

// ── InterfaceRepository ──────────────────────────────────────────────

#[async_trait]
impl InterfaceRepository for MemoryStore {
    async fn save(&self, record: &InterfaceRecord) -> Result<(), CoreError> {
        self.interfaces.insert(record.id.clone(), record.clone());
        self.persist().await
    }

    async fn update(&self, record: &InterfaceRecord) -> Result<(), CoreError> {
        {
            let Some(mut existing) = self.interfaces.get_mut(&record.id) else {
                return Err(CoreError::not_found("Interface record", &record.id));
            };
            *existing = record.clone();
        }
        self.persist().await
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), CoreError> {
        if self.interfaces.remove(id).is_none() {
            return Err(CoreError::not_found("Interface record", id));
        }
        self.persist().await
    }

    async fn find_all_by_backend(&self, backend: &str) -> Result<Vec<InterfaceRecord>, CoreError> {
        let mut records: Vec<InterfaceRecord> = self
            .interfaces
            .iter()
            .filter(|r| r.backend == backend)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{PeerState, ProfileId};
    use pretty_assertions::assert_eq;

    fn peer(username: &str, tunnel: &str) -> Peer {
        Peer::new(username, TunnelId::from_name(tunnel), ProfileId::from_names(tunnel, "default"))
    }

    #[tokio::test]
    async fn update_requires_an_existing_record() {
        let store = MemoryStore::new();
        let p = peer("alice", "wg0");
        assert!(PeerRepository::update_by_id(&store, &p).await.unwrap_err().is_not_found());

        PeerRepository::save(&store, &p).await.unwrap();
        let mut changed = p.clone();
        changed.state = PeerState::Provisioned;
        PeerRepository::update_by_id(&store, &changed).await.unwrap();
        assert_eq!(store.find_by_id(p.id).await.unwrap().unwrap().state, PeerState::Provisioned);
    }

    #[tokio::test]
    async fn queries_filter_by_owner_and_tunnel() {
        let store = MemoryStore::new();
        for p in [peer("alice", "wg0"), peer("alice", "wg1"), peer("bob", "wg0")] {
            PeerRepository::save(&store, &p).await.unwrap();
        }

        assert_eq!(store.find_by_username("alice").await.unwrap().len(), 2);
        assert_eq!(store.find_by_tunnel_id(TunnelId::from_name("wg0")).await.unwrap().len(), 2);
        assert_eq!(
            store.distinct_tunnel_ids().await.unwrap(),
            [TunnelId::from_name("wg0"), TunnelId::from_name("wg1")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn snapshot_is_reloaded_by_a_second_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("wgkeeper.json");

        let first = MemoryStore::open(&path).await.unwrap();
        let mut p = peer("carol", "wg0");
        p.address = Some("10.8.0.2".parse().unwrap());
        PeerRepository::save(&first, &p).await.unwrap();
        PeerRepository::save(&first, &peer("dave", "wg0")).await.unwrap();
        PeerRepository::delete_by_id(&first, p.id).await.unwrap();

        let second = MemoryStore::open(&path).await.unwrap();
        let all = second.find_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].username, "dave");
    }

    #[tokio::test]
    async fn interface_records_are_scoped_by_backend() {
        let store = MemoryStore::new();
        let record = InterfaceRecord {
            id: "r1".into(),
            backend: "edge".into(),
            tunnel_id: TunnelId::from_name("wg0"),
            name: "wg0".into(),
            public_key: None,
            endpoint: None,
            present: true,
            updated_at: chrono::Utc::now(),
        };
        InterfaceRepository::save(&store, &record).await.unwrap();

        assert_eq!(store.find_all_by_backend("edge").await.unwrap(), vec![record.clone()]);
        assert!(store.find_all_by_backend("core").await.unwrap().is_empty());
        InterfaceRepository::delete_by_id(&store, "r1").await.unwrap();
        assert!(InterfaceRepository::delete_by_id(&store, "r1").await.is_err());
    }
}
