// ── Recording fakes for unit tests ──
//
// A scripted provider, a journaling repository, and a switchable user
// directory. Provider and repository can share one journal so tests can
// assert the interleaving of device and storage calls.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{DEFAULT_KEY_ATTEMPTS, ProfileConfig, TunnelConfig};
use crate::error::CoreError;
use crate::fsm::{PeerEvent, PeerStateMachine};
use crate::ippool::IpPoolAllocator;
use crate::model::{
    InterfaceAddress, InterfaceInfo, Peer, PeerId, PeerState, ProfileId, RemoteProviderPeer, Tunnel, TunnelId,
};
use crate::orchestrator::PeerOrchestrator;
use crate::provider::{PeerProvider, PeerSpec, ProviderRegistry};
use crate::repository::{PeerRepository, UserDirectory};
use crate::store::MemoryStore;
use crate::tunnels::TunnelDirectory;

pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

pub(crate) fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

pub(crate) fn tunnel_config(name: &str, backend: &str, ranges: &[&str]) -> TunnelConfig {
    TunnelConfig {
        name: name.into(),
        backend: backend.into(),
        interface: name.into(),
        profiles: vec![ProfileConfig {
            name: "default".into(),
            ranges: ranges.iter().map(|r| r.parse().unwrap()).collect(),
        }],
    }
}

// ── Provider ─────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeDeviceState {
    pub peers: BTreeMap<String, RemoteProviderPeer>,
    pub create_failures: VecDeque<CoreError>,
    pub delete_failures: VecDeque<CoreError>,
    pub interface_address: Option<InterfaceAddress>,
    pub interface_present: bool,
    /// When set, list calls fail with this message.
    pub list_failure: Option<String>,
    next_id: u32,
}

pub(crate) struct FakeProvider {
    backend: String,
    journal: Journal,
    state: Mutex<FakeDeviceState>,
}

impl FakeProvider {
    /// A backend whose interfaces sit at `interface` (e.g. `10.8.0.1/24`).
    pub fn new(backend: &str, interface: &str, journal: Journal) -> Arc<Self> {
        let net: ipnet::IpNet = interface.parse().unwrap();
        Arc::new(Self {
            backend: backend.into(),
            journal,
            state: Mutex::new(FakeDeviceState {
                interface_address: Some(InterfaceAddress {
                    address: net.addr(),
                    network: net.trunc(),
                }),
                interface_present: true,
                ..FakeDeviceState::default()
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeDeviceState> {
        self.state.lock().unwrap()
    }

    pub fn registry(self: &Arc<Self>) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        registry.insert(Arc::clone(self) as Arc<dyn PeerProvider>);
        Arc::new(registry)
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerProvider for FakeProvider {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn create_peer(&self, spec: &PeerSpec<'_>) -> Result<RemoteProviderPeer, CoreError> {
        self.record(format!("device.create {}", spec.public_key));
        let mut state = self.state();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if state.peers.contains_key(spec.public_key) {
            return Err(CoreError::AlreadyExists {
                message: "failure: entry already exists".into(),
            });
        }
        state.next_id += 1;
        let remote = RemoteProviderPeer {
            remote_id: format!("*{}", state.next_id),
            public_key: spec.public_key.to_owned(),
            allowed_addresses: spec.allowed_addresses(),
            preshared_key: spec.preshared_key.cloned(),
            comment: Some(spec.comment()),
            ..RemoteProviderPeer::default()
        };
        state.peers.insert(spec.public_key.to_owned(), remote.clone());
        Ok(remote)
    }

    async fn update_peer(&self, remote_id: &str, spec: &PeerSpec<'_>) -> Result<(), CoreError> {
        self.record(format!("device.update {remote_id}"));
        let mut state = self.state();
        let Some(remote) = state.peers.get_mut(spec.public_key) else {
            return Err(CoreError::not_found("Remote item", remote_id));
        };
        remote.allowed_addresses = spec.allowed_addresses();
        remote.comment = Some(spec.comment());
        remote.preshared_key = spec.preshared_key.cloned();
        remote.disabled = false;
        Ok(())
    }

    async fn get_peer_by_public_key(
        &self,
        public_key: &str,
        _tunnel: &Tunnel,
    ) -> Result<RemoteProviderPeer, CoreError> {
        self.record(format!("device.get {public_key}"));
        self.state()
            .peers
            .get(public_key)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Remote peer", public_key))
    }

    async fn list_peers(&self, tunnel: &Tunnel) -> Result<Vec<RemoteProviderPeer>, CoreError> {
        self.record(format!("device.list {}", tunnel.interface.name));
        let state = self.state();
        if let Some(message) = &state.list_failure {
            return Err(CoreError::Transient {
                message: message.clone(),
            });
        }
        Ok(state.peers.values().cloned().collect())
    }

    async fn delete_peer_by_public_key(&self, _tunnel: &Tunnel, public_key: &str) -> Result<(), CoreError> {
        self.record(format!("device.delete {public_key}"));
        let mut state = self.state();
        if let Some(err) = state.delete_failures.pop_front() {
            return Err(err);
        }
        state.peers.remove(public_key);
        Ok(())
    }

    async fn get_interface_address(&self, tunnel: &Tunnel) -> Result<InterfaceAddress, CoreError> {
        self.record(format!("device.address {}", tunnel.interface.name));
        let state = self.state();
        match (state.interface_present, state.interface_address) {
            (true, Some(addr)) => Ok(addr),
            _ => Err(CoreError::not_found("Interface address", &tunnel.interface.name)),
        }
    }

    async fn get_tunnel_interface_info(&self, interface: &str) -> Result<InterfaceInfo, CoreError> {
        self.record(format!("device.info {interface}"));
        if !self.state().interface_present {
            return Err(CoreError::not_found("Interface", interface));
        }
        Ok(InterfaceInfo {
            endpoint: Some("vpn.example.net:51820".into()),
            public_key: format!("{interface}-key="),
            enabled: true,
        })
    }
}

// ── Peer repository ──────────────────────────────────────────────────

/// `MemoryStore` that journals every call and can be told to fail updates.
pub(crate) struct RecordingRepository {
    inner: MemoryStore,
    journal: Journal,
    pub fail_updates: Mutex<bool>,
}

impl RecordingRepository {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            journal,
            fail_updates: Mutex::new(false),
        })
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerRepository for RecordingRepository {
    async fn save(&self, peer: &Peer) -> Result<(), CoreError> {
        self.record(format!("repo.save {}", peer.state));
        PeerRepository::save(&self.inner, peer).await
    }

    async fn update_by_id(&self, peer: &Peer) -> Result<(), CoreError> {
        self.record(format!("repo.update {}", peer.state));
        if *self.fail_updates.lock().unwrap() {
            return Err(CoreError::repository("disk full"));
        }
        self.inner.update_by_id(peer).await
    }

    async fn delete_by_id(&self, id: PeerId) -> Result<(), CoreError> {
        self.record("repo.delete".into());
        PeerRepository::delete_by_id(&self.inner, id).await
    }

    async fn find_by_id(&self, id: PeerId) -> Result<Option<Peer>, CoreError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Vec<Peer>, CoreError> {
        self.inner.find_by_username(username).await
    }

    async fn find_by_tunnel_id(&self, tunnel_id: TunnelId) -> Result<Vec<Peer>, CoreError> {
        self.inner.find_by_tunnel_id(tunnel_id).await
    }

    async fn find_all(&self) -> Result<Vec<Peer>, CoreError> {
        self.inner.find_all().await
    }

    async fn distinct_tunnel_ids(&self) -> Result<BTreeSet<TunnelId>, CoreError> {
        self.inner.distinct_tunnel_ids().await
    }
}

// ── User directory ───────────────────────────────────────────────────

/// Directory whose user set can be swapped or made to fail.
pub(crate) struct FakeDirectory {
    pub users: Mutex<Option<BTreeSet<String>>>,
}

impl FakeDirectory {
    pub fn with(users: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(Some(users.iter().map(|u| (*u).to_owned()).collect())),
        })
    }

    pub fn set(&self, users: Option<&[&str]>) {
        *self.users.lock().unwrap() = users.map(|u| u.iter().map(|s| (*s).to_owned()).collect());
    }
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn list_valid_usernames(&self) -> Result<BTreeSet<String>, CoreError> {
        self.users.lock().unwrap().clone().ok_or_else(|| CoreError::Transient {
            message: "directory unreachable".into(),
        })
    }

    async fn authenticate(&self, _username: &str, _password: &SecretString) -> Result<(), CoreError> {
        Ok(())
    }
}

// ── Wired fixture ────────────────────────────────────────────────────

/// One backend `edge` at `192.168.0.1/24` carrying tunnel `wg0`, whose
/// `default` profile grants `192.168.1.0/24` and `192.168.2.0/24`. Users
/// `alice` and `bob` exist. The tunnel has been refreshed once and the
/// journal starts empty.
pub(crate) struct Fixture {
    pub log: Journal,
    pub provider: Arc<FakeProvider>,
    pub repo: Arc<RecordingRepository>,
    pub directory: Arc<FakeDirectory>,
    pub tunnels: Arc<TunnelDirectory>,
    pub pools: Arc<IpPoolAllocator>,
    pub fsm: PeerStateMachine,
    pub orchestrator: PeerOrchestrator,
}

impl Fixture {
    pub async fn new() -> Self {
        let log = journal();
        let provider = FakeProvider::new("edge", "192.168.0.1/24", log.clone());
        let registry = provider.registry();
        let repo = RecordingRepository::new(log.clone());
        let directory = FakeDirectory::with(&["alice", "bob"]);
        let tunnels = Arc::new(
            TunnelDirectory::new(
                &[tunnel_config("wg0", "edge", &["192.168.1.0/24", "192.168.2.0/24"])],
                Arc::clone(&registry),
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        );
        tunnels.refresh().await.unwrap();
        let pools = Arc::new(IpPoolAllocator::new(Arc::clone(&registry), repo.clone()));
        let fsm = PeerStateMachine::new(
            repo.clone(),
            Arc::clone(&registry),
            Arc::clone(&tunnels),
            Arc::clone(&pools),
            DEFAULT_KEY_ATTEMPTS,
        );
        let orchestrator = PeerOrchestrator::new(
            repo.clone(),
            Arc::clone(&tunnels),
            Arc::clone(&pools),
            registry,
            directory.clone(),
            16,
            DEFAULT_KEY_ATTEMPTS,
        );
        log.lock().unwrap().clear();
        Self {
            log,
            provider,
            repo,
            directory,
            tunnels,
            pools,
            fsm,
            orchestrator,
        }
    }

    pub fn tunnel(&self) -> Tunnel {
        self.tunnels.find_by_name("wg0").unwrap()
    }

    /// A saved `Created` peer without address or keys. Clears the journal.
    pub async fn stored_peer(&self, username: &str) -> Peer {
        let peer = Peer::new(username, TunnelId::from_name("wg0"), ProfileId::from_names("wg0", "default"));
        self.repo.save(&peer).await.unwrap();
        self.log.lock().unwrap().clear();
        peer
    }

    /// A peer driven to `Provisioned` through the state machine.
    pub async fn provisioned_peer(&self, username: &str) -> Peer {
        let peer = self.stored_peer(username).await;
        let peer = self.fsm.handle(peer, PeerEvent::Provision).await;
        assert_eq!(peer.state, PeerState::Provisioned);
        peer
    }

    /// Make the next `n` device creates collide on the public key.
    pub fn collide_creates(&self, n: usize) {
        let mut state = self.provider.state();
        for _ in 0..n {
            state.create_failures.push_back(CoreError::AlreadyExists {
                message: "failure: entry already exists".into(),
            });
        }
    }
}
