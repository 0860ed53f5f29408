// ── Peer orchestrator ──
//
// Front door for peer requests. Callers get an answer as soon as the
// record is written; the state machine runs later on a single worker that
// consumes a bounded task queue. The worker also runs the reconciliation
// pass, so every peer mutation is totally ordered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::fsm::{PeerEvent, PeerStateMachine};
use crate::ippool::IpPoolAllocator;
use crate::model::{Peer, PeerId, PeerState, RemoteProviderPeer, Tunnel, TunnelId, validate_preshared_key};
use crate::provider::{PeerSpec, ProviderRegistry};
use crate::repository::{PeerRepository, UserDirectory};
use crate::tunnels::{TunnelDirectory, TunnelEvent, TunnelListener};

/// A request to create a peer.
#[derive(Debug, Clone)]
pub struct CreatePeerRequest {
    pub username: String,
    /// Tunnel name.
    pub tunnel: String,
    /// Profile name within the tunnel.
    pub profile: String,
    pub description: Option<String>,
    pub preshared_key: Option<SecretString>,
}

#[derive(Debug)]
enum Task {
    Creation(PeerId),
    Deletion { id: PeerId, force: bool },
    Provision(PeerId),
    UnprovisionInterface(TunnelId),
    Reconcile,
    Barrier(oneshot::Sender<()>),
}

/// Handle to the orchestrator. Cheaply cloneable.
#[derive(Clone)]
pub struct PeerOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    peers: Arc<dyn PeerRepository>,
    tunnels: Arc<TunnelDirectory>,
    pools: Arc<IpPoolAllocator>,
    providers: Arc<ProviderRegistry>,
    directory: Arc<dyn UserDirectory>,
    fsm: PeerStateMachine,
    tasks: mpsc::Sender<Task>,
    task_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerOrchestrator {
    /// Wire the orchestrator and register it for tunnel events. The worker
    /// does not run until [`start`](Self::start).
    pub fn new(
        peers: Arc<dyn PeerRepository>,
        tunnels: Arc<TunnelDirectory>,
        pools: Arc<IpPoolAllocator>,
        providers: Arc<ProviderRegistry>,
        directory: Arc<dyn UserDirectory>,
        queue_size: usize,
        key_attempts: u32,
    ) -> Self {
        let (tasks, task_rx) = mpsc::channel(queue_size.max(1));
        tunnels.set_listener(Arc::new(TunnelEventSink { tasks: tasks.clone() }));

        let fsm = PeerStateMachine::new(
            Arc::clone(&peers),
            Arc::clone(&providers),
            Arc::clone(&tunnels),
            Arc::clone(&pools),
            key_attempts,
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                peers,
                tunnels,
                pools,
                providers,
                directory,
                fsm,
                tasks,
                task_rx: Mutex::new(Some(task_rx)),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the worker. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(rx) = self.inner.task_rx.lock().await.take() else {
            debug!("orchestrator worker already started");
            return;
        };
        let handle = tokio::spawn(worker_task(self.clone(), rx, self.inner.cancel.clone()));
        *self.inner.worker.lock().await = Some(handle);
        info!("orchestrator worker started");
    }

    /// Stop accepting tasks, finish the queued ones, and join the worker.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "orchestrator worker ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Validate, persist a `Created` record, and queue its provisioning.
    /// Provisioning failures show up later in the peer's status.
    pub async fn create_peer(&self, request: CreatePeerRequest) -> Result<Peer, CoreError> {
        let username = request.username.trim();
        if username.is_empty() {
            return Err(CoreError::validation("username must not be empty"));
        }
        let tunnel = self.inner.tunnels.find_by_name(&request.tunnel)?;
        let profile = tunnel
            .profile_by_name(&request.profile)
            .ok_or_else(|| CoreError::not_found("Profile", format!("{}/{}", tunnel.name, request.profile)))?;
        if let Some(psk) = &request.preshared_key {
            validate_preshared_key(psk)?;
        }

        let mut peer = Peer::new(username, tunnel.id, profile.id);
        peer.description = request.description.filter(|d| !d.trim().is_empty());
        peer.preshared_key = request.preshared_key;

        if self.inner.tunnels.is_present(tunnel.id) {
            peer.address = Some(self.inner.pools.get_next_address(&tunnel).await?);
        }
        if let Err(e) = self.inner.peers.save(&peer).await {
            self.return_address(&tunnel, &peer).await;
            return Err(e);
        }
        info!(peer_id = %peer.id, username, tunnel = %tunnel.name, address = ?peer.address, "peer created");

        self.enqueue(Task::Creation(peer.id)).await?;
        Ok(peer)
    }

    /// Every peer, or only those of one user.
    pub async fn list_peers(&self, username: Option<&str>) -> Result<Vec<Peer>, CoreError> {
        match username {
            Some(u) => self.inner.peers.find_by_username(u).await,
            None => self.inner.peers.find_all().await,
        }
    }

    pub async fn get_peer(&self, id: PeerId) -> Result<Peer, CoreError> {
        self.inner
            .peers
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Peer", id))
    }

    /// Queue deletion. `force` skips the device.
    pub async fn delete_peer(&self, id: PeerId, force: bool) -> Result<(), CoreError> {
        self.get_peer(id).await?;
        self.enqueue(Task::Deletion { id, force }).await
    }

    /// Queue another provisioning attempt, typically for a peer in `Error`.
    pub async fn reprovision_peer(&self, id: PeerId) -> Result<(), CoreError> {
        self.get_peer(id).await?;
        self.enqueue(Task::Provision(id)).await
    }

    /// Queue a reconciliation pass.
    pub async fn reconcile(&self) -> Result<(), CoreError> {
        self.enqueue(Task::Reconcile).await
    }

    /// Resolve once every task queued before this call has been processed.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Task::Barrier(tx)).await?;
        rx.await.map_err(|_| CoreError::QueueClosed)
    }

    async fn enqueue(&self, task: Task) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::QueueClosed);
        }
        self.inner.tasks.send(task).await.map_err(|_| CoreError::QueueClosed)
    }

    async fn return_address(&self, tunnel: &Tunnel, peer: &Peer) {
        if let Some(address) = peer.address {
            if let Err(e) = self.inner.pools.release_address(tunnel, address).await {
                warn!(peer_id = %peer.id, %address, error = %e, "cannot return address of unsaved peer");
            }
        }
    }

    // ── Worker side ──────────────────────────────────────────────────

    async fn process(&self, task: Task) {
        match task {
            Task::Creation(id) => {
                if let Some(peer) = self.load(id).await {
                    if peer.state == PeerState::Created {
                        self.inner.fsm.handle(peer, PeerEvent::Provision).await;
                    } else {
                        debug!(peer_id = %id, state = %peer.state, "creation already handled");
                    }
                }
            }
            Task::Deletion { id, force } => {
                if let Some(peer) = self.load(id).await {
                    self.delete_one(peer, force).await;
                }
            }
            Task::Provision(id) => {
                if let Some(peer) = self.load(id).await {
                    self.inner.fsm.handle(peer, PeerEvent::Provision).await;
                }
            }
            Task::UnprovisionInterface(tunnel_id) => self.unprovision_interface(tunnel_id).await,
            Task::Reconcile => self.reconcile_pass().await,
            Task::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn load(&self, id: PeerId) -> Option<Peer> {
        match self.inner.peers.find_by_id(id).await {
            Ok(Some(peer)) => Some(peer),
            Ok(None) => {
                debug!(peer_id = %id, "peer vanished before its task ran");
                None
            }
            Err(e) => {
                warn!(peer_id = %id, error = %e, "cannot load peer");
                None
            }
        }
    }

    async fn delete_one(&self, peer: Peer, force: bool) {
        let tunnel_known = self.inner.tunnels.get(peer.tunnel_id).is_ok();
        let peer = match peer.state {
            PeerState::Created => return self.finish(peer, PeerEvent::ForceDelete).await,
            // Finish taking it off the device before deleting.
            PeerState::Unprovisioning if !force && tunnel_known => {
                self.inner.fsm.handle(peer, PeerEvent::Unprovision).await
            }
            _ => peer,
        };
        let event = if force || !tunnel_known {
            PeerEvent::ForceDelete
        } else {
            PeerEvent::Delete
        };
        self.finish(peer, event).await;
    }

    async fn finish(&self, peer: Peer, event: PeerEvent) {
        let peer = self.inner.fsm.handle(peer, event).await;
        if peer.state != PeerState::Deleted {
            warn!(peer_id = %peer.id, state = %peer.state, "peer not deleted");
        }
    }

    /// Take every provisioned peer of a tunnel off its device.
    async fn unprovision_interface(&self, tunnel_id: TunnelId) {
        let peers = match self.inner.peers.find_by_tunnel_id(tunnel_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "cannot list tunnel peers");
                return;
            }
        };
        let mut failed = 0usize;
        let mut total = 0usize;
        for peer in peers.into_iter().filter(|p| p.state == PeerState::Provisioned) {
            total += 1;
            let peer = self.inner.fsm.handle(peer, PeerEvent::Unprovision).await;
            if peer.state == PeerState::Error {
                failed += 1;
            }
        }
        info!(tunnel_id = %tunnel_id, total, failed, "tunnel peers unprovisioned");
    }

    /// Converge directory, store, and devices.
    async fn reconcile_pass(&self) {
        let users = match self.inner.directory.list_valid_usernames().await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "user directory unavailable, skipping reconciliation");
                return;
            }
        };
        let peers = match self.inner.peers.find_all().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cannot load peers, skipping reconciliation");
                return;
            }
        };

        let mut by_tunnel: BTreeMap<TunnelId, Vec<Peer>> = BTreeMap::new();
        let mut deleted = 0usize;
        for peer in peers {
            if !users.contains(&peer.username) || peer.state == PeerState::Deleting {
                info!(peer_id = %peer.id, username = %peer.username, state = %peer.state, "removing peer");
                self.delete_one(peer, false).await;
                deleted += 1;
            } else {
                by_tunnel.entry(peer.tunnel_id).or_default().push(peer);
            }
        }

        let mut touched = 0usize;
        for (tunnel_id, peers) in by_tunnel {
            touched += self.reconcile_tunnel(tunnel_id, peers).await;
        }
        info!(deleted, touched, "reconciliation pass finished");
    }

    /// Returns how many peers were driven through the state machine.
    async fn reconcile_tunnel(&self, tunnel_id: TunnelId, peers: Vec<Peer>) -> usize {
        let Ok(tunnel) = self.inner.tunnels.get(tunnel_id) else {
            warn!(tunnel_id = %tunnel_id, peers = peers.len(), "peers reference an unconfigured tunnel");
            return 0;
        };

        let mut touched = 0usize;
        if !self.inner.tunnels.is_present(tunnel.id) {
            for peer in peers.into_iter().filter(|p| p.state == PeerState::Provisioned) {
                self.inner.fsm.handle(peer, PeerEvent::Unprovision).await;
                touched += 1;
            }
            return touched;
        }

        let remote = match self.remote_peers(&tunnel).await {
            Ok(r) => r,
            Err(e) => {
                warn!(tunnel = %tunnel.name, backend = %tunnel.backend, error = %e, "cannot list device peers, skipping tunnel");
                return 0;
            }
        };

        // The interface is present, so every live peer converges on Provisioned.
        // Peers already on the device are updated in place, never removed.
        for peer in peers {
            let found = peer.public_key.as_deref().and_then(|pk| remote.get(pk));
            let events = match (peer.state, found) {
                (PeerState::Deleting | PeerState::Deleted, _) => vec![],
                (PeerState::Provisioned, Some(remote)) if in_sync(&tunnel, &peer, remote) => vec![],
                // Finish an interrupted removal, then bring the peer back.
                (PeerState::Unprovisioning, _) => vec![PeerEvent::Unprovision, PeerEvent::Provision],
                _ => vec![PeerEvent::Provision],
            };
            if events.is_empty() {
                continue;
            }
            debug!(peer_id = %peer.id, state = %peer.state, remote = found.is_some(), "reconciling peer");
            let mut peer = peer;
            for event in events {
                peer = self.inner.fsm.handle(peer, event).await;
            }
            touched += 1;
        }
        touched
    }

    async fn remote_peers(&self, tunnel: &Tunnel) -> Result<BTreeMap<String, RemoteProviderPeer>, CoreError> {
        let provider = self.inner.providers.get(&tunnel.backend)?;
        Ok(provider
            .list_peers(tunnel)
            .await?
            .into_iter()
            .map(|r| (r.public_key.clone(), r))
            .collect())
    }

    /// Tunnels that have at least one stored peer.
    pub async fn tunnels_in_use(&self) -> Result<BTreeSet<TunnelId>, CoreError> {
        self.inner.peers.distinct_tunnel_ids().await
    }
}

/// Whether the device peer already carries the peer's configuration.
fn in_sync(tunnel: &Tunnel, peer: &Peer, remote: &RemoteProviderPeer) -> bool {
    let (Some(profile), Some(address), Some(public_key)) =
        (tunnel.profile(peer.profile_id), peer.address, peer.public_key.as_deref())
    else {
        return false;
    };
    let spec = PeerSpec {
        public_key,
        description: peer.description.as_deref(),
        preshared_key: peer.preshared_key.as_ref(),
        tunnel,
        profile,
        address,
    };
    spec.matches(remote)
}

/// Processes tasks one at a time until cancelled, then drains what is
/// already queued.
async fn worker_task(orchestrator: PeerOrchestrator, mut rx: mpsc::Receiver<Task>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };
                orchestrator.process(task).await;
            }
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(task) = rx.recv().await {
        orchestrator.process(task).await;
        drained += 1;
    }
    debug!(drained, "orchestrator worker exited");
}

// ── Tunnel events ────────────────────────────────────────────────────

struct TunnelEventSink {
    tasks: mpsc::Sender<Task>,
}

impl TunnelEventSink {
    fn push(&self, task: Task) {
        if let Err(e) = self.tasks.try_send(task) {
            warn!(error = %e, "task queue full, dropping tunnel event");
        }
    }
}

impl TunnelListener for TunnelEventSink {
    fn on_tunnel_event(&self, event: TunnelEvent) {
        match event {
            TunnelEvent::Down(id) => self.push(Task::UnprovisionInterface(id)),
            TunnelEvent::Up(_) => self.push(Task::Reconcile),
            TunnelEvent::ConfigChanged(id) => {
                info!(tunnel_id = %id, "tunnel endpoint or key changed; client configurations need redistribution");
            }
        }
    }
}
