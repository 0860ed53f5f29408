// ── Peer state machine ──
//
// Transitions are an explicit (state, event) -> action table. Each action
// takes the peer plus collaborators, persists what it changed, and returns
// the next event. `handle()` keeps firing events until an action returns
// `Noop` or a pair has no entry in the table.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::ippool::IpPoolAllocator;
use crate::model::{Keypair, Peer, PeerState, Profile, RemoteProviderPeer, Tunnel};
use crate::provider::{PeerProvider, PeerSpec, ProviderRegistry};
use crate::repository::PeerRepository;
use crate::tunnels::TunnelDirectory;

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Provision,
    Unprovision,
    Delete,
    ForceDelete,
    /// A failed action, carrying the text recorded as the peer status.
    Error(String),
    /// Ends a transition chain.
    Noop,
}

impl std::fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Provision => "provision",
            Self::Unprovision => "unprovision",
            Self::Delete => "delete",
            Self::ForceDelete => "force-delete",
            Self::Error(_) => "error",
            Self::Noop => "noop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Assign an address if the peer has none, then enter `Provisioning`.
    Allocate,
    /// Persist `Provisioning` and continue with `Provision`.
    EnterProvisioning,
    /// Create or update the device peer, then `Provisioned`.
    ProvisionDevice,
    /// Persist `Unprovisioning` and continue with `Unprovision`.
    EnterUnprovisioning,
    /// Remove the device peer, then `Unprovisioned`.
    RemoveFromDevice,
    /// Persist `Deleting` and continue with `Delete`.
    EnterDeleting,
    /// Delete the record and release the address, optionally removing the
    /// device peer first.
    Remove { device: bool },
    /// Record the failure and enter `Error`.
    Fail,
}

/// The transition table. `None` means the event is ignored in that state.
fn transition(state: PeerState, event: &PeerEvent) -> Option<Action> {
    use PeerEvent as E;
    use PeerState as S;

    let action = match (state, event) {
        (_, E::Noop) | (S::Deleted, _) => return None,
        (_, E::Error(_)) => Action::Fail,

        (S::Created, E::Provision) => Action::Allocate,
        (S::Created | S::Unprovisioning | S::Deleting, E::ForceDelete) => Action::Remove { device: false },

        (S::Unprovisioned | S::Error, E::Provision) => Action::EnterProvisioning,
        (S::Provisioning | S::Provisioned, E::Provision) => Action::ProvisionDevice,

        (S::Provisioning | S::Provisioned, E::Unprovision) => Action::EnterUnprovisioning,
        (S::Unprovisioning | S::Unprovisioned, E::Unprovision) => Action::RemoveFromDevice,

        (S::Unprovisioned | S::Provisioning | S::Provisioned | S::Error, E::Delete) => Action::EnterDeleting,
        (S::Deleting, E::Delete) => Action::Remove { device: true },
        (S::Unprovisioned | S::Provisioning | S::Provisioned | S::Error, E::ForceDelete) => {
            Action::Remove { device: false }
        }

        _ => return None,
    };
    Some(action)
}

/// Drives peers through their lifecycle. Only the orchestrator worker
/// calls `handle`, so a peer is never mutated by two flows at once.
pub struct PeerStateMachine {
    peers: Arc<dyn PeerRepository>,
    providers: Arc<ProviderRegistry>,
    tunnels: Arc<TunnelDirectory>,
    pools: Arc<IpPoolAllocator>,
    key_attempts: u32,
}

impl PeerStateMachine {
    pub fn new(
        peers: Arc<dyn PeerRepository>,
        providers: Arc<ProviderRegistry>,
        tunnels: Arc<TunnelDirectory>,
        pools: Arc<IpPoolAllocator>,
        key_attempts: u32,
    ) -> Self {
        Self {
            peers,
            providers,
            tunnels,
            pools,
            key_attempts: key_attempts.max(1),
        }
    }

    /// Apply `event` and every event it leads to. Returns the peer as last
    /// seen; a deleted peer comes back in [`PeerState::Deleted`].
    pub async fn handle(&self, mut peer: Peer, event: PeerEvent) -> Peer {
        let mut event = event;
        loop {
            let Some(action) = transition(peer.state, &event) else {
                if event != PeerEvent::Noop {
                    debug!(peer_id = %peer.id, state = %peer.state, %event, "event ignored in this state");
                }
                return peer;
            };
            debug!(peer_id = %peer.id, state = %peer.state, %event, ?action, "transition");

            event = match self.run(action, &mut peer, &event).await {
                Ok(next) => next,
                Err(e) => PeerEvent::Error(e.to_string()),
            };
        }
    }

    async fn run(&self, action: Action, peer: &mut Peer, event: &PeerEvent) -> Result<PeerEvent, CoreError> {
        match action {
            Action::Allocate => self.allocate(peer).await,
            Action::EnterProvisioning => {
                self.persist(peer, PeerState::Provisioning).await?;
                Ok(PeerEvent::Provision)
            }
            Action::ProvisionDevice => self.provision_device(peer).await,
            Action::EnterUnprovisioning => {
                self.persist(peer, PeerState::Unprovisioning).await?;
                Ok(PeerEvent::Unprovision)
            }
            Action::RemoveFromDevice => self.remove_from_device(peer).await,
            Action::EnterDeleting => {
                self.persist(peer, PeerState::Deleting).await?;
                Ok(PeerEvent::Delete)
            }
            Action::Remove { device } => self.remove(peer, device).await,
            Action::Fail => {
                let message = match event {
                    PeerEvent::Error(message) => message.clone(),
                    other => format!("unexpected failure on {other}"),
                };
                self.fail(peer, message).await;
                Ok(PeerEvent::Noop)
            }
        }
    }

    async fn persist(&self, peer: &mut Peer, state: PeerState) -> Result<(), CoreError> {
        peer.state = state;
        self.peers.update_by_id(peer).await
    }

    // ── Actions ──────────────────────────────────────────────────────

    /// Parks the peer without an address while its interface is absent;
    /// the address is then assigned when it is provisioned.
    async fn allocate(&self, peer: &mut Peer) -> Result<PeerEvent, CoreError> {
        let (tunnel, _) = self.tunnels.profile(peer.tunnel_id, peer.profile_id)?;

        if !self.tunnels.is_present(tunnel.id) {
            self.persist(peer, PeerState::Provisioning).await?;
            info!(peer_id = %peer.id, tunnel = %tunnel.name, "tunnel interface absent, parking peer");
            return Ok(PeerEvent::Unprovision);
        }

        self.ensure_address(peer, &tunnel).await?;
        self.persist(peer, PeerState::Provisioning).await?;
        Ok(PeerEvent::Provision)
    }

    /// Take the next free address when the peer has none. The pool entry
    /// is handed back if the peer cannot be saved with it.
    async fn ensure_address(&self, peer: &mut Peer, tunnel: &Tunnel) -> Result<IpAddr, CoreError> {
        if let Some(address) = peer.address {
            return Ok(address);
        }
        let address = self.pools.get_next_address(tunnel).await?;
        peer.address = Some(address);
        if let Err(e) = self.peers.update_by_id(peer).await {
            peer.address = None;
            if let Err(release) = self.pools.release_address(tunnel, address).await {
                warn!(peer_id = %peer.id, error = %release, "cannot return unsaved address");
            }
            return Err(e);
        }
        info!(peer_id = %peer.id, tunnel = %tunnel.name, %address, "address assigned");
        Ok(address)
    }

    async fn provision_device(&self, peer: &mut Peer) -> Result<PeerEvent, CoreError> {
        let (tunnel, profile) = self.tunnels.profile(peer.tunnel_id, peer.profile_id)?;
        let provider = self.providers.get(&tunnel.backend)?;
        let address = self.ensure_address(peer, &tunnel).await?;

        if peer.has_keypair() {
            self.sync_existing(peer, provider.as_ref(), &tunnel, &profile, address)
                .await?;
        } else {
            let (keypair, remote) = self
                .create_with_fresh_keys(peer, provider.as_ref(), &tunnel, &profile, address)
                .await?;
            debug!(peer_id = %peer.id, remote_id = %remote.remote_id, "device peer created");
            peer.public_key = Some(keypair.public);
            peer.private_key = Some(keypair.private);
        }

        peer.status = None;
        self.persist(peer, PeerState::Provisioned).await?;
        info!(peer_id = %peer.id, tunnel = %tunnel.name, "peer provisioned");
        Ok(PeerEvent::Noop)
    }

    /// Create with a new keypair, retrying on public key collisions.
    async fn create_with_fresh_keys(
        &self,
        peer: &Peer,
        provider: &dyn PeerProvider,
        tunnel: &Tunnel,
        profile: &Profile,
        address: IpAddr,
    ) -> Result<(Keypair, RemoteProviderPeer), CoreError> {
        for attempt in 1..=self.key_attempts {
            let keypair = Keypair::generate();
            let spec = PeerSpec {
                public_key: &keypair.public,
                description: peer.description.as_deref(),
                preshared_key: peer.preshared_key.as_ref(),
                tunnel,
                profile,
                address,
            };
            match provider.create_peer(&spec).await {
                Ok(remote) => return Ok((keypair, remote)),
                Err(e) if e.is_already_exists() => {
                    warn!(peer_id = %peer.id, attempt, "public key collision, retrying with a new keypair");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Transient {
            message: format!("public key collision persisted after {} attempts", self.key_attempts),
        })
    }

    /// Peer already has keys: create if the device lost it, else update.
    async fn sync_existing(
        &self,
        peer: &Peer,
        provider: &dyn PeerProvider,
        tunnel: &Tunnel,
        profile: &Profile,
        address: IpAddr,
    ) -> Result<(), CoreError> {
        let public_key = peer.public_key.as_deref().unwrap_or_default();
        let spec = PeerSpec {
            public_key,
            description: peer.description.as_deref(),
            preshared_key: peer.preshared_key.as_ref(),
            tunnel,
            profile,
            address,
        };
        match provider.get_peer_by_public_key(public_key, tunnel).await {
            Ok(remote) => provider.update_peer(&remote.remote_id, &spec).await,
            Err(e) if e.is_not_found() => provider.create_peer(&spec).await.map(|_| ()),
            Err(e) => Err(e),
        }
    }

    async fn remove_from_device(&self, peer: &mut Peer) -> Result<PeerEvent, CoreError> {
        if let Some(public_key) = peer.public_key.clone() {
            let tunnel = self.tunnels.get(peer.tunnel_id)?;
            let provider = self.providers.get(&tunnel.backend)?;
            delete_tolerant(provider.as_ref(), &tunnel, &public_key).await?;
        }
        self.persist(peer, PeerState::Unprovisioned).await?;
        info!(peer_id = %peer.id, "peer unprovisioned");
        Ok(PeerEvent::Noop)
    }

    async fn remove(&self, peer: &mut Peer, device: bool) -> Result<PeerEvent, CoreError> {
        let tunnel = match self.tunnels.get(peer.tunnel_id) {
            Ok(t) => Some(t),
            Err(e) if !device => {
                warn!(peer_id = %peer.id, error = %e, "tunnel gone, deleting record only");
                None
            }
            Err(e) => return Err(e),
        };

        if device {
            if let (Some(tunnel), Some(public_key)) = (&tunnel, peer.public_key.as_deref()) {
                let provider = self.providers.get(&tunnel.backend)?;
                delete_tolerant(provider.as_ref(), tunnel, public_key).await?;
            }
        }

        match self.peers.delete_by_id(peer.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(peer_id = %peer.id, "record already gone"),
            Err(e) => return Err(e),
        }

        if let (Some(tunnel), Some(address)) = (&tunnel, peer.address) {
            if let Err(e) = self.pools.release_address(tunnel, address).await {
                warn!(peer_id = %peer.id, %address, error = %e, "address release failed");
            }
        }

        peer.state = PeerState::Deleted;
        info!(peer_id = %peer.id, force = !device, "peer deleted");
        Ok(PeerEvent::Noop)
    }

    async fn fail(&self, peer: &mut Peer, message: String) {
        warn!(peer_id = %peer.id, state = %peer.state, error = %message, "peer action failed");
        peer.state = PeerState::Error;
        peer.status = Some(message);
        if let Err(e) = self.peers.update_by_id(peer).await {
            warn!(peer_id = %peer.id, error = %e, "cannot persist failure state");
        }
    }
}

/// Device removal where an already-absent peer counts as success.
async fn delete_tolerant(provider: &dyn PeerProvider, tunnel: &Tunnel, public_key: &str) -> Result<(), CoreError> {
    match provider.delete_peer_by_public_key(tunnel, public_key).await {
        Err(e) if e.is_not_found() => {
            debug!(tunnel = %tunnel.name, "device peer already absent");
            Ok(())
        }
        other => other,
    }
}
