//! WireGuard peer lifecycle management for RouterOS backends.
//!
//! - **[`Service`]** -- facade wiring every component from a
//!   [`ServiceConfig`]. [`Service::oneshot()`] runs a single request with no
//!   ticker and waits for its queued work.
//!
//! - **[`PeerOrchestrator`]** -- accepts create/delete/reprovision requests,
//!   writes the initiating record, and queues the rest on a single worker
//!   task so no peer is ever mutated by two flows at once.
//!
//! - **[`PeerStateMachine`]** -- `(state, event) -> action` table driving a
//!   peer through `Created`, `Provisioning`, `Provisioned`, and back down to
//!   `Deleted`, recording failures on the peer instead of returning them.
//!
//! - **[`IpPoolAllocator`]** -- per-tunnel address pools, derived lazily
//!   from the interface address reported by the device.
//!
//! - **[`TunnelDirectory`]** -- configured tunnels plus their live interface
//!   state; reports interface drops and returns to the orchestrator.
//!
//! - **Providers** ([`provider`]) -- the [`PeerProvider`] seam and its
//!   RouterOS implementation on top of `wgkeeper-api`.

pub mod config;
pub mod error;
pub mod fsm;
pub mod ippool;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod reconcile;
pub mod repository;
pub mod service;
pub mod store;
pub mod tunnels;

#[cfg(test)]
mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{BackendConfig, EndpointConfig, ProfileConfig, ServiceConfig, TunnelConfig, UserConfig};
pub use error::CoreError;
pub use fsm::{PeerEvent, PeerStateMachine};
pub use ippool::{IpPool, IpPoolAllocator};
pub use orchestrator::{CreatePeerRequest, PeerOrchestrator};
pub use provider::{PeerProvider, PeerSpec, ProviderRegistry, RouterOsProvider};
pub use reconcile::ReconciliationService;
pub use repository::{InterfaceRecord, InterfaceRepository, PeerRepository, UserDirectory};
pub use service::Service;
pub use store::{MemoryStore, StaticDirectory};
pub use tunnels::{TunnelDirectory, TunnelEvent, TunnelListener};

pub use model::{
    InterfaceAddress, InterfaceInfo, Keypair, Peer, PeerId, PeerState, Profile, ProfileId, RemoteProviderPeer, Tunnel,
    TunnelId, TunnelInterface,
};
