// ── Peer providers ──
//
// A provider translates peer operations into device commands for one
// backend. The orchestrator only sees the `PeerProvider` trait; the
// RouterOS implementation lives in `routeros`.

mod routeros;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CoreError;
use crate::model::{InterfaceAddress, InterfaceInfo, Profile, RemoteProviderPeer, Tunnel};

pub use routeros::RouterOsProvider;

/// Comment prefix marking peers this service owns.
pub const COMMENT_TAG: &str = "wgkeeper";

/// Desired device-side configuration of one peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerSpec<'a> {
    pub public_key: &'a str,
    pub description: Option<&'a str>,
    pub preshared_key: Option<&'a SecretString>,
    pub tunnel: &'a Tunnel,
    pub profile: &'a Profile,
    pub address: IpAddr,
}

impl PeerSpec<'_> {
    pub fn comment(&self) -> String {
        comment_for(self.description)
    }

    pub fn allowed_addresses(&self) -> Vec<IpNet> {
        allowed_addresses(self.address, self.profile)
    }

    /// Whether the device already carries exactly this configuration.
    /// A disabled peer never matches, since an update re-enables it.
    pub fn matches(&self, remote: &RemoteProviderPeer) -> bool {
        !remote.disabled
            && remote.allowed_addresses == self.allowed_addresses()
            && remote.comment.as_deref() == Some(self.comment().as_str())
            && remote.preshared_key.as_ref().map(|k| k.expose_secret())
                == self.preshared_key.map(|k| k.expose_secret())
    }
}

/// Operations the core needs from a backend.
#[async_trait]
pub trait PeerProvider: Send + Sync {
    /// Configured backend name.
    fn backend(&self) -> &str;

    /// Add a peer. `AlreadyExists` if the public key is taken.
    async fn create_peer(&self, spec: &PeerSpec<'_>) -> Result<RemoteProviderPeer, CoreError>;

    async fn update_peer(&self, remote_id: &str, spec: &PeerSpec<'_>) -> Result<(), CoreError>;

    /// Exactly one match, otherwise `NotFound`.
    async fn get_peer_by_public_key(
        &self,
        public_key: &str,
        tunnel: &Tunnel,
    ) -> Result<RemoteProviderPeer, CoreError>;

    /// Every peer on the tunnel interface.
    async fn list_peers(&self, tunnel: &Tunnel) -> Result<Vec<RemoteProviderPeer>, CoreError>;

    /// Remove by public key. Succeeds when the peer is already gone.
    async fn delete_peer_by_public_key(&self, tunnel: &Tunnel, public_key: &str) -> Result<(), CoreError>;

    async fn get_interface_address(&self, tunnel: &Tunnel) -> Result<InterfaceAddress, CoreError>;

    async fn get_tunnel_interface_info(&self, interface: &str) -> Result<InterfaceInfo, CoreError>;

    /// Release connections held for this backend.
    async fn close(&self) {}
}

/// `wgkeeper` or `wgkeeper: <description>`.
pub fn comment_for(description: Option<&str>) -> String {
    match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => format!("{COMMENT_TAG}: {d}"),
        None => COMMENT_TAG.to_owned(),
    }
}

/// The description carried by an owned comment, `None` if not ours.
pub fn parse_comment(comment: &str) -> Option<Option<&str>> {
    let rest = comment.strip_prefix(COMMENT_TAG)?;
    if rest.is_empty() {
        return Some(None);
    }
    rest.strip_prefix(": ").map(Some)
}

/// Peer host route first, then the profile ranges in configured order.
pub fn allowed_addresses(address: IpAddr, profile: &Profile) -> Vec<IpNet> {
    let mut out = Vec::with_capacity(profile.ranges.len() + 1);
    out.push(IpNet::from(address));
    out.extend(profile.ranges.iter().copied());
    out
}

// ── Registry ─────────────────────────────────────────────────────────

/// Providers keyed by backend name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn PeerProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: Arc<dyn PeerProvider>) {
        self.providers.insert(provider.backend().to_owned(), provider);
    }

    pub fn get(&self, backend: &str) -> Result<Arc<dyn PeerProvider>, CoreError> {
        self.providers
            .get(backend)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Backend", backend))
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.providers.contains_key(backend)
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub async fn close_all(&self) {
        for provider in self.providers.values() {
            provider.close().await;
        }
    }
}
