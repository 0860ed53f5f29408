// ── Tunnel address pools ──
//
// One pool per (backend, tunnel), created lazily from the interface's
// address on the device and seeded with the addresses of persisted peers.
// A single mutex guards every pool: allocation and release are serialized
// across all tunnels.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::model::{Tunnel, TunnelId};
use crate::provider::ProviderRegistry;
use crate::repository::PeerRepository;

/// Addresses of one tunnel network.
#[derive(Debug, Clone)]
pub struct IpPool {
    network: IpNet,
    reserved: BTreeSet<IpAddr>,
    in_use: BTreeSet<IpAddr>,
}

impl IpPool {
    pub fn new(network: IpNet, reserved: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            network: network.trunc(),
            reserved: reserved.into_iter().collect(),
            in_use: BTreeSet::new(),
        }
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Lowest host address that is neither reserved nor in use.
    pub fn next_free(&self) -> Option<IpAddr> {
        self.network
            .hosts()
            .find(|addr| self.is_host(*addr) && !self.reserved.contains(addr) && !self.in_use.contains(addr))
    }

    pub fn allocate(&mut self) -> Option<IpAddr> {
        let addr = self.next_free()?;
        self.in_use.insert(addr);
        Some(addr)
    }

    /// Record an address already handed out. `false` if it cannot belong here.
    pub fn mark_in_use(&mut self, addr: IpAddr) -> bool {
        if !self.network.contains(&addr) || !self.is_host(addr) || self.reserved.contains(&addr) {
            return false;
        }
        self.in_use.insert(addr)
    }

    /// `false` if the address was not in use.
    pub fn release(&mut self, addr: IpAddr) -> bool {
        self.in_use.remove(&addr)
    }

    /// IPv4 networks wider than /31 lose their network and broadcast
    /// addresses; IPv6 has neither.
    fn is_host(&self, addr: IpAddr) -> bool {
        match self.network {
            IpNet::V4(net) if net.prefix_len() < 31 => {
                addr != IpAddr::V4(net.network()) && addr != IpAddr::V4(net.broadcast())
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    backend: String,
    tunnel: TunnelId,
}

impl PoolKey {
    fn of(tunnel: &Tunnel) -> Self {
        Self {
            backend: tunnel.backend.clone(),
            tunnel: tunnel.id,
        }
    }
}

/// Owns every tunnel's address pool.
pub struct IpPoolAllocator {
    providers: Arc<ProviderRegistry>,
    peers: Arc<dyn PeerRepository>,
    pools: Mutex<HashMap<PoolKey, IpPool>>,
}

impl IpPoolAllocator {
    pub fn new(providers: Arc<ProviderRegistry>, peers: Arc<dyn PeerRepository>) -> Self {
        Self {
            providers,
            peers,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Hand out the lowest free address of the tunnel network.
    pub async fn get_next_address(&self, tunnel: &Tunnel) -> Result<IpAddr, CoreError> {
        let key = PoolKey::of(tunnel);
        let mut pools = self.pools.lock().await;
        if !pools.contains_key(&key) {
            let pool = self.load_pool(tunnel).await?;
            pools.insert(key.clone(), pool);
        }
        let pool = pools
            .get_mut(&key)
            .ok_or_else(|| CoreError::Internal("address pool vanished under lock".into()))?;

        let addr = pool.allocate().ok_or_else(|| CoreError::AddressesExhausted {
            tunnel: tunnel.name.clone(),
            network: pool.network().to_string(),
        })?;
        debug!(tunnel = %tunnel.name, address = %addr, "address allocated");
        Ok(addr)
    }

    /// Return an address to its pool. Releasing an address that is not in
    /// use is an error; a pool that was never loaded has nothing to release.
    pub async fn release_address(&self, tunnel: &Tunnel, address: IpAddr) -> Result<(), CoreError> {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(&PoolKey::of(tunnel)) else {
            debug!(tunnel = %tunnel.name, address = %address, "pool not loaded, nothing to release");
            return Ok(());
        };
        if !pool.release(address) {
            return Err(CoreError::not_found("Allocated address", address));
        }
        debug!(tunnel = %tunnel.name, address = %address, "address released");
        Ok(())
    }

    pub async fn delete_pool(&self, tunnel: &Tunnel) -> Result<(), CoreError> {
        self.pools
            .lock()
            .await
            .remove(&PoolKey::of(tunnel))
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found("Address pool", &tunnel.name))
    }

    /// Network and number of addresses in use, if the pool is loaded.
    pub async fn usage(&self, tunnel: &Tunnel) -> Option<(IpNet, usize)> {
        self.pools
            .lock()
            .await
            .get(&PoolKey::of(tunnel))
            .map(|p| (p.network(), p.in_use()))
    }

    async fn load_pool(&self, tunnel: &Tunnel) -> Result<IpPool, CoreError> {
        let provider = self.providers.get(&tunnel.backend)?;
        let iface = provider.get_interface_address(tunnel).await?;
        let mut pool = IpPool::new(iface.network, [iface.address]);

        let mut seeded = 0usize;
        for peer in self.peers.find_by_tunnel_id(tunnel.id).await? {
            if let Some(addr) = peer.address {
                if pool.mark_in_use(addr) {
                    seeded += 1;
                }
            }
        }
        info!(
            tunnel = %tunnel.name,
            network = %pool.network(),
            reserved = %iface.address,
            seeded,
            "address pool loaded"
        );
        Ok(pool)
    }
}
