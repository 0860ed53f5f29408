// ── Device-side views ──
//
// Ephemeral mirrors of what a backend currently reports. Never persisted.

use std::net::IpAddr;

use ipnet::IpNet;
use secrecy::SecretString;
use serde::Serialize;

/// A WireGuard peer as configured on the device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteProviderPeer {
    /// Device-local handle (`.id` on RouterOS).
    pub remote_id: String,
    pub public_key: String,
    pub allowed_addresses: Vec<IpNet>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub disabled: bool,
    #[serde(skip)]
    pub preshared_key: Option<SecretString>,
    /// Raw comment tag, including the ownership prefix.
    pub comment: Option<String>,
}

/// The address a tunnel interface holds and the network it sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub network: IpNet,
}

/// Interface facts needed to hand out client configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// `host:port`, `None` when no endpoint host could be resolved.
    pub endpoint: Option<String>,
    pub public_key: String,
    pub enabled: bool,
}
