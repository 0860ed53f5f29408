// ── RouterOS provider ──
//
// Maps peer operations onto `/interface/wireguard/peers` commands. Every
// operation checks a session out of the backend's pool and hands it back,
// including on failure.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument, warn};
use wgkeeper_api::{ClientPool, Command, PooledClient, Record, Response};

use super::{PeerProvider, PeerSpec};
use crate::config::{BackendConfig, EndpointConfig};
use crate::error::CoreError;
use crate::model::{InterfaceAddress, InterfaceInfo, RemoteProviderPeer, Tunnel, validate_preshared_key};

const PEERS: &str = "/interface/wireguard/peers";

/// Peer provider for one MikroTik RouterOS device.
pub struct RouterOsProvider {
    name: String,
    pool: ClientPool,
    endpoint: EndpointConfig,
}

impl RouterOsProvider {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            pool: ClientPool::new(config.pool.clone()),
            endpoint: config.endpoint.clone(),
        }
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    fn classify(&self, err: wgkeeper_api::Error) -> CoreError {
        match err {
            wgkeeper_api::Error::PoolExhausted { .. } => CoreError::Unavailable {
                backend: self.name.clone(),
            },
            wgkeeper_api::Error::UntrackedClient { .. } => CoreError::Internal(err.to_string()),
            other => other.into(),
        }
    }

    async fn run(&self, command: &Command) -> Result<Response, CoreError> {
        self.pool.run(command).await.map_err(|e| self.classify(e))
    }

    async fn checkout(&self) -> Result<PooledClient, CoreError> {
        match self.pool.acquire().await {
            Ok(Some(client)) => Ok(client),
            Ok(None) => Err(CoreError::Unavailable {
                backend: self.name.clone(),
            }),
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn checkin(&self, client: PooledClient) -> Result<(), CoreError> {
        self.pool.release(client).await.map_err(|e| self.classify(e))
    }

    /// Attributes shared by `add` and `set`.
    fn peer_attributes(command: Command, spec: &PeerSpec<'_>) -> Result<Command, CoreError> {
        if let Some(psk) = spec.preshared_key {
            validate_preshared_key(psk)?;
        }
        let allowed = spec
            .allowed_addresses()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Ok(command
            .attr("interface", &spec.tunnel.interface.name)
            .attr("public-key", spec.public_key)
            .attr_opt("preshared-key", spec.preshared_key.map(|k| k.expose_secret().to_owned()))
            .attr("comment", spec.comment())
            .attr("allowed-address", allowed)
            .attr("disabled", "no"))
    }

    /// `None` when no configured source yields a host. Device errors propagate.
    async fn resolve_endpoint_host(&self) -> Result<Option<String>, CoreError> {
        if let Some(host) = &self.endpoint.host {
            return Ok(Some(host.clone()));
        }

        if let Some(source) = &self.endpoint.source_interface {
            let resp = self
                .run(&Command::new("/ip/address/print").query("interface", source))
                .await?;
            if let Some(net) = resp.records.iter().find_map(parse_address) {
                return Ok(Some(net.addr().to_string()));
            }
            debug!(backend = %self.name, interface = %source, "source interface has no address");
        }

        if self.endpoint.use_cloud {
            let resp = self.run(&Command::new("/ip/cloud/print")).await?;
            let cloud = resp.records.first();
            let host = cloud
                .and_then(|r| r.get("public-address"))
                .filter(|a| !a.is_empty())
                .or_else(|| cloud.and_then(|r| r.get("dns-name")).filter(|d| !d.is_empty()));
            if let Some(host) = host {
                return Ok(Some(host.to_owned()));
            }
        }

        warn!(backend = %self.name, "no endpoint host resolvable");
        Ok(None)
    }
}

#[async_trait]
impl PeerProvider for RouterOsProvider {
    fn backend(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(backend = %self.name, tunnel = %spec.tunnel.name))]
    async fn create_peer(&self, spec: &PeerSpec<'_>) -> Result<RemoteProviderPeer, CoreError> {
        let command = Self::peer_attributes(Command::new(format!("{PEERS}/add")), spec)?;
        let resp = self.run(&command).await?;
        let Some(remote_id) = resp.ret().filter(|id| !id.is_empty()) else {
            // No `ret`: read the new peer back by its key.
            debug!("device returned no id, looking the peer up");
            return self
                .get_peer_by_public_key(spec.public_key, spec.tunnel)
                .await
                .map_err(|e| match e {
                    e if e.is_not_found() => CoreError::Transient {
                        message: format!("device peer created without an id and not found afterwards: {e}"),
                    },
                    e => e,
                });
        };
        debug!(remote_id = %remote_id, "device peer created");
        Ok(RemoteProviderPeer {
            remote_id: remote_id.to_owned(),
            public_key: spec.public_key.to_owned(),
            allowed_addresses: spec.allowed_addresses(),
            rx_bytes: 0,
            tx_bytes: 0,
            disabled: false,
            preshared_key: spec.preshared_key.cloned(),
            comment: Some(spec.comment()),
        })
    }

    #[instrument(skip_all, fields(backend = %self.name, remote_id = %remote_id))]
    async fn update_peer(&self, remote_id: &str, spec: &PeerSpec<'_>) -> Result<(), CoreError> {
        let mut command = Self::peer_attributes(
            Command::new(format!("{PEERS}/set")).attr(".id", remote_id),
            spec,
        )?;
        if spec.preshared_key.is_none() {
            command = command.attr("preshared-key", "");
        }
        self.run(&command).await?;
        Ok(())
    }

    async fn get_peer_by_public_key(
        &self,
        public_key: &str,
        tunnel: &Tunnel,
    ) -> Result<RemoteProviderPeer, CoreError> {
        let resp = self.run(&print_peer(tunnel, public_key)).await?;
        match resp.records.as_slice() {
            [record] => Ok(parse_peer(record)),
            _ => Err(CoreError::not_found("Remote peer", public_key)),
        }
    }

    async fn list_peers(&self, tunnel: &Tunnel) -> Result<Vec<RemoteProviderPeer>, CoreError> {
        let resp = self
            .run(&Command::new(format!("{PEERS}/print")).query("interface", &tunnel.interface.name))
            .await?;
        Ok(resp.records.iter().map(parse_peer).collect())
    }

    #[instrument(skip_all, fields(backend = %self.name, tunnel = %tunnel.name))]
    async fn delete_peer_by_public_key(&self, tunnel: &Tunnel, public_key: &str) -> Result<(), CoreError> {
        let mut client = self.checkout().await?;
        let result: Result<(), wgkeeper_api::Error> = async {
            let found = client.execute(&print_peer(tunnel, public_key)).await?;
            // Same exactly-one rule as `get_peer_by_public_key`.
            let remote_id = match found.records.as_slice() {
                [record] => record.get(".id").unwrap_or_default(),
                [] => {
                    debug!("device peer already absent");
                    return Ok(());
                }
                many => {
                    warn!(matches = many.len(), "public key is ambiguous on the device, not removing");
                    return Ok(());
                }
            };
            client
                .execute(&Command::new(format!("{PEERS}/remove")).attr(".id", remote_id))
                .await?;
            debug!(remote_id = %remote_id, "device peer removed");
            Ok(())
        }
        .await;
        self.checkin(client).await?;
        result.map_err(|e| self.classify(e))
    }

    async fn get_interface_address(&self, tunnel: &Tunnel) -> Result<InterfaceAddress, CoreError> {
        let resp = self
            .run(&Command::new("/ip/address/print").query("interface", &tunnel.interface.name))
            .await?;
        let net = resp
            .records
            .iter()
            .find_map(parse_address)
            .ok_or_else(|| CoreError::not_found("Interface address", &tunnel.interface.name))?;
        Ok(InterfaceAddress {
            address: net.addr(),
            network: net.trunc(),
        })
    }

    async fn get_tunnel_interface_info(&self, interface: &str) -> Result<InterfaceInfo, CoreError> {
        let resp = self
            .run(&Command::new("/interface/wireguard/print").query("name", interface))
            .await?;
        let record = resp
            .records
            .first()
            .ok_or_else(|| CoreError::not_found("Interface", interface))?;

        let public_key = record.get("public-key").unwrap_or_default().to_owned();
        let port = record.get("listen-port").unwrap_or("51820").to_owned();
        let enabled = !record.get_bool("disabled").unwrap_or(false);
        let host = self.resolve_endpoint_host().await?;

        Ok(InterfaceInfo {
            endpoint: host.map(|h| join_host_port(&h, &port)),
            public_key,
            enabled,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn print_peer(tunnel: &Tunnel, public_key: &str) -> Command {
    Command::new(format!("{PEERS}/print"))
        .query("interface", &tunnel.interface.name)
        .query("public-key", public_key)
}

fn parse_peer(record: &Record) -> RemoteProviderPeer {
    RemoteProviderPeer {
        remote_id: record.get(".id").unwrap_or_default().to_owned(),
        public_key: record.get("public-key").unwrap_or_default().to_owned(),
        allowed_addresses: record
            .get("allowed-address")
            .unwrap_or_default()
            .split(',')
            .filter_map(parse_net)
            .collect(),
        rx_bytes: record.get_u64("rx").unwrap_or(0),
        tx_bytes: record.get_u64("tx").unwrap_or(0),
        disabled: record.get_bool("disabled").unwrap_or(false),
        preshared_key: record
            .get("preshared-key")
            .filter(|k| !k.is_empty())
            .map(|k| SecretString::from(k.to_owned())),
        comment: record.get("comment").map(str::to_owned),
    }
}

fn parse_net(text: &str) -> Option<IpNet> {
    let text = text.trim();
    text.parse::<IpNet>()
        .ok()
        .or_else(|| text.parse::<IpAddr>().ok().map(IpNet::from))
}

fn parse_address(record: &Record) -> Option<IpNet> {
    record.get("address").and_then(parse_net)
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use wgkeeper_api::testing::{FakeDevice, done, done_ret, row, trap};
    use wgkeeper_api::{PoolConfig, Reply};

    use super::*;
    use crate::model::{Profile, ProfileId, TunnelId, TunnelInterface};

    fn backend(device: &FakeDevice, endpoint: EndpointConfig) -> RouterOsProvider {
        RouterOsProvider::new(&BackendConfig {
            name: "edge".into(),
            pool: PoolConfig::new(device.client_config()),
            endpoint,
        })
    }

    fn tunnel() -> (Tunnel, Profile) {
        let profile = Profile {
            id: ProfileId::from_names("wg0", "lan"),
            name: "lan".into(),
            ranges: vec!["192.168.1.0/24".parse().unwrap(), "192.168.2.0/24".parse().unwrap()],
        };
        let tunnel = Tunnel {
            id: TunnelId::from_name("wg0"),
            name: "wg0".into(),
            backend: "edge".into(),
            interface: TunnelInterface {
                name: "wg0".into(),
                present: true,
                ..TunnelInterface::default()
            },
            profiles: BTreeMap::from([(profile.id, profile.clone())]),
        };
        (tunnel, profile)
    }

    #[tokio::test]
    async fn create_sends_host_route_first_and_returns_remote_id() {
        let device = FakeDevice::start(|cmd| match cmd.path() {
            "/interface/wireguard/peers/add" => vec![done_ret("*1A")],
            _ => vec![done()],
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();

        let remote = provider
            .create_peer(&PeerSpec {
                public_key: "PUBKEY=",
                description: Some("laptop"),
                preshared_key: None,
                tunnel: &tunnel,
                profile: &profile,
                address: "192.168.177.2".parse().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(remote.remote_id, "*1A");
        let sent = device.requests_to("/interface/wireguard/peers/add");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attribute("interface"), Some("wg0"));
        assert_eq!(sent[0].attribute("comment"), Some("wgkeeper: laptop"));
        assert_eq!(
            sent[0].attribute("allowed-address"),
            Some("192.168.177.2/32,192.168.1.0/24,192.168.2.0/24")
        );
        assert_eq!(sent[0].attribute("preshared-key"), None);
    }

    #[tokio::test]
    async fn create_without_returned_id_reads_the_peer_back() {
        let device = FakeDevice::start(|cmd| match cmd.path() {
            "/interface/wireguard/peers/print" => vec![
                row(&[(".id", "*2F"), ("public-key", "PUBKEY="), ("comment", "wgkeeper")]),
                done(),
            ],
            _ => vec![done()],
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();

        let remote = provider
            .create_peer(&PeerSpec {
                public_key: "PUBKEY=",
                description: None,
                preshared_key: None,
                tunnel: &tunnel,
                profile: &profile,
                address: "192.168.177.2".parse().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(remote.remote_id, "*2F");
        let lookups = device.requests_to("/interface/wireguard/peers/print");
        assert_eq!(lookups.len(), 1);
        assert!(lookups[0].queries().iter().any(|(_, v)| v == "PUBKEY="));
    }

    #[tokio::test]
    async fn create_without_id_or_readback_is_transient() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();

        let err = provider
            .create_peer(&PeerSpec {
                public_key: "PUBKEY=",
                description: None,
                preshared_key: None,
                tunnel: &tunnel,
                profile: &profile,
                address: "192.168.177.2".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient { .. }));
    }

    #[tokio::test]
    async fn update_reenables_and_clears_a_dropped_preshared_key() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();

        provider
            .update_peer(
                "*4",
                &PeerSpec {
                    public_key: "PUBKEY=",
                    description: None,
                    preshared_key: None,
                    tunnel: &tunnel,
                    profile: &profile,
                    address: "192.168.177.2".parse().unwrap(),
                },
            )
            .await
            .unwrap();

        let sent = device.requests_to("/interface/wireguard/peers/set");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attribute(".id"), Some("*4"));
        assert_eq!(sent[0].attribute("disabled"), Some("no"));
        assert_eq!(sent[0].attribute("preshared-key"), Some(""));
    }

    #[tokio::test]
    async fn duplicate_key_is_already_exists() {
        let device = FakeDevice::start(|_| vec![trap("failure: entry already exists"), done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();

        let err = provider
            .create_peer(&PeerSpec {
                public_key: "PUBKEY=",
                description: None,
                preshared_key: None,
                tunnel: &tunnel,
                profile: &profile,
                address: "10.8.0.2".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn malformed_preshared_key_never_reaches_the_device() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, profile) = tunnel();
        let psk = SecretString::from("c2hvcnQ=".to_string());

        let err = provider
            .update_peer(
                "*1",
                &PeerSpec {
                    public_key: "PUBKEY=",
                    description: None,
                    preshared_key: Some(&psk),
                    tunnel: &tunnel,
                    profile: &profile,
                    address: "10.8.0.2".parse().unwrap(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn delete_looks_up_then_removes() {
        let device = FakeDevice::start(|cmd| match cmd.path() {
            "/interface/wireguard/peers/print" => vec![
                row(&[(".id", "*7"), ("public-key", "PUBKEY="), ("interface", "wg0")]),
                done(),
            ],
            _ => vec![done()],
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        provider.delete_peer_by_public_key(&tunnel, "PUBKEY=").await.unwrap();

        let paths: Vec<String> = device.requests().iter().map(|c| c.path().to_owned()).collect();
        assert_eq!(
            paths,
            ["/interface/wireguard/peers/print", "/interface/wireguard/peers/remove"]
        );
        assert_eq!(device.requests()[1].attribute(".id"), Some("*7"));
        assert_eq!(provider.pool().stats().await.in_use, 0);
    }

    #[tokio::test]
    async fn delete_of_absent_peer_is_a_no_op() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        provider.delete_peer_by_public_key(&tunnel, "GONE=").await.unwrap();
        assert!(device.requests_to("/interface/wireguard/peers/remove").is_empty());
    }

    #[tokio::test]
    async fn delete_of_ambiguous_key_removes_nothing() {
        let device = FakeDevice::start(|cmd| match cmd.path() {
            "/interface/wireguard/peers/print" => vec![
                row(&[(".id", "*1"), ("public-key", "DUP=")]),
                row(&[(".id", "*2"), ("public-key", "DUP=")]),
                done(),
            ],
            _ => vec![done()],
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        provider.delete_peer_by_public_key(&tunnel, "DUP=").await.unwrap();
        assert!(device.requests_to("/interface/wireguard/peers/remove").is_empty());
        assert_eq!(provider.pool().stats().await.in_use, 0);
    }

    #[tokio::test]
    async fn lookup_requires_exactly_one_match() {
        let device = FakeDevice::start(|_| {
            vec![
                row(&[(".id", "*1"), ("public-key", "DUP=")]),
                row(&[(".id", "*2"), ("public-key", "DUP=")]),
                done(),
            ]
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        let err = provider.get_peer_by_public_key("DUP=", &tunnel).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remote_peers_are_parsed() {
        let device = FakeDevice::start(|_| {
            vec![
                row(&[
                    (".id", "*3"),
                    ("public-key", "PK="),
                    ("allowed-address", "10.8.0.2/32,192.168.1.0/24"),
                    ("rx", "1024"),
                    ("tx", "2048"),
                    ("disabled", "true"),
                    ("preshared-key", "UFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFM="),
                    ("comment", "wgkeeper"),
                ]),
                done(),
            ]
        })
        .await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        let peers = provider.list_peers(&tunnel).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].remote_id, "*3");
        assert_eq!(
            peers[0].allowed_addresses,
            vec!["10.8.0.2/32".parse::<IpNet>().unwrap(), "192.168.1.0/24".parse().unwrap()]
        );
        assert_eq!((peers[0].rx_bytes, peers[0].tx_bytes), (1024, 2048));
        assert_eq!(peers[0].comment.as_deref(), Some("wgkeeper"));
        assert!(peers[0].disabled);
        assert_eq!(
            peers[0].preshared_key.as_ref().map(|k| k.expose_secret().to_owned()).as_deref(),
            Some("UFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFNLUFM=")
        );
    }

    #[tokio::test]
    async fn interface_address_splits_host_and_network() {
        let device = FakeDevice::start(|_| vec![row(&[("address", "10.8.0.1/24")]), done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        let (tunnel, _) = tunnel();

        let addr = provider.get_interface_address(&tunnel).await.unwrap();
        assert_eq!(addr.address, "10.8.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.network, "10.8.0.0/24".parse::<IpNet>().unwrap());
    }

    fn interface_device(cloud: Vec<Reply>) -> impl Fn(&Command) -> Vec<Reply> + Send + Sync + 'static {
        move |cmd: &Command| match cmd.path() {
            "/interface/wireguard/print" => vec![
                row(&[("public-key", "IFACEKEY="), ("listen-port", "13231"), ("disabled", "false")]),
                done(),
            ],
            "/ip/address/print" if cmd.queries().iter().any(|(_, v)| v == "ether1") => {
                vec![row(&[("address", "203.0.113.7/24")]), done()]
            }
            "/ip/cloud/print" => cloud.clone(),
            _ => vec![done()],
        }
    }

    #[tokio::test]
    async fn endpoint_prefers_configured_host() {
        let device = FakeDevice::start(interface_device(vec![done()])).await;
        let provider = backend(
            &device,
            EndpointConfig {
                host: Some("vpn.example.net".into()),
                source_interface: Some("ether1".into()),
                use_cloud: true,
            },
        );

        let info = provider.get_tunnel_interface_info("wg0").await.unwrap();
        assert_eq!(info.endpoint.as_deref(), Some("vpn.example.net:13231"));
        assert_eq!(info.public_key, "IFACEKEY=");
        assert!(info.enabled);
        assert!(device.requests_to("/ip/address/print").is_empty());
    }

    #[tokio::test]
    async fn endpoint_falls_back_to_source_interface_then_cloud() {
        let device = FakeDevice::start(interface_device(vec![
            row(&[("public-address", ""), ("dns-name", "abc.sn.mynetname.net")]),
            done(),
        ]))
        .await;

        let by_source = backend(
            &device,
            EndpointConfig {
                source_interface: Some("ether1".into()),
                ..EndpointConfig::default()
            },
        );
        let info = by_source.get_tunnel_interface_info("wg0").await.unwrap();
        assert_eq!(info.endpoint.as_deref(), Some("203.0.113.7:13231"));

        let by_cloud = backend(
            &device,
            EndpointConfig {
                use_cloud: true,
                ..EndpointConfig::default()
            },
        );
        let info = by_cloud.get_tunnel_interface_info("wg0").await.unwrap();
        assert_eq!(info.endpoint.as_deref(), Some("abc.sn.mynetname.net:13231"));
    }

    #[tokio::test]
    async fn unresolvable_endpoint_still_reports_the_interface() {
        let device = FakeDevice::start(interface_device(vec![done()])).await;
        let provider = backend(
            &device,
            EndpointConfig {
                source_interface: Some("ether9".into()),
                use_cloud: true,
                ..EndpointConfig::default()
            },
        );

        let info = provider.get_tunnel_interface_info("wg0").await.unwrap();
        assert_eq!(info.endpoint, None);
        assert_eq!(info.public_key, "IFACEKEY=");
        assert!(info.enabled);
    }

    #[tokio::test]
    async fn missing_interface_is_not_found() {
        let device = FakeDevice::start(|_| vec![done()]).await;
        let provider = backend(&device, EndpointConfig::default());
        assert!(provider.get_tunnel_interface_info("wg0").await.unwrap_err().is_not_found());
    }
}
