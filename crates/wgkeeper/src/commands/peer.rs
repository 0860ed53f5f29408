//! Peer command handlers.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tabled::Tabled;
use wgkeeper_core::{CreatePeerRequest, CoreError, Peer, PeerId, Service, ServiceConfig, Tunnel};

use crate::cli::{GlobalOpts, PeerArgs, PeerCommand};
use crate::error::CliError;
use crate::output;

// ── Views ───────────────────────────────────────────────────────────

/// What the CLI prints for a peer. Never carries key secrets.
#[derive(Debug, Serialize)]
struct PeerView {
    id: String,
    username: String,
    tunnel: String,
    profile: String,
    address: Option<String>,
    state: String,
    status: Option<String>,
    public_key: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl PeerView {
    fn new(peer: &Peer, service: &Service) -> Self {
        let tunnel = service.tunnels().get(peer.tunnel_id).ok();
        let profile = tunnel
            .as_ref()
            .and_then(|t| t.profile(peer.profile_id))
            .map_or_else(|| peer.profile_id.to_string(), |p| p.name.clone());
        Self {
            id: peer.id.to_string(),
            username: peer.username.clone(),
            tunnel: tunnel.map_or_else(|| peer.tunnel_id.to_string(), |t| t.name),
            profile,
            address: peer.address.map(|a| a.to_string()),
            state: peer.state.to_string(),
            status: peer.status.clone(),
            public_key: peer.public_key.clone(),
            description: peer.description.clone(),
            created_at: peer.created_at,
        }
    }
}

#[derive(Tabled)]
struct PeerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "User")]
    username: String,
    #[tabled(rename = "Tunnel")]
    tunnel: String,
    #[tabled(rename = "Profile")]
    profile: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn row(p: &PeerView) -> PeerRow {
    PeerRow {
        id: p.id.clone(),
        username: p.username.clone(),
        tunnel: p.tunnel.clone(),
        profile: p.profile.clone(),
        address: p.address.clone().unwrap_or_default(),
        state: p.state.clone(),
        status: p.status.clone().unwrap_or_default(),
    }
}

fn detail(p: &PeerView) -> String {
    [
        format!("ID:          {}", p.id),
        format!("User:        {}", p.username),
        format!("Tunnel:      {}", p.tunnel),
        format!("Profile:     {}", p.profile),
        format!("Address:     {}", p.address.as_deref().unwrap_or("-")),
        format!("State:       {}", p.state),
        format!("Status:      {}", p.status.as_deref().unwrap_or("-")),
        format!("Public key:  {}", p.public_key.as_deref().unwrap_or("-")),
        format!("Description: {}", p.description.as_deref().unwrap_or("-")),
        format!("Created:     {}", p.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
    ]
    .join("\n")
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(config: &ServiceConfig, args: PeerArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let format = global.output;
    let out = match args.command {
        PeerCommand::Create {
            username,
            tunnel,
            profile,
            description,
            preshared_key,
        } => {
            let request = CreatePeerRequest {
                username,
                tunnel,
                profile,
                description,
                preshared_key: preshared_key.map(SecretString::from),
            };
            let view = Service::oneshot(config, |service| async move {
                let orchestrator = service.orchestrator();
                let peer = orchestrator.create_peer(request).await?;
                orchestrator.flush().await?;
                let peer = orchestrator.get_peer(peer.id).await?;
                Ok(PeerView::new(&peer, &service))
            })
            .await?;
            output::render_single(format, &view, detail, |p| p.id.clone())?
        }

        PeerCommand::List { user } => {
            let views = Service::oneshot(config, |service| async move {
                let peers = service.orchestrator().list_peers(user.as_deref()).await?;
                Ok(peers.iter().map(|p| PeerView::new(p, &service)).collect::<Vec<_>>())
            })
            .await?;
            output::render_list(format, &views, row, |p| p.id.clone())?
        }

        PeerCommand::Get { id } => {
            let id: PeerId = id.parse()?;
            let view = Service::oneshot(config, |service| async move {
                let peer = service.orchestrator().get_peer(id).await?;
                Ok(PeerView::new(&peer, &service))
            })
            .await?;
            output::render_single(format, &view, detail, |p| p.id.clone())?
        }

        PeerCommand::Delete { id, force } => {
            let id: PeerId = id.parse()?;
            Service::oneshot(config, |service| async move {
                service.orchestrator().delete_peer(id, force).await
            })
            .await?;
            id.to_string()
        }

        PeerCommand::Reprovision { id } => {
            let id: PeerId = id.parse()?;
            let view = Service::oneshot(config, |service| async move {
                let orchestrator = service.orchestrator();
                orchestrator.reprovision_peer(id).await?;
                orchestrator.flush().await?;
                let peer = orchestrator.get_peer(id).await?;
                Ok(PeerView::new(&peer, &service))
            })
            .await?;
            output::render_single(format, &view, detail, |p| p.id.clone())?
        }

        PeerCommand::Config { id } => {
            let id: PeerId = id.parse()?;
            let (peer, tunnel) = Service::oneshot(config, |service| async move {
                let peer = service.orchestrator().get_peer(id).await?;
                let tunnel = service.tunnels().get(peer.tunnel_id)?;
                Ok((peer, tunnel))
            })
            .await?;
            client_config(&peer, &tunnel)?
        }
    };
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── Client configuration ────────────────────────────────────────────

/// wg-quick configuration for the peer's own device.
fn client_config(peer: &Peer, tunnel: &Tunnel) -> Result<String, CliError> {
    let not_ready = |what: &str| CliError::Validation {
        field: "peer".into(),
        reason: format!("{what}; run `wgkeeper peer get {}` to see its state", peer.id),
    };

    let private_key = peer
        .private_key
        .as_ref()
        .ok_or_else(|| not_ready("peer has no keypair yet"))?;
    let address = peer.address.ok_or_else(|| not_ready("peer has no address yet"))?;
    let server_key = tunnel
        .interface
        .public_key
        .as_deref()
        .ok_or_else(|| not_ready("tunnel interface is not present on the device"))?;
    let endpoint = tunnel
        .interface
        .endpoint
        .as_deref()
        .ok_or_else(|| not_ready("tunnel endpoint is unknown"))?;
    let profile = tunnel
        .profile(peer.profile_id)
        .ok_or_else(|| CoreError::not_found("Profile", peer.profile_id))?;

    let allowed = if profile.ranges.is_empty() {
        "0.0.0.0/0, ::/0".to_owned()
    } else {
        profile.ranges.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    };
    let host_prefix = if address.is_ipv4() { 32 } else { 128 };

    let mut lines = vec![
        "[Interface]".to_owned(),
        format!("PrivateKey = {}", private_key.expose_secret()),
        format!("Address = {address}/{host_prefix}"),
        String::new(),
        "[Peer]".to_owned(),
        format!("PublicKey = {server_key}"),
    ];
    if let Some(psk) = &peer.preshared_key {
        lines.push(format!("PresharedKey = {}", psk.expose_secret()));
    }
    lines.push(format!("AllowedIPs = {allowed}"));
    lines.push(format!("Endpoint = {endpoint}"));
    Ok(lines.join("\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use wgkeeper_core::{PeerState, Profile, ProfileId, TunnelId, TunnelInterface};

    use super::*;

    fn tunnel(present: bool) -> Tunnel {
        let profile_id = ProfileId::from_names("wg0", "lan");
        Tunnel {
            id: TunnelId::from_name("wg0"),
            name: "wg0".into(),
            backend: "edge".into(),
            interface: TunnelInterface {
                name: "wg0".into(),
                public_key: present.then(|| "c2VydmVyLWtleQ==".to_owned()),
                endpoint: present.then(|| "vpn.example.net:51820".to_owned()),
                present,
                ..TunnelInterface::default()
            },
            profiles: BTreeMap::from([(
                profile_id,
                Profile {
                    id: profile_id,
                    name: "lan".into(),
                    ranges: vec!["192.168.1.0/24".parse().unwrap(), "192.168.2.0/24".parse().unwrap()],
                },
            )]),
        }
    }

    fn provisioned() -> Peer {
        let mut peer = Peer::new("alice", TunnelId::from_name("wg0"), ProfileId::from_names("wg0", "lan"));
        peer.public_key = Some("cHVibGlj".into());
        peer.private_key = Some(SecretString::from("cHJpdmF0ZQ=="));
        peer.address = Some("192.168.177.2".parse().unwrap());
        peer.state = PeerState::Provisioned;
        peer
    }

    #[test]
    fn renders_a_wg_quick_configuration() {
        let text = client_config(&provisioned(), &tunnel(true)).unwrap();
        assert_eq!(
            text,
            "[Interface]\n\
             PrivateKey = cHJpdmF0ZQ==\n\
             Address = 192.168.177.2/32\n\
             \n\
             [Peer]\n\
             PublicKey = c2VydmVyLWtleQ==\n\
             AllowedIPs = 192.168.1.0/24, 192.168.2.0/24\n\
             Endpoint = vpn.example.net:51820"
        );
    }

    #[test]
    fn refuses_until_keys_and_interface_exist() {
        let fresh = Peer::new("alice", TunnelId::from_name("wg0"), ProfileId::from_names("wg0", "lan"));
        assert!(matches!(client_config(&fresh, &tunnel(true)), Err(CliError::Validation { .. })));
        assert!(matches!(client_config(&provisioned(), &tunnel(false)), Err(CliError::Validation { .. })));
    }
}
