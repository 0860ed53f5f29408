//! Tunnel listing.

use std::collections::HashMap;

use ipnet::IpNet;
use serde::Serialize;
use tabled::Tabled;
use wgkeeper_core::{Service, ServiceConfig, Tunnel, TunnelId};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct TunnelView {
    name: String,
    backend: String,
    interface: String,
    present: bool,
    endpoint: Option<String>,
    public_key: Option<String>,
    profiles: Vec<ProfileView>,
    peers: usize,
    /// Tunnel network and addresses handed out, once the pool is loaded.
    network: Option<String>,
    addresses_in_use: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ProfileView {
    name: String,
    ranges: Vec<String>,
}

impl TunnelView {
    fn new(tunnel: Tunnel, peers: usize, usage: Option<(IpNet, usize)>) -> Self {
        Self {
            network: usage.map(|(net, _)| net.to_string()),
            addresses_in_use: usage.map(|(_, n)| n),
            profiles: tunnel
                .profiles
                .values()
                .map(|p| ProfileView {
                    name: p.name.clone(),
                    ranges: p.ranges.iter().map(ToString::to_string).collect(),
                })
                .collect(),
            name: tunnel.name,
            backend: tunnel.backend,
            interface: tunnel.interface.name,
            present: tunnel.interface.present,
            endpoint: tunnel.interface.endpoint,
            public_key: tunnel.interface.public_key,
            peers,
        }
    }
}

#[derive(Tabled)]
struct TunnelRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Present")]
    present: String,
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Profiles")]
    profiles: String,
    #[tabled(rename = "Peers")]
    peers: usize,
    #[tabled(rename = "Addresses")]
    addresses: String,
}

fn row(t: &TunnelView) -> TunnelRow {
    TunnelRow {
        name: t.name.clone(),
        backend: t.backend.clone(),
        interface: t.interface.clone(),
        present: if t.present { "yes" } else { "no" }.into(),
        endpoint: t.endpoint.clone().unwrap_or_else(|| "-".into()),
        profiles: t
            .profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        peers: t.peers,
        addresses: match (&t.network, t.addresses_in_use) {
            (Some(net), Some(n)) => format!("{n} in {net}"),
            _ => "-".into(),
        },
    }
}

pub async fn handle(config: &ServiceConfig, global: &GlobalOpts) -> Result<(), CliError> {
    let views = Service::oneshot(config, |service| async move {
        let peers = service.orchestrator().list_peers(None).await?;
        let mut counts: HashMap<TunnelId, usize> = HashMap::new();
        for peer in &peers {
            *counts.entry(peer.tunnel_id).or_default() += 1;
        }
        let mut views = Vec::new();
        for tunnel in service.tunnels().list() {
            let peers = counts.get(&tunnel.id).copied().unwrap_or(0);
            let usage = service.pools().usage(&tunnel).await;
            views.push(TunnelView::new(tunnel, peers, usage));
        }
        Ok(views)
    })
    .await?;

    let out = output::render_list(global.output, &views, row, |t| t.name.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}
