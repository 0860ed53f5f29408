//! Command dispatch: bridges CLI args -> service operations -> output.

pub mod config_cmd;
pub mod peer;
pub mod serve;
pub mod tunnels;

use wgkeeper_config::Config;
use wgkeeper_core::ServiceConfig;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Load the file named by `--config` (or the default) and translate it.
pub fn load(global: &GlobalOpts) -> Result<(Config, ServiceConfig), CliError> {
    let path = wgkeeper_config::resolve_config_path(global.config.as_deref());
    let config = wgkeeper_config::load_config(&path)?;
    let service = config.to_service_config()?;
    Ok((config, service))
}

/// Dispatch a service-bound command to its handler.
pub async fn dispatch(cmd: Command, config: &ServiceConfig, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Serve => serve::handle(config).await,
        Command::Peer(args) => peer::handle(config, args, global).await,
        Command::Tunnels => tunnels::handle(config, global).await,
        Command::Config(args) => config_cmd::handle(args, global),
    }
}
