//! Config command handlers. These never contact a device.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = wgkeeper_config::resolve_config_path(global.config.as_deref());

    let out = match args.command {
        ConfigCommand::Path => path.display().to_string(),

        ConfigCommand::Show => wgkeeper_config::load_config(&path)?.to_redacted_toml()?,

        ConfigCommand::Check => {
            let config = wgkeeper_config::load_config(&path)?;
            let service = config.to_service_config()?;
            let interval = match service.reconcile_interval.as_secs() {
                0 => "disabled".to_owned(),
                secs => format!("every {secs}s"),
            };
            format!(
                "{} is valid: {} backend(s), {} tunnel(s), {} user(s); reconciliation {interval}",
                path.display(),
                service.backends.len(),
                service.tunnels.len(),
                service.users.len(),
            )
        }
    };
    output::print_output(&out, global.quiet);
    Ok(())
}
