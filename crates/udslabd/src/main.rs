//! udslabd - Simulated diagnostic device daemon
//!
//! Serves one simulated ECU speaking the UDS subset over the hex/JSON HTTP
//! frame, and registers it with the lab registry at startup.
//!
//! # Usage
//!
//! Built-in demo device:
//! ```bash
//! ./udslabd --no-register
//! ```
//!
//! With a device description:
//! ```bash
//! ./udslabd --config devices/demo.toml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use udslab_engine::DiagnosticEngine;
use udslab_node::Instance;

mod config;

use config::{DeviceConfig, ListenerDef};

#[derive(Parser, Debug)]
#[command(name = "udslabd")]
#[command(about = "Simulated UDS diagnostic device daemon")]
struct Args {
    /// Configuration file path (TOML format).
    /// Without it the built-in demo device is served.
    #[arg(short, long)]
    config: Option<String>,

    /// Listener override: `tcp:<addr>:<port>` or `unix:<path>`
    #[arg(long)]
    listen: Option<String>,

    /// Registry URL override
    #[arg(long)]
    registry_url: Option<String>,

    /// Skip registry registration (standalone operation)
    #[arg(long)]
    no_register: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose {
        "udslabd=debug,udslab_engine=debug,udslab_node=debug"
    } else {
        "udslabd=info,udslab_engine=info,udslab_node=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        info!("Loading config from: {}", config_path);
        DeviceConfig::load(config_path)?
    } else {
        info!("No config file given, serving the built-in demo device");
        DeviceConfig::default_demo()
    };

    // Apply command-line overrides
    if let Some(listen) = &args.listen {
        config.listener = parse_listen(listen)?;
    }
    if let Some(url) = &args.registry_url {
        config.registry.url = url.clone();
    }
    if args.no_register {
        config.registry.register = false;
    }

    info!(
        id = %config.id,
        name = %config.name,
        network = %config.listener.network,
        addr = %config.listener.addr,
        register = config.registry.register,
        "Starting device"
    );

    let engine = Arc::new(DiagnosticEngine::new(config.engine_config()?)?);
    let instance = Instance::new(engine, config.instance_config()?)?;

    let bound = instance.bind().await?;
    info!(addr = %bound.external_addr(), "Device ready - waiting for requests");

    bound.serve().await?;
    Ok(())
}

/// Parse a `<network>:<address>` listener override.
fn parse_listen(value: &str) -> Result<ListenerDef> {
    let (network, addr) = value
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("listener must be <network>:<address>, got `{value}`"))?;
    if network != "tcp" && network != "unix" {
        return Err(anyhow::anyhow!(
            "unsupported listener network `{network}`, must be unix or tcp"
        ));
    }
    Ok(ListenerDef {
        network: network.to_string(),
        addr: addr.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_override_parsing() {
        let def = parse_listen("tcp:127.0.0.1:9009").unwrap();
        assert_eq!(def.network, "tcp");
        assert_eq!(def.addr, "127.0.0.1:9009");

        let def = parse_listen("unix:/run/dev.sock").unwrap();
        assert_eq!(def.network, "unix");
        assert_eq!(def.addr, "/run/dev.sock");

        assert!(parse_listen("vcan0").is_err());
        assert!(parse_listen("udp:1.2.3.4:1").is_err());
    }
}
