/// sshsocks - SOCKS5 proxy over an SSH tunnel
///
/// Reads a YAML config, opens an SSH session, and serves a local SOCKS5
/// proxy whose connections leave through that session. The session is
/// re-established automatically when it drops.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};

use sshsocks_common::TunnelConfig;
use sshsocks_core::{quit_channel, SshTransportFactory};
use sshsocks_daemon::{shutdown, BrowserLauncher, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    info!("Starting sshsocks v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = TunnelConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let proxy_config = Arc::new(config.proxy_config()?);
    let policy = config.reconnect_policy();

    info!("SSH server: {}", config.server_endpoint());
    info!("SOCKS5 proxy will listen on: {}", proxy_config.bind_addr);

    let config = Arc::new(config);
    let factory = Arc::new(SshTransportFactory::new(config.clone()));

    let (trigger, quit) = quit_channel();
    let signals = shutdown::install(trigger);

    let supervisor = Supervisor::new(proxy_config.clone(), factory, quit).with_policy(policy);

    if config.use_chrome {
        BrowserLauncher::new(&config.chrome_path, proxy_config.local_port())
            .launch_when_listening(supervisor.status());
    }

    let result = supervisor.run().await;
    signals.abort();
    result?;

    info!("sshsocks stopped");
    Ok(())
}
