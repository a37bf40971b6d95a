//! tetherd - Tether mesh coordination daemon
//!
//! Tracks device endpoints, fans topology changes out to connected peers,
//! keeps the local WireGuard interface in sync, and answers rendezvous probes.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tether_server::{Daemon, ServerConfig, ServerResult};
use tether_wireguard::generate_keypair;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "Tether mesh coordination daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TETHER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/tether/tetherd.toml")]
        config: PathBuf,
    },

    /// Generate a WireGuard key pair
    Keygen,

    /// Validate a config file and exit
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/tether/tetherd.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Keygen => keygen(),
        Commands::CheckConfig { config } => check_config(&config)?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting tetherd");

    let config = ServerConfig::from_file(&config_path)?;
    info!(
        listen = %config.listen,
        subnet = %config.subnet,
        kernel = config.kernel.enabled,
        "loaded config"
    );

    let daemon = start(&config).await?;
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    daemon.shutdown().await;
    Ok(())
}

#[cfg(feature = "linux")]
async fn start(config: &ServerConfig) -> ServerResult<Daemon> {
    if config.kernel.enabled {
        let backend = tether_wireguard::LinuxKernel::new(config.kernel.interface.clone());
        Daemon::start_with_kernel(config, backend).await
    } else {
        Daemon::start(config).await
    }
}

#[cfg(not(feature = "linux"))]
async fn start(config: &ServerConfig) -> ServerResult<Daemon> {
    Daemon::start(config).await
}

fn keygen() {
    let (private, public) = generate_keypair();
    println!("private_key = \"{}\"", private.to_base64());
    println!("public_key  = \"{}\"", public.to_base64());
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = ServerConfig::from_file(path)?;
    println!("{}: ok", path.display());
    println!("  listen      {}", config.listen);
    println!("  subnet      {}", config.subnet);
    println!("  rendezvous  {}", config.rendezvous_addr());
    println!(
        "  kernel      {}",
        if config.kernel.enabled {
            config.kernel.interface.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}
