//! ridelink node entry point.
//!
//! ```text
//! ridelink-node                        Run the role from ridelink-node.toml
//! ridelink-node --role display         Override the configured role
//! ridelink-node --target <addr>        Stream target (source) or listen address (display)
//! ridelink-node --config <path>        Load a custom config TOML
//! ridelink-node --gen-config           Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ridelink_node::config::{NodeConfig, Role};
use ridelink_node::console;
use ridelink_node::service::{DisplayService, SourceService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ridelink-node", about = "ridelink source/display host process")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ridelink-node.toml")]
    config: PathBuf,

    /// Role to run, overriding the config file.
    #[arg(short, long, value_enum)]
    role: Option<Role>,

    /// Stream target (source) or listen address (display).
    #[arg(short, long)]
    target: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = NodeConfig::load(&cli.config);
    if let Some(role) = cli.role {
        config.role = role;
    }
    if let Some(target) = cli.target {
        config.apply_target(target);
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ridelink-node v{}", env!("CARGO_PKG_VERSION"));
    info!("role: {}", config.role);

    let cancel = CancellationToken::new();

    // Ctrl-C handler.
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    let lines = console::spawn_stdin();
    match config.role {
        Role::Source => {
            info!("stream target: {}", config.network.stream_target);
            info!("preferences: {}", config.preferences.path.display());
            SourceService::new(&config)?.run(lines, cancel).await?;
        }
        Role::Display => {
            info!("listen address: {}", config.network.listen_address);
            DisplayService::new(&config)?.run(lines, cancel).await?;
        }
    }

    Ok(())
}
