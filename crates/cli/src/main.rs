//! confsync: keep a local config directory in sync with a config server
//!
//! - `pull` fetches a product subtree once
//! - `push` scans the directory on an interval and sends every change
//! - `scan` shows what the tracker sees

mod logging;
mod status;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use confsync::SyncClient;
use confsync_core::archive::{Compression, unix_seconds};
use confsync_core::config::{CLIENT_CONFIG_FILE, ClientConfig, ScanInterval};
use confsync_core::path::join_relative;
use confsync_core::tracker;
use confsync_transport::TcpTransport;

use crate::status::Progress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "confsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Keep a local config directory in sync with a config server")]
#[command(long_about = r#"
confsync mirrors one local directory into one product subtree on a config
server. Changes are detected by modification time and shipped as a single
archive plus a list of deleted paths.

Examples:
  confsync pull --root ./config --product am     Fetch the am subtree once
  confsync push --root ./config --interval 5     Push changes every 5 seconds
  confsync scan --root ./config --format json    Show tracked files
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = CLIENT_CONFIG_FILE)]
    config: PathBuf,

    /// Local directory to sync
    #[arg(long, global = true, env = "CONFIG_DIR")]
    root: Option<PathBuf>,

    /// Product id on the server
    #[arg(long, global = true, env = "CONFIG_PRODUCT")]
    product: Option<String>,

    /// Server address (host:port)
    #[arg(long, global = true, env = "CONFIG_SERVER")]
    server: Option<String>,

    /// Compress pushed archives (on, off)
    #[arg(long, global = true)]
    compression: Option<Compression>,

    /// Also write a detailed session log into this directory
    #[arg(long, global = true, env = "CONFSYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the product subtree once and exit
    Pull,

    /// Push local changes until interrupted
    Push {
        /// Seconds between scans (1-120)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Scan the local directory and print tracked files
    Scan {
        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Show version and build info
    Version,
}

impl Cli {
    /// Load the config file, then apply command-line overrides
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load(&self.config)?;
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        if let Some(product) = &self.product {
            config.product.clone_from(product);
        }
        if let Some(server) = &self.server {
            config.server.clone_from(server);
        }
        if let Some(compression) = self.compression {
            config.compression = compression;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let session = logging::init(cli.verbose, cli.log_dir.as_deref())?;
    if let Some(session) = &session {
        info!("Session log: {}", session.path.display());
    }

    match &cli.command {
        Commands::Version => {
            eprintln!("confsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan { format } => {
            scan_command(&cli.client_config()?, format)?;
        }
        Commands::Pull => {
            pull_command(&cli.client_config()?).await?;
        }
        Commands::Push { interval } => {
            let mut config = cli.client_config()?;
            if let Some(secs) = interval {
                config.interval = ScanInterval::new(*secs)?;
            }
            push_command(&config).await?;
        }
    }

    Ok(())
}

fn transport(config: &ClientConfig) -> TcpTransport {
    TcpTransport::new(&config.server)
        .with_connect_timeout(config.connect_timeout())
        .with_fetch_timeout(config.fetch_timeout())
        .with_apply_timeout(config.apply_timeout())
}

/// One tracked file, as printed by `scan --format json`
#[derive(Serialize)]
struct ScannedFile {
    path: String,
    size: u64,
    modified: u64,
}

fn scan_command(config: &ClientConfig, format: &str) -> Result<()> {
    let progress = Progress::new();
    info!("Scanning {}...", config.root.display());

    let excludes = tracker::exclude_matcher(&config.root, &config.exclude)?;
    let state = tracker::snapshot(&config.root, excludes.as_ref())?;

    let mut files = Vec::with_capacity(state.len());
    for (path, modified) in state.iter() {
        let size = match std::fs::metadata(join_relative(&config.root, path)?) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                debug!("{path} vanished during scan: {e}");
                continue;
            }
        };
        files.push(ScannedFile {
            path: path.to_string(),
            size,
            modified: unix_seconds(modified),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&files)?;
            println!("{json}");
        }
        _ => {
            let total_size: u64 = files.iter().map(|f| f.size).sum();
            if files.len() <= 20 {
                for file in &files {
                    eprintln!("  {} ({} bytes)", file.path, file.size);
                }
            }
            progress.scanned(files.len(), total_size);
        }
    }

    Ok(())
}

async fn pull_command(config: &ClientConfig) -> Result<()> {
    let progress = Progress::new();
    let client = SyncClient::new(transport(config), config)?;

    let spinner = progress.pull_spinner(&config.product, &config.server);
    let pulled = client.pull_once().await;
    drop(spinner);

    progress.pulled(&pulled?);
    Ok(())
}

async fn push_command(config: &ClientConfig) -> Result<()> {
    let progress = Progress::new();
    let mut client = SyncClient::new(transport(config), config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for interrupts: {e}");
                return;
            }
            info!("Interrupted, finishing current cycle...");
            cancel.cancel();
        }
    });

    progress.watching(
        &config.root,
        &config.product,
        &config.server,
        config.interval.secs(),
    );
    client.push_loop(cancel).await?;
    progress.stopped();
    Ok(())
}
