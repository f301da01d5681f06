//! confsync-server: config server for confsync clients
//!
//! Listens for Fetch and Apply requests and keeps one subtree per product
//! below its root, committing every applied change to git.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use confsync_core::config::{SERVER_CONFIG_FILE, ServerConfig};
use confsync_server::{ChangeRecorder, ConfigServer, GitRecorder, NoopRecorder};

#[derive(Parser)]
#[command(name = "confsync-server")]
#[command(about = "Config server for confsync clients")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve product subtrees until interrupted
    Serve {
        /// Directory holding every product subtree
        #[arg(short, long, env = "CONFIG_ROOT")]
        root: Option<PathBuf>,

        /// Address to listen on
        #[arg(short, long, env = "CONFIG_LISTEN")]
        listen: Option<String>,

        /// Configuration file
        #[arg(short, long, default_value = SERVER_CONFIG_FILE)]
        config: PathBuf,

        /// Do not record applied changes in git
        #[arg(long)]
        no_git: bool,

        /// Clone this repository into the root when it has none
        #[arg(long, env = "GIT_REPO")]
        git_repo: Option<String>,

        /// Branch to check out before serving
        #[arg(long, env = "GIT_BRANCH")]
        git_branch: Option<String>,

        /// Directory holding the `id_rsa` key for the git remote
        #[arg(long, env = "GIT_SSH_PATH")]
        git_ssh_path: Option<PathBuf>,
    },
    /// Print version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("confsync-server {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve {
            root,
            listen,
            config,
            no_git,
            git_repo,
            git_branch,
            git_ssh_path,
        } => {
            let mut config = ServerConfig::load(&config)?;
            if let Some(root) = root {
                config.root = root;
            }
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if no_git {
                config.git.enabled = false;
            }
            config.git.remote = git_repo.or(config.git.remote);
            config.git.branch = git_branch.or(config.git.branch);
            config.git.ssh_dir = git_ssh_path.or(config.git.ssh_dir);
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!("confsync-server starting, root: {}", config.root.display());
    tokio::fs::create_dir_all(&config.root).await?;

    let recorder: Arc<dyn ChangeRecorder> = if config.git.enabled {
        Arc::new(GitRecorder::open(&config.root, &config.git).await?)
    } else {
        warn!("git recording disabled; applied changes are not versioned");
        Arc::new(NoopRecorder)
    };

    let server = ConfigServer::from_config(&config, recorder)?;
    for product in server.products() {
        info!("product {product} -> {}", server.product_dir(product)?.display());
    }

    let listener = TcpListener::bind(&config.listen).await?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for interrupts: {e}");
                return;
            }
            info!("interrupted, shutting down");
            cancel.cancel();
        }
    });

    confsync_transport::serve(listener, Arc::new(server), cancel).await?;
    info!("confsync-server stopped");
    Ok(())
}
