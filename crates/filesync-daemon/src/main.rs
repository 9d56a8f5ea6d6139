//! filesync: mirror a folder between machines through a relay.
//!
//! `filesync relay` runs the fan-out server, `filesync client` mirrors a local
//! folder through it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use filesync_core::{LogConfig, Logger, Replica};
use filesync_daemon::{Config, FileWatcher, NativeFs, RelayDaemon, SyncSession, WebSocketServer};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "filesync")]
#[command(about = "Bidirectional folder sync through a relay")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Folder to mirror
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Warnings and connection events only
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Relay {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Mirror the folder through a relay
    Client {
        /// Relay WebSocket URL
        #[arg(short, long)]
        url: Option<String>,

        /// Origin id (generated if not provided)
        #[arg(long)]
        client_id: Option<String>,

        /// Leave the relay's folder in place on stop
        #[arg(long)]
        keep_remote: bool,

        /// Reconnect with backoff after the connection drops
        #[arg(long)]
        reconnect: bool,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env()?;

    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if args.quiet {
        config.logging = LogConfig::quiet();
    } else if args.verbose {
        config.logging = LogConfig::verbose();
    }
    match &args.command {
        Command::Relay { listen } => {
            if let Some(listen) = listen {
                config.relay.listen = listen.clone();
            }
        }
        Command::Client {
            url,
            client_id,
            keep_remote,
            reconnect,
        } => {
            if let Some(url) = url {
                config.client.relay_url = url.clone();
            }
            if client_id.is_some() {
                config.client.client_id = client_id.clone();
            }
            if *keep_remote {
                config.client.clear_on_stop = false;
            }
            if *reconnect {
                config.client.reconnect = true;
            }
        }
    }

    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_relay(config: Config, log: Logger) -> Result<()> {
    let listener = WebSocketServer::bind(&config.relay.listen).await?;
    let relay = RelayDaemon::new(config.relay_options(), log).await?;

    info!("Relay running. Press Ctrl+C to stop.");
    relay.serve(listener, shutdown_signal()).await?;
    Ok(())
}

async fn run_client(config: Config, log: Logger) -> Result<()> {
    tokio::fs::create_dir_all(&config.root).await?;

    let client_id = config.client.client_id.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated client ID: {}", id);
        id
    });

    let replica = Replica::new(
        NativeFs::new(config.root.clone()),
        config.replica_config(&client_id),
        log,
    );
    let mut session = SyncSession::new(replica, config.session_options(), log);
    let _events = session
        .events()
        .subscribe(|event| debug!("Sync event: {:?}", event));

    let mut watcher = FileWatcher::new(config.root.clone())?;
    info!("Watching {}", watcher.root().display());

    session.start_sync().await?;
    info!("Client running. Press Ctrl+C to stop.");
    session.run(watcher.event_rx(), shutdown_signal()).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let log = Logger::new(config.logging);
    info!("Root: {}", config.root.display());

    match args.command {
        Command::Relay { .. } => run_relay(config, log).await,
        Command::Client { .. } => run_client(config, log).await,
    }
}
