//! DRP daemon binary
//!
//! Loads configuration, starts a node and optionally joins the overlay
//! through an entry peer.

use clap::Parser;
use drp::{Config, EngineEvent, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// DRP overlay peer
#[derive(Parser, Debug)]
#[command(name = "drp", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Entry peer to register through on startup
    #[arg(short, long, value_name = "ADDR")]
    register: Option<SocketAddr>,

    /// Minimum distance requested from the new neighbor
    #[arg(long, default_value_t = 0)]
    min_distance: u32,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("DRP starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if config.has_identity() {
        info!("Using configured identity");
    } else {
        warn!("No identity configured, generating ephemeral keypair");
    }

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            std::process::exit(1);
        }
    };
    info!("  id: {}", node.id());

    let handle = match node.start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(entry) = args.register {
        match handle.register(entry, args.min_distance).await {
            Ok(request_id) => info!(entry = %entry, request = %request_id, "Registration started"),
            Err(e) => error!(entry = %entry, error = %e, "Registration could not start"),
        }
    }

    info!(local_addr = %handle.local_addr(), "DRP running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Err(e) = node.stop().await {
        warn!("Error during shutdown: {}", e);
    }

    info!("DRP shutdown complete");
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RegistrationCompleted { request_id, remote, .. } => {
            info!(request = %request_id, remote = %remote, "Registered");
        }
        EngineEvent::RegistrationFailed { request_id, error } => {
            warn!(request = %request_id, error = %error, "Registration failed");
        }
        EngineEvent::InviteReceived { request_id, from, hops, .. } => {
            info!(request = %request_id, from = %from, hops, "Invite received");
        }
        EngineEvent::InviteCompleted { request_id, hops, .. } => {
            info!(request = %request_id, hops, "Invite answered");
        }
        EngineEvent::InviteFailed { request_id, error } => {
            warn!(request = %request_id, error = %error, "Invite failed");
        }
        EngineEvent::NeighborEstablished { .. } | EngineEvent::NeighborDisposed { .. } => {}
    }
}
