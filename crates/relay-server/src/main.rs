mod codec;
mod config;
mod server;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_forwarding::Forwarder;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::server::ServeOptions;
use crate::transport::TcpTransportFactory;

#[derive(Parser)]
#[command(name = "relay-forwarder", about = "forwards cache messages to replica nodes")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "RELAY_HOST")]
    host: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// maximum number of concurrent client connections
    #[arg(long, env = "RELAY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// largest accepted frame, in KiB
    #[arg(long, env = "RELAY_MAX_FRAME_KB")]
    max_frame_kb: Option<usize>,

    /// milliseconds a node gets to answer one request
    #[arg(long, env = "RELAY_NODE_TIMEOUT_MS")]
    node_timeout_ms: Option<u64>,

    /// file the error queues are saved to on shutdown and restored from
    /// on startup
    #[arg(long, env = "RELAY_RUN_STATE")]
    run_state: Option<PathBuf>,

    /// root folder for spilled error queues. enables persistence
    #[arg(long, env = "RELAY_PERSISTENCE_FOLDER")]
    persistence_folder: Option<PathBuf>,
}

/// Applies CLI overrides. Only `Some` values take effect.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(n) = args.max_connections {
        cfg.max_connections = n;
    }
    if let Some(kb) = args.max_frame_kb {
        cfg.max_frame_kb = kb;
    }
    if let Some(ms) = args.node_timeout_ms {
        cfg.node_timeout_ms = ms;
    }
    if let Some(ref path) = args.run_state {
        cfg.run_state_path = path.to_string_lossy().into_owned();
    }
    if let Some(ref dir) = args.persistence_folder {
        cfg.forwarding.queue.persistence_folder = Some(dir.clone());
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.port)
        .parse()
        .unwrap_or_else(|e| exit_err(format!("invalid bind address '{}:{}': {e}", cfg.bind, cfg.port)));
    let max_frame = cfg
        .max_frame_bytes()
        .unwrap_or_else(|e| exit_err(format!("invalid max_frame_kb: {e}")));
    if cfg.max_connections == 0 {
        exit_err("max_connections must be at least 1");
    }
    if let Err(e) = cfg.topology.validate() {
        exit_err(e);
    }

    let run_state_path = cfg.run_state_path();
    let run_state = match &run_state_path {
        Some(path) => server::load_run_state(path).unwrap_or_else(|e| {
            exit_err(format!("failed to read run state '{}': {e}", path.display()))
        }),
        None => None,
    };

    let factory = TcpTransportFactory {
        timeout: cfg.node_timeout(),
        max_frame,
    };
    let forwarder = Forwarder::new(
        &cfg.topology,
        cfg.forwarding.clone(),
        Arc::new(factory),
        run_state.as_deref(),
    )
    .unwrap_or_else(|e| exit_err(format!("failed to start forwarder: {e}")));
    let forwarder = Arc::new(forwarder);

    if run_state.is_some() {
        info!(queued = forwarder.queue_depth(), "run state restored");
    }

    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind {addr}: {e}")));
    forwarder.spawn_maintenance();

    let options = ServeOptions {
        max_connections: cfg.max_connections,
        max_frame,
        run_state: run_state_path,
    };
    if let Err(e) = server::serve(listener, forwarder, options, stop_signal()).await {
        exit_err(format!("failed to save run state: {e}"));
    }
    info!("relay stopped");
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
}
