use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::Filter;

use rusty_comet::config::ServerConfig;
use rusty_comet::core::{Gateway, SharedGateway};
use rusty_comet::discovery::{LoggingDiscovery, Registration};
use rusty_comet::dispatcher::Dispatcher;
use rusty_comet::handlers::{rpc_routes, tcp, websocket};
use rusty_comet::shutdown::{wait_for_signal, ShutdownCoordinator, SignalAction};

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("No .env file loaded: {}", e),
    }

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting {} (tcp={}, ws={}, rpc={}, buckets={})",
        config.server_id, config.tcp_bind, config.ws_bind, config.rpc_bind, config.bucket_count
    );

    let gateway: SharedGateway = match Gateway::from_config(config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("Failed to build gateway: {}", e);
            std::process::exit(1);
        }
    };
    let config = gateway.config().clone();
    let listeners = CancellationToken::new();

    // TCP listener
    let tcp_listener = match tcp::bind(&config.tcp_bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    tokio::spawn(tcp::serve(tcp_listener, gateway.clone(), listeners.clone()));

    // WebSocket listener
    let ws_addr = parse_addr(&config.ws_bind);
    if let Err(e) = websocket::serve(gateway.clone(), ws_addr, listeners.clone()) {
        error!("{}", e);
        std::process::exit(1);
    }

    // Secure WebSocket listener
    if let Some(wss_bind) = &config.wss_bind {
        let (cert, key) = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                error!("WSS listener requires both a certificate and a key path");
                std::process::exit(1);
            }
        };
        let wss_addr = parse_addr(wss_bind);
        let served = websocket::serve_tls(gateway.clone(), wss_addr, cert, key, listeners.clone());
        if let Err(e) = served {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    // RPC listener; kept up through the drain so callers see 503 instead of a refused connection
    let dispatcher = Dispatcher::new(gateway.registry().clone());
    let rpc_addr = parse_addr(&config.rpc_bind);
    let rpc_shutdown = CancellationToken::new();
    let rpc_stop = rpc_shutdown.clone();
    let rpc = rpc_routes(dispatcher).with(warp::log("rusty_comet::rpc"));
    let rpc_server = match warp::serve(rpc)
        .try_bind_with_graceful_shutdown(rpc_addr, async move { rpc_stop.cancelled().await })
    {
        Ok((addr, server)) => {
            info!("RPC listener bound on {}", addr);
            tokio::spawn(server)
        }
        Err(e) => {
            error!("Failed to bind RPC listener on {}: {}", rpc_addr, e);
            std::process::exit(1);
        }
    };

    let sweeper = gateway.clone().start_idle_sweeper(listeners.clone());

    let registration = match Registration::start(
        Arc::new(LoggingDiscovery),
        gateway.registry().clone(),
        &config,
    )
    .await
    {
        Ok(registration) => Some(Arc::new(registration)),
        Err(e) => {
            warn!("Discovery registration failed, continuing without it: {}", e);
            None
        }
    };

    loop {
        match wait_for_signal().await {
            Ok(SignalAction::Reload) => info!("Reload requested; nothing to reload"),
            Ok(SignalAction::Drain) => break,
            Err(e) => {
                error!("Failed to listen for signals: {}", e);
                break;
            }
        }
    }

    let mut coordinator =
        ShutdownCoordinator::new(gateway.registry().clone(), listeners, config.drain_grace);
    if let Some(registration) = registration {
        coordinator = coordinator.with_registration(registration);
    }
    match coordinator.drain().await {
        Ok(report) => info!(
            "Drained {} connections, force-closed {} in {:?}",
            report.drained, report.forced, report.elapsed
        ),
        Err(e) => error!("Drain failed: {}", e),
    }

    if let Err(e) = sweeper.await {
        warn!("Idle sweeper task ended abnormally: {}", e);
    }
    rpc_shutdown.cancel();
    if let Err(e) = rpc_server.await {
        warn!("RPC server task ended abnormally: {}", e);
    }
    info!("{} stopped", config.server_id);
}

fn parse_addr(addr: &str) -> SocketAddr {
    match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse address {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}
