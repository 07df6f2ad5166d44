//! WebSocket listener
//!
//! Each binary message carries exactly one protocol frame. Text messages are a
//! protocol violation; ping and pong are handled by the WebSocket layer.

use futures_util::future;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::core::server::SharedGateway;
use crate::core::session::run_session;
use crate::error::{CometError, Result};
use crate::protocol::{decode, Frame};

const UNKNOWN_PEER: ([u8; 4], u16) = ([0, 0, 0, 0], 0);

/// `GET /<ws_path>` upgrade route
pub fn ws_route(
    gateway: SharedGateway,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let path = gateway.config().ws_path.clone();
    warp::path(path)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(with_gateway(gateway))
        .map(|ws: Ws, remote: Option<SocketAddr>, gateway: SharedGateway| {
            let peer = remote.unwrap_or_else(|| SocketAddr::from(UNKNOWN_PEER));
            debug!("WebSocket upgrade requested by {}", peer);
            let max_frame_size = gateway.config().max_frame_size;
            ws.max_message_size(max_frame_size)
                .on_upgrade(move |socket| handle_ws_client(socket, peer, gateway))
        })
}

/// Bind the plain WebSocket listener and serve it until `shutdown` is cancelled
pub fn serve(
    gateway: SharedGateway,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let path = gateway.config().ws_path.clone();
    let (bound, server) = warp::serve(ws_route(gateway))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .map_err(|e| CometError::Connection(format!("failed to bind WebSocket {}: {}", addr, e)))?;
    info!("WebSocket listener bound on {}/{}", bound, path);
    Ok((bound, tokio::spawn(server)))
}

/// Bind the secure WebSocket listener. Unreadable certificate or key files fail the bind.
pub fn serve_tls(
    gateway: SharedGateway,
    addr: SocketAddr,
    cert_path: &str,
    key_path: &str,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let path = gateway.config().ws_path.clone();
    let (bound, server) = warp::serve(ws_route(gateway))
        .tls()
        .cert_path(cert_path)
        .key_path(key_path)
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .map_err(|e| {
            CometError::Connection(format!("failed to bind secure WebSocket {}: {}", addr, e))
        })?;
    info!("Secure WebSocket listener bound on {}/{}", bound, path);
    Ok((bound, tokio::spawn(server)))
}

// Helper function to include the gateway in a route
fn with_gateway(
    gateway: SharedGateway,
) -> impl Filter<Extract = (SharedGateway,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

// Handle a WebSocket connection
pub async fn handle_ws_client(ws: WebSocket, peer: SocketAddr, gateway: SharedGateway) {
    let max_frame_size = gateway.config().max_frame_size;
    let (ws_tx, ws_rx) = ws.split();

    let source = ws_rx.filter_map(move |message| {
        future::ready(match message {
            Ok(msg) if msg.is_binary() => {
                Some(decode(msg.as_bytes(), max_frame_size).map_err(CometError::from))
            }
            Ok(msg) if msg.is_text() => Some(Err(CometError::Protocol(
                "text messages are not accepted".to_string(),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(CometError::Connection(e.to_string()))),
        })
    });

    let sink = ws_tx
        .sink_map_err(|e| CometError::Connection(e.to_string()))
        .with(|frame: Frame| {
            future::ready(Ok::<_, CometError>(Message::binary(frame.to_bytes().to_vec())))
        });

    run_session(gateway, source, sink, peer).await;
}
