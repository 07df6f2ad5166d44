//! Raw TCP listener

use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::core::server::SharedGateway;
use crate::core::session::run_session;
use crate::error::{CometError, Result};
use crate::protocol::FrameCodec;

/// Bind the TCP listener. Failing to bind is fatal for the caller.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CometError::Connection(format!("failed to bind TCP {}: {}", addr, e)))?;
    info!("TCP listener bound on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, gateway: SharedGateway, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("TCP connection accepted from {}", peer);
                tokio::spawn(handle_tcp_client(stream, peer, gateway.clone()));
            }
            Err(e) => error!("TCP accept failed: {}", e),
        }
    }
    info!("TCP listener stopped accepting");
}

// Handle one TCP client
pub async fn handle_tcp_client(stream: TcpStream, peer: SocketAddr, gateway: SharedGateway) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }
    let max_frame_size = gateway.config().max_frame_size;
    let (reader, writer) = stream.into_split();
    let source = FramedRead::new(reader, FrameCodec::new(max_frame_size));
    let sink = FramedWrite::new(writer, FrameCodec::new(max_frame_size));
    run_session(gateway, source, sink, peer).await;
}
