//! Connection driver shared by every transport
//!
//! A transport hands over a stream of decoded frames and a sink accepting
//! frames. The session performs the handshake, registers the channel, then runs
//! two independent tasks: the read loop in the caller's task and the write loop
//! in a spawned one. The write loop is the only writer of the sink.

use bytes::Bytes;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::channel::{Channel, ChannelState, CloseReason};
use crate::core::server::SharedGateway;
use crate::error::{CometError, Result};
use crate::protocol::{Frame, Operation};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one client connection from handshake to close
pub async fn run_session<S, K>(gateway: SharedGateway, source: S, sink: K, peer: SocketAddr)
where
    S: Stream<Item = Result<Frame>> + Send,
    K: Sink<Frame, Error = CometError> + Send + 'static,
{
    futures_util::pin_mut!(source);

    let channel = match handshake(&gateway, &mut source, peer).await {
        Ok(channel) => channel,
        Err(e) => {
            info!("Handshake from {} failed ({}): {}", peer, handshake_close_reason(&e), e);
            return;
        }
    };

    let writer = tokio::spawn(write_loop(Arc::clone(&channel), sink));
    let reason = read_loop(&gateway, &channel, &mut source).await;
    channel.close(reason);

    if let Err(e) = writer.await {
        error!("Write loop for {} panicked: {}", channel.key(), e);
    }

    let reason = channel.close_reason().unwrap_or(reason);
    if let Err(e) = gateway.upstream().on_disconnect(&channel, reason).await {
        warn!("Upstream disconnect for {} failed: {}", channel.key(), e);
    }
}

/// Read the Handshake frame, authenticate it and register the resulting channel
async fn handshake<S>(gateway: &SharedGateway, source: &mut S, peer: SocketAddr) -> Result<Arc<Channel>>
where
    S: Stream<Item = Result<Frame>> + Unpin,
{
    let first = timeout(gateway.config().handshake_timeout, source.next())
        .await
        .map_err(|_| CometError::HandshakeTimeout)?;
    let frame = match first {
        Some(frame) => frame?,
        None => return Err(CometError::Connection("closed before handshake".to_string())),
    };
    if frame.op != Operation::Handshake {
        return Err(CometError::Protocol(format!(
            "expected handshake, got {:?}",
            frame.op
        )));
    }

    let grant = gateway.auth().authenticate(&frame.body).await?;
    let key = grant
        .key
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let channel = Arc::new(Channel::new(
        key.clone(),
        grant.user_id.clone(),
        peer,
        gateway.channel_settings(&grant),
    ));
    channel.touch();

    // Queued before registration so no push can overtake the ack
    channel.enqueue(Frame::new(
        Operation::HandshakeAck,
        frame.seq,
        Bytes::from(key.clone()),
    ))?;

    let registry = gateway.registry();
    let bucket = registry.register(Arc::clone(&channel), grant.room.as_deref())?;
    channel.activate();
    if registry.is_draining() {
        channel.begin_drain();
    }

    info!(
        "Handshake accepted: key={} user={} peer={} bucket={} room={:?}",
        key,
        grant.user_id,
        peer,
        bucket,
        grant.room
    );
    Ok(channel)
}

fn handshake_close_reason(err: &CometError) -> CloseReason {
    match err {
        CometError::HandshakeTimeout => CloseReason::HandshakeTimeout,
        CometError::Auth(_) => CloseReason::AuthRejected,
        CometError::Draining => CloseReason::Shutdown,
        CometError::Frame(_) | CometError::Protocol(_) => CloseReason::FrameError,
        _ => CloseReason::PeerClosed,
    }
}

async fn read_loop<S>(gateway: &SharedGateway, channel: &Arc<Channel>, source: &mut S) -> CloseReason
where
    S: Stream<Item = Result<Frame>> + Unpin,
{
    let window = channel.heartbeat_window();
    let verbose = gateway.is_whitelisted(channel.user_id());

    loop {
        let next = tokio::select! {
            _ = channel.closed() => {
                return channel.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            next = timeout(window, source.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!("Channel {} missed its {:?} heartbeat window", channel.key(), window);
                return CloseReason::HeartbeatTimeout;
            }
            Ok(None) => return CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                info!("Channel {} read failed: {}", channel.key(), e);
                return match e {
                    CometError::Frame(_) | CometError::Protocol(_) => CloseReason::FrameError,
                    _ => CloseReason::PeerClosed,
                };
            }
            Ok(Some(Ok(frame))) => frame,
        };

        channel.touch();
        if verbose {
            info!(
                "whitelist key={} user={} op={:?} seq={} body={:?}",
                channel.key(),
                channel.user_id(),
                frame.op,
                frame.seq,
                frame.body
            );
        }

        if let Some(reason) = handle_frame(gateway, channel, frame).await {
            return reason;
        }
    }
}

/// Interpret one inbound frame. Returns a reason when the connection must end.
async fn handle_frame(gateway: &SharedGateway, channel: &Arc<Channel>, frame: Frame) -> Option<CloseReason> {
    match frame.op {
        Operation::Heartbeat => {
            let ack = Frame::empty(Operation::HeartbeatAck, frame.seq);
            if let Some(reason) = reply(channel, ack) {
                return Some(reason);
            }
            if let Err(e) = gateway.upstream().on_heartbeat(channel).await {
                warn!("Upstream heartbeat for {} failed: {}", channel.key(), e);
            }
            None
        }
        Operation::RoomJoin | Operation::RoomLeave => {
            let room = match frame.body_str().map(str::trim).filter(|r| !r.is_empty()) {
                Some(room) => room.to_string(),
                None => {
                    info!("Channel {} sent a room operation without a room id", channel.key());
                    return Some(CloseReason::FrameError);
                }
            };

            let registry = gateway.registry();
            let (result, ack_op) = if frame.op == Operation::RoomJoin {
                (registry.join(channel, &room), Operation::RoomJoinAck)
            } else {
                (registry.leave(channel, &room), Operation::RoomLeaveAck)
            };
            match result {
                Ok(changed) => debug!(
                    "Channel {} {:?} {} (changed: {})",
                    channel.key(),
                    frame.op,
                    room,
                    changed
                ),
                Err(e) => {
                    warn!("Room update for {} failed: {}", channel.key(), e);
                    return Some(channel.close_reason().unwrap_or(CloseReason::Replaced));
                }
            }
            reply(channel, Frame::new(ack_op, frame.seq, Bytes::from(room)))
        }
        Operation::Close => Some(CloseReason::ClientClose),
        Operation::Handshake => {
            info!("Channel {} sent a second handshake", channel.key());
            Some(CloseReason::FrameError)
        }
        _ => {
            if let Err(e) = gateway.upstream().on_receive(channel, &frame).await {
                warn!("Upstream receive for {} failed: {}", channel.key(), e);
            }
            None
        }
    }
}

fn reply(channel: &Channel, frame: Frame) -> Option<CloseReason> {
    match channel.enqueue(frame) {
        Ok(_) => None,
        Err(_) => Some(channel.close_reason().unwrap_or(CloseReason::Shutdown)),
    }
}

/// Flush the outbound queue to the socket in FIFO order until the channel closes
async fn write_loop<K>(channel: Arc<Channel>, sink: K)
where
    K: Sink<Frame, Error = CometError> + Send,
{
    let mut sink = Box::pin(sink);

    loop {
        let batch = match channel.take_batch() {
            Ok(batch) => batch,
            Err(e) => {
                error!("Outbound queue for {} unusable: {}", channel.key(), e);
                channel.close(CloseReason::WriteFailed);
                break;
            }
        };

        if !batch.is_empty() {
            let written = tokio::select! {
                res = send_batch(&mut sink, batch) => res,
                _ = channel.closed() => break,
            };
            if let Err(e) = written {
                debug!("Write to {} failed: {}", channel.key(), e);
                channel.close(CloseReason::WriteFailed);
                break;
            }
            continue;
        }

        match channel.state() {
            ChannelState::Closed => break,
            ChannelState::Draining => {
                channel.close(CloseReason::Shutdown);
                break;
            }
            ChannelState::Handshaking | ChannelState::Active => {}
        }

        tokio::select! {
            _ = channel.writer_notified() => {}
            _ = channel.closed() => {}
        }
    }

    if timeout(SINK_CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("Closing sink for {} timed out", channel.key());
    }
}

async fn send_batch<K>(sink: &mut Pin<Box<K>>, batch: Vec<Frame>) -> Result<()>
where
    K: Sink<Frame, Error = CometError>,
{
    for frame in batch {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameError;

    #[test]
    fn test_handshake_failures_map_to_close_reasons() {
        assert_eq!(
            handshake_close_reason(&CometError::HandshakeTimeout),
            CloseReason::HandshakeTimeout
        );
        assert_eq!(
            handshake_close_reason(&CometError::Auth("expired".into())),
            CloseReason::AuthRejected
        );
        assert_eq!(
            handshake_close_reason(&FrameError::UnknownOperation(77).into()),
            CloseReason::FrameError
        );
        assert_eq!(
            handshake_close_reason(&CometError::Connection("reset".into())),
            CloseReason::PeerClosed
        );
    }
}
