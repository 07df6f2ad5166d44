#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use rusty_comet::auth::{AuthGrant, AuthProvider};
use rusty_comet::config::ServerConfig;
use rusty_comet::core::{run_session, Channel, CloseReason, Gateway, SharedGateway};
use rusty_comet::error::{CometError, Result};
use rusty_comet::protocol::{Frame, FrameCodec, Operation};
use rusty_comet::upstream::UpstreamEvents;

pub type Client = Framed<DuplexStream, FrameCodec>;

/// Uses the handshake token as the connection key; "room:key" also joins a room
pub struct KeyedAuth;

#[async_trait]
impl AuthProvider for KeyedAuth {
    async fn authenticate(&self, token: &[u8]) -> Result<AuthGrant> {
        let token = std::str::from_utf8(token)
            .map_err(|_| CometError::Auth("bad token".to_string()))?;
        if token.is_empty() {
            return Err(CometError::Auth("empty token".to_string()));
        }
        let mut grant = AuthGrant::for_user(format!("user-{}", token));
        match token.split_once(':') {
            Some((room, key)) => {
                grant.room = Some(room.to_string());
                grant.key = Some(key.to_string());
            }
            None => grant.key = Some(token.to_string()),
        }
        Ok(grant)
    }

    fn provider_name(&self) -> &'static str {
        "keyed"
    }
}

#[derive(Default)]
pub struct RecordingUpstream {
    pub heartbeats: Mutex<Vec<String>>,
    pub received: Mutex<Vec<(String, Operation)>>,
    pub disconnects: Mutex<Vec<(String, CloseReason)>>,
}

impl RecordingUpstream {
    pub fn disconnect_reason(&self, key: &str) -> Option<CloseReason> {
        self.disconnects
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, reason)| *reason)
    }

    /// Wait until the session for `key` has reported its disconnect
    pub async fn wait_for_disconnect(&self, key: &str) -> CloseReason {
        for _ in 0..500 {
            if let Some(reason) = self.disconnect_reason(key) {
                return reason;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no disconnect recorded for {}", key);
    }
}

#[async_trait]
impl UpstreamEvents for RecordingUpstream {
    async fn on_heartbeat(&self, channel: &Channel) -> Result<()> {
        self.heartbeats.lock().unwrap().push(channel.key().to_string());
        Ok(())
    }

    async fn on_receive(&self, channel: &Channel, frame: &Frame) -> Result<()> {
        self.received
            .lock()
            .unwrap()
            .push((channel.key().to_string(), frame.op));
        Ok(())
    }

    async fn on_disconnect(&self, channel: &Channel, reason: CloseReason) -> Result<()> {
        self.disconnects
            .lock()
            .unwrap()
            .push((channel.key().to_string(), reason));
        Ok(())
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        server_id: "comet-test".to_string(),
        bucket_count: 8,
        heartbeat_timeout: Duration::from_secs(30),
        handshake_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

pub fn gateway_with(config: ServerConfig) -> (SharedGateway, Arc<RecordingUpstream>) {
    let upstream = Arc::new(RecordingUpstream::default());
    let gateway = Gateway::new(config, Arc::new(KeyedAuth), upstream.clone());
    (Arc::new(gateway), upstream)
}

/// Run a session over an in-memory pipe and return the client end
pub fn connect_with_buffer(gateway: &SharedGateway, buffer: usize) -> Client {
    let max = gateway.config().max_frame_size;
    let (client, server) = tokio::io::duplex(buffer);
    let (reader, writer) = tokio::io::split(server);
    let source = FramedRead::new(reader, FrameCodec::new(max));
    let sink = FramedWrite::new(writer, FrameCodec::new(max));
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    tokio::spawn(run_session(gateway.clone(), source, sink, peer));
    Framed::new(client, FrameCodec::new(max))
}

pub fn connect(gateway: &SharedGateway) -> Client {
    connect_with_buffer(gateway, 64 * 1024)
}

pub async fn send(client: &mut Client, op: Operation, seq: u32, body: &[u8]) {
    client
        .send(Frame::new(op, seq, body.to_vec()))
        .await
        .unwrap();
}

pub async fn recv(client: &mut Client) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("decode failed")
}

/// Handshake with `token` and return the assigned key
pub async fn handshake(client: &mut Client, token: &str) -> String {
    send(client, Operation::Handshake, 1, token.as_bytes()).await;
    let ack = recv(client).await;
    assert_eq!(ack.op, Operation::HandshakeAck);
    assert_eq!(ack.seq, 1);
    ack.body_str().unwrap().to_string()
}

/// True once the server has closed its end
pub async fn is_closed(client: &mut Client) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
            Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}
