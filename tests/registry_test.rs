use std::sync::Arc;
use std::time::Duration;

use rusty_comet::core::{
    shard_index, Channel, ChannelSettings, CloseReason, OverflowPolicy, Registry,
};
use rusty_comet::error::CometError;
use rusty_comet::protocol::{Frame, FrameError, Operation, HEADER_SIZE};

fn settings() -> ChannelSettings {
    ChannelSettings {
        queue_capacity: 16,
        overflow: OverflowPolicy {
            threshold: 8,
            window: Duration::from_secs(10),
        },
        heartbeat_window: Duration::from_secs(30),
    }
}

fn channel(key: &str, peer: &str) -> Arc<Channel> {
    let channel = Arc::new(Channel::new(
        key.to_string(),
        format!("user-{}", key),
        peer.parse().unwrap(),
        settings(),
    ));
    channel.activate();
    channel
}

fn push(body: &'static [u8]) -> Frame {
    Frame::new(Operation::Push, 0, body)
}

#[tokio::test]
async fn test_assign_is_deterministic() {
    let registry = Registry::new(32);
    for i in 0..200 {
        let key = format!("conn-{}", i);
        assert_eq!(registry.assign(&key), registry.assign(&key));
        assert_eq!(registry.assign(&key), shard_index(&key, 32));
    }
}

#[tokio::test]
async fn test_room_isolation_across_buckets() {
    let registry = Registry::new(16);
    let mut members = Vec::new();
    let mut others = Vec::new();
    for i in 0..40 {
        let member = channel(&format!("m{}", i), "10.0.0.1:1000");
        registry.register(member.clone(), Some("r1")).unwrap();
        members.push(member);

        let other = channel(&format!("o{}", i), "10.0.0.2:1000");
        registry.register(other.clone(), Some("r2")).unwrap();
        others.push(other);
    }

    let report = registry.push_to_room("r1", push(b"only-r1")).await.unwrap();
    assert_eq!(report.attempted, 40);
    assert_eq!(report.failed, 0);
    assert!(members.iter().all(|c| c.queued_len() == 1));
    assert!(others.iter().all(|c| c.queued_len() == 0));

    let report = registry.push_to_all(push(b"everyone")).await.unwrap();
    assert_eq!(report.attempted, 80);
}

#[tokio::test]
async fn test_empty_room_is_removed() {
    let registry = Registry::new(8);
    let a = channel("a", "10.0.0.1:1000");
    let b = channel("b", "10.0.0.1:1001");
    registry.register(a.clone(), Some("lobby")).unwrap();
    registry.register(b.clone(), None).unwrap();
    registry.join(&b, "lobby").unwrap();
    assert_eq!(registry.room_counts().unwrap().get("lobby"), Some(&2));

    registry.leave(&b, "lobby").unwrap();
    a.close(CloseReason::PeerClosed);
    assert!(registry.room_counts().unwrap().is_empty());

    let report = registry.push_to_room("lobby", push(b"x")).await.unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn test_reconnect_race_keeps_one_channel() {
    let registry = Registry::new(8);
    let first = channel("c1", "10.0.0.1:1000");
    let second = channel("c1", "10.0.0.1:1001");
    registry.register(first.clone(), Some("r")).unwrap();
    registry.register(second.clone(), Some("r")).unwrap();

    assert_eq!(first.close_reason(), Some(CloseReason::Replaced));
    assert!(!second.is_closed());
    assert_eq!(registry.connection_count().unwrap(), 1);
    let current = registry.channel("c1").unwrap().unwrap();
    assert!(Arc::ptr_eq(&current, &second));

    // A late room change from the stale session must not move the new channel
    assert!(matches!(
        registry.join(&first, "elsewhere"),
        Err(CometError::ChannelClosed(_))
    ));
    assert_eq!(second.room().as_deref(), Some("r"));

    // A late close of the stale channel must not evict the new one
    first.close(CloseReason::PeerClosed);
    assert!(registry.channel("c1").unwrap().is_some());
    assert_eq!(registry.room_members("r").unwrap(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn test_push_to_unknown_connection() {
    let registry = Registry::new(4);
    let err = registry.push_to_connection("ghost", push(b"x")).unwrap_err();
    assert!(matches!(err, CometError::NotFound(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_backpressure_never_blocks_and_keeps_connection() {
    let registry = Registry::new(4);
    let c = channel("c1", "10.0.0.1:1000");
    registry.register(c.clone(), None).unwrap();

    for _ in 0..16 {
        registry.push_to_connection("c1", push(b"fill")).unwrap();
    }
    let report = registry.push_to_connection("c1", push(b"over")).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(c.queued_len(), 16);
    assert!(!c.is_closed());
}

#[tokio::test]
async fn test_slow_consumer_is_evicted() {
    let registry = Registry::new(4);
    let c = channel("c1", "10.0.0.1:1000");
    registry.register(c.clone(), None).unwrap();

    for _ in 0..(16 + 9) {
        let _ = registry.push_to_connection("c1", push(b"flood"));
    }
    assert_eq!(c.close_reason(), Some(CloseReason::SlowConsumer));
    assert_eq!(registry.connection_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sweep_closes_expired_channels() {
    let registry = Registry::new(4);
    let idle = channel("idle", "10.0.0.1:1000");
    let busy = channel("busy", "10.0.0.2:1000");
    registry.register(idle.clone(), None).unwrap();
    registry.register(busy.clone(), None).unwrap();

    tokio::time::advance(Duration::from_secs(20)).await;
    busy.touch();
    tokio::time::advance(Duration::from_secs(15)).await;

    assert_eq!(registry.sweep_idle().unwrap(), 1);
    assert_eq!(idle.close_reason(), Some(CloseReason::HeartbeatTimeout));
    assert!(!busy.is_closed());
    assert_eq!(registry.connection_count().unwrap(), 1);
}

#[tokio::test]
async fn test_aggregate_stats_counts_distinct_peers() {
    let registry = Registry::new(8);
    registry.register(channel("a", "10.0.0.1:1000"), Some("r")).unwrap();
    registry.register(channel("b", "10.0.0.1:1001"), None).unwrap();
    registry.register(channel("c", "10.0.0.2:1000"), None).unwrap();

    let stats = registry.aggregate_stats().unwrap();
    assert_eq!(stats.buckets, 8);
    assert_eq!(stats.connections, 3);
    assert_eq!(stats.distinct_peers, 2);
    assert_eq!(stats.rooms, 1);
    assert!(!stats.draining);

    registry.begin_drain();
    assert!(matches!(
        registry.register(channel("d", "10.0.0.3:1000"), None),
        Err(CometError::Draining)
    ));
}

#[tokio::test]
async fn test_oversized_push_rejected_before_fan_out() {
    let registry = Registry::new(4).with_max_frame_size(HEADER_SIZE + 64);
    let a = channel("a", "10.0.0.1:1000");
    let b = channel("b", "10.0.0.1:1001");
    registry.register(a.clone(), Some("r")).unwrap();
    registry.register(b.clone(), Some("r")).unwrap();

    let big = Frame::new(Operation::Push, 0, vec![1u8; 65]);
    let err = registry.push_to_all(big.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        CometError::Frame(FrameError::Oversized { declared, max })
            if declared == HEADER_SIZE + 65 && max == HEADER_SIZE + 64
    ));
    assert!(registry.push_to_room("r", big.clone()).await.is_err());
    assert!(registry.push_to_connection("a", big.clone()).is_err());
    assert!(registry.push_to_keys(&["a".to_string()], big).is_err());
    assert_eq!(a.queued_len(), 0);
    assert_eq!(b.queued_len(), 0);

    // Exactly at the limit is fine
    let fits = Frame::new(Operation::Push, 0, vec![1u8; 64]);
    let report = registry.push_to_all(fits).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.failed, 0);
}
