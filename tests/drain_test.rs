mod common;

use futures_util::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::*;
use rusty_comet::core::CloseReason;
use rusty_comet::protocol::{Frame, Operation};
use rusty_comet::shutdown::ShutdownCoordinator;

/// Read until the server closes, returning the bodies of every Push received
async fn collect_pushes(mut client: Client) -> Vec<Vec<u8>> {
    let mut bodies = Vec::new();
    while let Some(Ok(frame)) = client.next().await {
        if frame.op == Operation::Push {
            bodies.push(frame.body.to_vec());
        }
    }
    bodies
}

#[tokio::test]
async fn test_graceful_drain_delivers_queued_frames() {
    let (gateway, upstream) = gateway_with(test_config());

    let mut readers = Vec::new();
    for i in 0..100 {
        let mut client = connect(&gateway);
        handshake(&mut client, &format!("c{}", i)).await;
        readers.push(tokio::spawn(collect_pushes(client)));
    }
    assert_eq!(gateway.registry().connection_count().unwrap(), 100);

    for n in 0..3u8 {
        let report = gateway
            .registry()
            .push_to_all(Frame::new(Operation::Push, 0, vec![n]))
            .await
            .unwrap();
        assert_eq!(report.attempted, 100);
    }

    let listeners = CancellationToken::new();
    let coordinator = ShutdownCoordinator::new(
        gateway.registry().clone(),
        listeners.clone(),
        Duration::from_secs(5),
    );
    let report = coordinator.drain().await.unwrap();

    assert_eq!(report.drained, 100);
    assert_eq!(report.forced, 0);
    assert!(report.elapsed < Duration::from_secs(5));
    assert!(listeners.is_cancelled());
    assert_eq!(gateway.registry().connection_count().unwrap(), 0);

    for reader in readers {
        let bodies = reader.await.unwrap();
        assert_eq!(bodies, vec![vec![0], vec![1], vec![2]]);
    }
    assert_eq!(upstream.wait_for_disconnect("c0").await, CloseReason::Shutdown);
}

#[tokio::test]
async fn test_pushes_rejected_once_draining() {
    let (gateway, _) = gateway_with(test_config());
    let mut client = connect(&gateway);
    handshake(&mut client, "c1").await;

    gateway.registry().begin_drain();
    let err = gateway
        .registry()
        .push_to_connection("c1", Frame::empty(Operation::Push, 0))
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_drain_force_closes_stuck_connections() {
    let (gateway, upstream) = gateway_with(test_config());

    // A tiny pipe that the client stops reading after the handshake
    let mut stuck = connect_with_buffer(&gateway, 64);
    handshake(&mut stuck, "stuck").await;
    let mut healthy = connect(&gateway);
    handshake(&mut healthy, "healthy").await;
    let healthy_reader = tokio::spawn(collect_pushes(healthy));

    let registry = gateway.registry().clone();
    for _ in 0..50 {
        registry
            .push_to_connection("stuck", Frame::new(Operation::Push, 0, vec![7u8; 100]))
            .unwrap();
    }
    registry
        .push_to_connection("healthy", Frame::new(Operation::Push, 0, vec![1u8]))
        .unwrap();

    let report = registry.drain(Duration::from_millis(300)).await.unwrap();
    assert_eq!(report.forced, 1);
    assert_eq!(report.drained, 1);
    assert!(report.elapsed >= Duration::from_millis(300));
    assert_eq!(registry.connection_count().unwrap(), 0);

    assert_eq!(healthy_reader.await.unwrap(), vec![vec![1u8]]);
    assert_eq!(upstream.wait_for_disconnect("stuck").await, CloseReason::Shutdown);
    drop(stuck);
}
