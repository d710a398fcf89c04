//! Subscription delivery tests
//!
//! Subscribers receive blocks over bounded tokio channels; a full channel
//! drops blocks for that subscriber only and never stalls the producer.

use std::sync::Arc;
use std::time::Duration;

use daq_core::{ConnectionType, DeviceModel};
use daq_driver_mock::SimulatedDriver;
use daq_stream::{
    CoordinatorOptions, Device, SessionState, StopCondition, StreamConfig, StreamCoordinator,
    StreamError,
};

fn session(scans: u64) -> StreamCoordinator {
    let device = Device::open(
        Arc::new(SimulatedDriver::new()),
        DeviceModel::Any,
        ConnectionType::Any,
        "ANY",
    )
    .unwrap();
    let coordinator = StreamCoordinator::new(device, CoordinatorOptions::default()).unwrap();
    coordinator
        .configure(
            StreamConfig::builder()
                .channels(&["AIN0", "AIN1", "AIN2"])
                .range(10.0)
                .scan_rate(500.0)
                .stop(StopCondition::Scans(scans))
                .build()
                .unwrap(),
        )
        .unwrap();
    coordinator
}

#[tokio::test]
async fn test_subscriber_receives_every_block() {
    let coordinator = session(50);
    let mut rx = coordinator.subscribe("plot", 1024).unwrap();
    coordinator.start().unwrap();

    let mut sequences = Vec::new();
    while let Some(block) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
    {
        assert_eq!(block.n_channels(), 3);
        sequences.push(block.sequence());
    }

    assert_eq!(sequences, (0..50).collect::<Vec<_>>());
    assert_eq!(coordinator.wait(Duration::from_secs(5)), SessionState::Stopped);
    assert_eq!(coordinator.status().subscriber_drops["plot"], 0);
}

#[tokio::test]
async fn test_full_subscriber_drops_without_blocking() {
    let coordinator = session(20);
    let mut slow = coordinator.subscribe("slow", 1).unwrap();
    let mut fast = coordinator.subscribe("fast", 64).unwrap();
    coordinator.start().unwrap();
    assert_eq!(coordinator.wait(Duration::from_secs(5)), SessionState::Stopped);

    let status = coordinator.status();
    assert_eq!(status.blocks_produced, 20);
    assert_eq!(status.subscriber_drops["slow"], 19);
    assert_eq!(status.subscriber_drops["fast"], 0);

    assert_eq!(slow.recv().await.unwrap().sequence(), 0);
    assert!(slow.recv().await.is_none());

    let mut count = 0;
    while fast.recv().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 20);
}

#[tokio::test]
async fn test_subscription_validation() {
    let coordinator = session(10);
    let _rx = coordinator.subscribe("ui", 8).unwrap();

    let duplicate = coordinator.subscribe("ui", 8).unwrap_err();
    assert!(matches!(duplicate, StreamError::Validation { .. }));

    let empty = coordinator.subscribe("other", 0).unwrap_err();
    assert!(matches!(empty, StreamError::Validation { .. }));

    assert!(coordinator.unsubscribe("ui"));
    assert!(!coordinator.unsubscribe("ui"));
    assert!(coordinator.subscribe("ui", 8).is_ok());
}

#[tokio::test]
async fn test_dropped_receiver_frees_name() {
    let coordinator = session(10);
    let rx = coordinator.subscribe("ui", 8).unwrap();
    drop(rx);
    assert!(coordinator.subscribe("ui", 8).is_ok());
}
