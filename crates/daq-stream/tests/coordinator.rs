//! Integration tests for stream sessions
//!
//! Every test drives a `StreamCoordinator` over the simulated driver, the
//! same way an application would.
//!
//! Run with: cargo test -p daq-stream --test coordinator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_core::{ConnectionType, DeviceModel, DriverErrorKind};
use daq_driver_mock::{ErrorConfig, ErrorScenario, MockMode, SimulatedDriver};
use daq_stream::{
    CoordinatorOptions, CursorRead, Device, OverflowPolicy, RowSelection, SessionState,
    StopCondition, StreamConfig, StreamCoordinator, StreamError,
};

const WAIT: Duration = Duration::from_secs(10);

fn open(driver: &Arc<SimulatedDriver>) -> Device {
    Device::open(driver.clone(), DeviceModel::Any, ConnectionType::Any, "ANY").unwrap()
}

fn coordinator(driver: &Arc<SimulatedDriver>, options: CoordinatorOptions) -> StreamCoordinator {
    StreamCoordinator::new(open(driver), options).unwrap()
}

fn config(rate: f64, stop: StopCondition) -> StreamConfig {
    StreamConfig::builder()
        .channels(&["A0", "A1"])
        .range(10.0)
        .scan_rate(rate)
        .stop(stop)
        .build()
        .unwrap()
}

fn drain(cursor: &daq_stream::Cursor, pause: Duration) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        match cursor.next_timeout(Duration::from_secs(2)) {
            CursorRead::Ready(block) => {
                seen.push(block.sequence());
                if !pause.is_zero() {
                    thread::sleep(pause);
                }
            }
            CursorRead::EndOfStream => return seen,
            CursorRead::NotYetAvailable => panic!("producer stalled after {:?}", seen.last()),
        }
    }
}

// =============================================================================
// Acquisition
// =============================================================================

#[test]
fn test_two_second_capture_end_to_end() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());

    coordinator
        .configure(config(100.0, StopCondition::Duration(Duration::from_secs(2))))
        .unwrap();
    coordinator.start().unwrap();
    assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.len(), 200);
    assert_eq!(snapshot.sequences(), (0..200).collect::<Vec<_>>());
    assert!(snapshot.blocks().iter().all(|b| b.values().len() == 2));
    assert_eq!(snapshot.channels(), &["A0", "A1"]);

    let status = coordinator.status();
    assert_eq!(status.blocks_produced, 200);
    assert_eq!(status.dropped_blocks, 0);
    assert_eq!(status.actual_scan_rate, Some(100.0));
    assert!(status.last_error.is_none());
    assert_eq!(driver.active_streams(), 0);
}

#[test]
fn test_views_over_finished_capture() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(100.0, StopCondition::Scans(50)))
        .unwrap();
    coordinator.start().unwrap();
    coordinator.wait(WAIT);

    assert_eq!(coordinator.to_sequence().len(), 100);
    assert_eq!(coordinator.to_table().len(), 50);

    let table = coordinator.to_labeled_table();
    assert_eq!(table.headers(), &["A0", "A1", "Time", "System Time"]);
    let time = table.column("Time").unwrap();
    assert!((time[49] - 0.49).abs() < 1e-9);

    let last = coordinator.view(RowSelection::Last(5)).unwrap();
    assert_eq!(last.n_rows(), 5);
    assert_eq!(last.row(0), table.row(45));
    assert!(coordinator.view(RowSelection::Last(51)).is_err());
}

#[test]
fn test_two_cursors_at_different_speeds() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(1000.0, StopCondition::Scans(300)))
        .unwrap();

    let fast = coordinator.cursor();
    let slow = coordinator.cursor();
    coordinator.start().unwrap();

    let fast = thread::spawn(move || drain(&fast, Duration::ZERO));
    let slow = thread::spawn(move || drain(&slow, Duration::from_micros(200)));

    let expected: Vec<u64> = (0..300).collect();
    assert_eq!(fast.join().unwrap(), expected);
    assert_eq!(slow.join().unwrap(), expected);
    assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);
}

#[test]
fn test_on_block_hook_sees_every_block() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    let count = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&count);
    coordinator.on_block(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    coordinator
        .configure(config(100.0, StopCondition::Scans(120)))
        .unwrap();
    coordinator.start().unwrap();
    coordinator.wait(WAIT);
    assert_eq!(count.load(Ordering::SeqCst), 120);
}

#[test]
fn test_reconfigure_after_stop() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());

    for _ in 0..2 {
        coordinator
            .configure(config(100.0, StopCondition::Scans(30)))
            .unwrap();
        coordinator.start().unwrap();
        assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);
        assert_eq!(coordinator.snapshot().sequences(), (0..30).collect::<Vec<_>>());
    }
}

// =============================================================================
// State Machine
// =============================================================================

#[test]
fn test_stop_from_every_state() {
    let driver = Arc::new(SimulatedDriver::new());

    // Idle
    let idle = coordinator(&driver, CoordinatorOptions::default());
    idle.stop().unwrap();
    assert_eq!(idle.state(), SessionState::Stopped);
    idle.close().unwrap();

    // Configuring
    let configured = coordinator(&driver, CoordinatorOptions::default());
    configured
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    assert_eq!(configured.state(), SessionState::Configuring);
    configured.stop().unwrap();
    assert_eq!(configured.state(), SessionState::Stopped);

    // Stopped is a no-op
    configured.stop().unwrap();
    assert_eq!(configured.state(), SessionState::Stopped);
}

#[test]
fn test_stop_while_streaming_is_prompt() {
    let driver = Arc::new(
        SimulatedDriver::builder()
            .mode(MockMode::Realistic)
            .build(),
    );
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(200.0, StopCondition::Continuous))
        .unwrap();
    coordinator.start().unwrap();
    assert_eq!(coordinator.state(), SessionState::Streaming);

    thread::sleep(Duration::from_millis(150));
    coordinator.stop().unwrap();
    assert_eq!(coordinator.state(), SessionState::Stopped);
    assert_eq!(driver.active_streams(), 0);

    let reads = driver.call_count("read_block");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(driver.call_count("read_block"), reads);
    assert!(coordinator.status().blocks_produced > 0);
}

#[test]
fn test_stop_from_hook_does_not_deadlock() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = Arc::new(coordinator(&driver, CoordinatorOptions::default()));
    let handle = Arc::downgrade(&coordinator);
    coordinator.on_block(move |block| {
        if block.sequence() == 10 {
            if let Some(coordinator) = handle.upgrade() {
                coordinator.stop().unwrap();
            }
        }
    });

    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    coordinator.start().unwrap();
    assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);
    assert!(coordinator.status().blocks_produced <= 20);
}

#[test]
fn test_start_requires_configuration() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    let err = coordinator.start().unwrap_err();
    assert!(matches!(
        err,
        StreamError::InvalidState {
            state: SessionState::Idle,
            ..
        }
    ));
}

#[test]
fn test_configure_while_streaming_rejected() {
    let driver = Arc::new(SimulatedDriver::builder().mode(MockMode::Realistic).build());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    coordinator.start().unwrap();

    let err = coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidState { .. }));
    coordinator.stop().unwrap();
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_unsupported_channel_keeps_idle() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    let bad = StreamConfig::builder()
        .channels(&["A0", "AIN99"])
        .range(10.0)
        .scan_rate(100.0)
        .build()
        .unwrap();

    let err = coordinator.configure(bad).unwrap_err();
    assert!(matches!(err, StreamError::Validation { .. }));
    assert!(err.to_string().contains("AIN99"));
    assert_eq!(coordinator.state(), SessionState::Idle);
    assert_eq!(driver.call_count("configure"), 0);
}

#[test]
fn test_unsupported_range_keeps_idle() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    let bad = StreamConfig::builder()
        .channels(&["A0"])
        .range(5.0)
        .scan_rate(100.0)
        .build()
        .unwrap();

    assert!(matches!(
        coordinator.configure(bad),
        Err(StreamError::Validation { .. })
    ));
    assert_eq!(coordinator.state(), SessionState::Idle);
}

#[test]
fn test_device_rejection_restores_state() {
    let driver = Arc::new(
        SimulatedDriver::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::Reject {
                operation: "configure",
                kind: DriverErrorKind::DeviceRejected,
            }))
            .build(),
    );
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    let err = coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap_err();
    assert!(matches!(err, StreamError::Rejected { .. }));
    assert_eq!(coordinator.state(), SessionState::Idle);
}

// =============================================================================
// Overflow
// =============================================================================

#[test]
fn test_lossy_overflow_keeps_newest() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(
        &driver,
        CoordinatorOptions {
            capacity: 10,
            ..CoordinatorOptions::default()
        },
    );
    coordinator
        .configure(config(100.0, StopCondition::Scans(50)))
        .unwrap();
    coordinator.start().unwrap();
    coordinator.wait(WAIT);

    assert_eq!(coordinator.snapshot().sequences(), (40..50).collect::<Vec<_>>());
    let status = coordinator.status();
    assert_eq!(status.dropped_blocks, 40);
    assert_eq!(status.blocks_produced, 50);
}

#[test]
fn test_lossless_waits_for_slow_cursor() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(
        &driver,
        CoordinatorOptions {
            capacity: 4,
            policy: OverflowPolicy::Block {
                timeout: Duration::from_millis(20),
            },
            ..CoordinatorOptions::default()
        },
    );
    coordinator
        .configure(config(100.0, StopCondition::Scans(40)))
        .unwrap();
    let cursor = coordinator.cursor();
    coordinator.start().unwrap();

    let seen = drain(&cursor, Duration::from_millis(2));
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
    assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);
    assert_eq!(coordinator.status().dropped_blocks, 0);
}

#[test]
fn test_lossless_without_consumer_reports_overflow() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(
        &driver,
        CoordinatorOptions {
            capacity: 2,
            policy: OverflowPolicy::Block {
                timeout: Duration::from_millis(10),
            },
            ..CoordinatorOptions::default()
        },
    );
    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    coordinator.start().unwrap();

    thread::sleep(Duration::from_millis(100));
    let status = coordinator.status();
    assert_eq!(status.state, SessionState::Streaming);
    assert!(status.overflow_events > 0);
    assert_eq!(status.buffered_blocks, 2);

    coordinator.stop().unwrap();
    assert_eq!(coordinator.state(), SessionState::Stopped);
    assert_eq!(coordinator.snapshot().sequences(), vec![0, 1]);
}

#[test]
fn test_stop_interrupts_blocked_lossless_push() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(
        &driver,
        CoordinatorOptions {
            capacity: 2,
            policy: OverflowPolicy::Block {
                timeout: Duration::from_secs(3),
            },
            read_timeout: Duration::from_millis(100),
            ..CoordinatorOptions::default()
        },
    );
    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    let _idle = coordinator.cursor();
    coordinator.start().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(coordinator.status().buffered_blocks, 2);

    let started = Instant::now();
    coordinator.stop().unwrap();
    let took = started.elapsed();
    assert!(took < Duration::from_millis(500), "stop took {:?}", took);
    assert_eq!(coordinator.state(), SessionState::Stopped);
    assert_eq!(coordinator.snapshot().sequences(), vec![0, 1]);
    assert_eq!(driver.active_streams(), 0);
}

// =============================================================================
// Faults
// =============================================================================

#[test]
fn test_timeout_burst_is_retried() {
    let driver = Arc::new(
        SimulatedDriver::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::TimeoutBurst {
                operation: "read_block",
                after: 2,
                count: 2,
            }))
            .build(),
    );
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(100.0, StopCondition::Scans(100)))
        .unwrap();
    coordinator.start().unwrap();

    assert_eq!(coordinator.wait(WAIT), SessionState::Stopped);
    let status = coordinator.status();
    assert_eq!(status.timeouts_retried, 2);
    assert_eq!(status.blocks_produced, 100);
}

#[test]
fn test_persistent_timeouts_fault_the_session() {
    let driver = Arc::new(
        SimulatedDriver::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::Timeout {
                operation: "read_block",
            }))
            .build(),
    );
    let coordinator = coordinator(
        &driver,
        CoordinatorOptions {
            max_read_retries: 2,
            ..CoordinatorOptions::default()
        },
    );
    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    coordinator.start().unwrap();

    assert_eq!(coordinator.wait(WAIT), SessionState::Faulted);
    let status = coordinator.status();
    assert_eq!(status.timeouts_retried, 2);
    assert!(status.last_error.unwrap().contains("consecutive read timeouts"));
    assert_eq!(driver.call_count("read_block"), 3);
}

#[test]
fn test_disconnect_faults_the_session() {
    let driver = Arc::new(
        SimulatedDriver::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "read_block",
                count: 3,
            }))
            .build(),
    );
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap();
    let cursor = coordinator.cursor();
    coordinator.start().unwrap();

    assert_eq!(coordinator.wait(WAIT), SessionState::Faulted);
    assert!(coordinator.status().last_error.is_some());

    // Blocks read before the fault stay readable, then the stream ends
    let seen = drain(&cursor, Duration::ZERO);
    assert_eq!(seen.len() as u64, coordinator.status().blocks_produced);

    let err = coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::InvalidState {
            state: SessionState::Faulted,
            ..
        }
    ));
}

// =============================================================================
// Ownership
// =============================================================================

#[test]
fn test_second_coordinator_is_busy() {
    let driver = Arc::new(SimulatedDriver::new());
    let device = open(&driver);
    let first = StreamCoordinator::new(device.clone(), CoordinatorOptions::default()).unwrap();

    let err = StreamCoordinator::new(device.clone(), CoordinatorOptions::default()).unwrap_err();
    assert!(err.is_busy());

    first.close().unwrap();
    assert!(StreamCoordinator::new(device, CoordinatorOptions::default()).is_ok());
}

#[test]
fn test_closed_coordinator_refuses_work() {
    let driver = Arc::new(SimulatedDriver::new());
    let coordinator = coordinator(&driver, CoordinatorOptions::default());
    coordinator.close().unwrap();
    assert!(coordinator
        .configure(config(100.0, StopCondition::Continuous))
        .is_err());
}

#[test]
fn test_drop_releases_driver_stream() {
    let driver = Arc::new(SimulatedDriver::builder().mode(MockMode::Realistic).build());
    {
        let coordinator = coordinator(&driver, CoordinatorOptions::default());
        coordinator
            .configure(config(100.0, StopCondition::Continuous))
            .unwrap();
        coordinator.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(driver.active_streams(), 1);
    }
    assert_eq!(driver.active_streams(), 0);
    assert_eq!(driver.open_handles(), 0);
}

#[test]
fn test_zero_capacity_rejected() {
    let driver = Arc::new(SimulatedDriver::new());
    let err = StreamCoordinator::new(
        open(&driver),
        CoordinatorOptions {
            capacity: 0,
            ..CoordinatorOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, StreamError::Validation { .. }));
}
