//! Integration tests for the simulated driver
//!
//! These drive the driver only through the `VendorDriver` trait object, the
//! way the streaming layer uses it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use daq_core::{
    ChannelConfig, ConnectionType, DeviceModel, DriverErrorKind, StreamRequest, StreamSettings,
    VendorDriver,
};
use daq_driver_mock::*;

fn open(driver: &dyn VendorDriver) -> daq_core::DeviceHandle {
    driver
        .open(DeviceModel::Any, ConnectionType::Any, "ANY")
        .expect("open")
}

/// Full command sequence through a trait object
#[test]
fn test_full_lifecycle_via_trait_object() {
    let driver: Arc<dyn VendorDriver> =
        Arc::new(SimulatedDriver::builder().channels(["A0", "A1"]).build());
    let handle = open(driver.as_ref());

    driver
        .configure(
            handle,
            &[ChannelConfig::new("A0", 10.0), ChannelConfig::new("A1", 10.0)],
            &StreamSettings::default(),
        )
        .unwrap();

    let start = driver
        .start_stream(
            handle,
            &StreamRequest {
                channels: vec!["A0".into(), "A1".into()],
                scan_rate: 100.0,
                scans_per_read: 10,
            },
        )
        .unwrap();

    let mut total = 0;
    for _ in 0..20 {
        let block = driver.read_block(start.token, Duration::from_millis(50)).unwrap();
        total += block.samples.len();
    }
    assert_eq!(total, 20 * 10 * 2);

    driver.stop_stream(start.token).unwrap();
    driver.close(handle).unwrap();
}

/// Realistic mode delivers blocks at the scan clock
#[test]
fn test_realistic_pacing() {
    let driver = SimulatedDriver::builder()
        .mode(MockMode::Realistic)
        .timing(TimingConfig::default())
        .build();
    let handle = open(&driver);
    let start = driver
        .start_stream(
            handle,
            &StreamRequest {
                channels: vec!["AIN0".into()],
                scan_rate: 1000.0,
                scans_per_read: 50,
            },
        )
        .unwrap();

    let begin = Instant::now();
    for _ in 0..4 {
        driver.read_block(start.token, Duration::from_millis(500)).unwrap();
    }
    // 200 scans at 1 kHz
    assert!(begin.elapsed() >= Duration::from_millis(180));
}

/// Timeout bursts surface as transient errors and then recover
#[test]
fn test_timeout_burst_is_transient() {
    let driver = SimulatedDriver::builder()
        .errors(ErrorConfig::scenario(ErrorScenario::TimeoutBurst {
            operation: "read_block",
            after: 1,
            count: 2,
        }))
        .build();
    let handle = open(&driver);
    let start = driver
        .start_stream(
            handle,
            &StreamRequest {
                channels: vec!["AIN0".into()],
                scan_rate: 10.0,
                scans_per_read: 1,
            },
        )
        .unwrap();

    let kinds: Vec<Option<DriverErrorKind>> = (0..4)
        .map(|_| {
            driver
                .read_block(start.token, Duration::from_millis(5))
                .err()
                .map(|e| e.kind)
        })
        .collect();
    assert_eq!(
        kinds,
        vec![None, Some(DriverErrorKind::Timeout), Some(DriverErrorKind::Timeout), None]
    );
}

/// Seeded noise is reproducible across driver instances
#[test]
fn test_seeded_noise_reproducible() {
    let make = || {
        SimulatedDriver::builder()
            .seed(99)
            .signal(SignalConfig {
                amplitude: 1.0,
                frequency: 5.0,
                noise: 0.05,
            })
            .build()
    };
    let read = |driver: &SimulatedDriver| {
        let handle = open(driver);
        let start = driver
            .start_stream(
                handle,
                &StreamRequest {
                    channels: vec!["AIN0".into(), "AIN1".into()],
                    scan_rate: 100.0,
                    scans_per_read: 16,
                },
            )
            .unwrap();
        driver.read_block(start.token, Duration::from_millis(5)).unwrap().samples
    };

    assert_eq!(read(&make()), read(&make()));
}

/// Digit models declare no analog stream channels
#[test]
fn test_digit_has_no_stream_channels() {
    let driver = SimulatedDriver::builder().model(DeviceModel::Digit).build();
    let handle = open(&driver);
    let caps = driver.capabilities(handle).unwrap();
    assert!(caps.channels.is_empty());

    let err = driver
        .start_stream(
            handle,
            &StreamRequest {
                channels: vec!["AIN0".into()],
                scan_rate: 10.0,
                scans_per_read: 1,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind, DriverErrorKind::InvalidChannel);
}
