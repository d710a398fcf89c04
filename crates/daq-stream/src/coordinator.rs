//! Stream coordinator: session state machine and acquisition loop.
//!
//! A [`StreamCoordinator`] owns one [`Device`] for its lifetime, one
//! [`RingBuffer`], and at most one producer thread. Consumers read through
//! cursors, snapshots, or subscriptions while acquisition is in flight.
//!
//! # Architecture
//!
//! ```text
//!        caller threads                     producer thread
//!   configure / start / stop        ┌──────────────────────────────┐
//!             │                     │ loop:                        │
//!             ▼                     │   read_block(token, timeout) │
//!   ┌──────────────────┐            │   split into scans           │
//!   │ StreamCoordinator│───spawn───▶│   on_block hook              │
//!   │  state machine   │            │   ring.push (policy)         │
//!   └────────┬─────────┘            │   try_send to subscribers    │
//!            │                      └──────────────┬───────────────┘
//!            │                                     │
//!            ▼                                     ▼
//!   ┌──────────────────┐     cursors / snapshot   ┌────────────┐
//!   │    RingBuffer    │◀────────────────────────▶│ consumers  │
//!   └──────────────────┘                          └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_stream::{CoordinatorOptions, StreamConfig, StreamCoordinator};
//!
//! let coordinator = StreamCoordinator::new(device, CoordinatorOptions::default())?;
//! coordinator.configure(config)?;
//! let cursor = coordinator.cursor();
//! coordinator.start()?;
//!
//! while let Some(block) = cursor.next_timeout(Duration::from_secs(1)).into_block() {
//!     println!("{} {:?}", block.sequence(), block.values());
//! }
//! coordinator.stop()?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use daq_core::limits::{
    DEFAULT_MAX_READ_RETRIES, DEFAULT_READ_TIMEOUT, DEFAULT_RING_CAPACITY,
};
use daq_core::StreamToken;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::block::SampleBlock;
use crate::device::{Device, SessionClaim};
use crate::error::{ErrorContext, Result, StreamError};
use crate::ring_buffer::{Cursor, OverflowPolicy, RingBuffer, Snapshot};
use crate::session::{SessionState, StreamConfig};
use crate::views::{LabeledTable, RowSelection};

/// Callback run on the producer thread for every block.
pub type BlockHook = Arc<dyn Fn(&SampleBlock) + Send + Sync>;

/// Receiver handle for a subscription.
pub type BlockReceiver = mpsc::Receiver<Arc<SampleBlock>>;

/// Buffering and retry policy for a coordinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorOptions {
    /// Ring buffer capacity in blocks
    pub capacity: usize,
    /// Behavior when the ring is full
    pub policy: OverflowPolicy,
    /// Timeout for each driver read
    pub read_timeout: Duration,
    /// Consecutive read timeouts tolerated before faulting
    pub max_read_retries: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RING_CAPACITY,
            policy: OverflowPolicy::DropOldest,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_read_retries: DEFAULT_MAX_READ_RETRIES,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    /// Current session state
    pub state: SessionState,
    /// Blocks handed to the ring buffer
    pub blocks_produced: u64,
    /// Blocks evicted under the lossy policy
    pub dropped_blocks: u64,
    /// Blocks currently retained
    pub buffered_blocks: usize,
    /// Lossless pushes that timed out
    pub overflow_events: u64,
    /// Read timeouts that were retried
    pub timeouts_retried: u64,
    /// Values carrying the skipped-sample marker
    pub skipped_samples: u64,
    /// Latest device-side backlog, in scans
    pub device_backlog: u64,
    /// Latest driver-side backlog, in scans
    pub driver_backlog: u64,
    /// Highest device-side backlog seen
    pub peak_device_backlog: u64,
    /// Highest driver-side backlog seen
    pub peak_driver_backlog: u64,
    /// Blocks dropped per subscriber because its channel was full
    pub subscriber_drops: HashMap<String, u64>,
    /// Error that ended the last stream
    pub last_error: Option<String>,
    /// Time since the stream started
    pub elapsed: Option<Duration>,
    /// Rate reported by the driver at start
    pub actual_scan_rate: Option<f64>,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_produced: AtomicU64,
    overflow_events: AtomicU64,
    timeouts_retried: AtomicU64,
    skipped_samples: AtomicU64,
    device_backlog: AtomicU64,
    driver_backlog: AtomicU64,
    peak_device_backlog: AtomicU64,
    peak_driver_backlog: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.blocks_produced,
            &self.overflow_events,
            &self.timeouts_retried,
            &self.skipped_samples,
            &self.device_backlog,
            &self.driver_backlog,
            &self.peak_device_backlog,
            &self.peak_driver_backlog,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn record_backlog(&self, device: u32, driver: u32) {
        self.device_backlog.store(device as u64, Ordering::SeqCst);
        self.driver_backlog.store(driver as u64, Ordering::SeqCst);
        self.peak_device_backlog
            .fetch_max(device as u64, Ordering::SeqCst);
        self.peak_driver_backlog
            .fetch_max(driver as u64, Ordering::SeqCst);
    }
}

struct Subscriber {
    sender: Option<mpsc::Sender<Arc<SampleBlock>>>,
    drops: AtomicU64,
}

#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// State shared with the producer thread.
struct Shared {
    state: Mutex<SessionState>,
    state_changed: Condvar,
    stop_requested: AtomicBool,
    counters: Counters,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    last_error: Mutex<Option<String>>,
    timing: Mutex<Timing>,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            state_changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            counters: Counters::default(),
            subscribers: RwLock::new(HashMap::new()),
            last_error: Mutex::new(None),
            timing: Mutex::new(Timing::default()),
            worker_thread: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, to: SessionState) {
        let mut state = self.state.lock();
        let from = *state;
        *state = to;
        drop(state);
        self.state_changed.notify_all();
        if from != to {
            info!(%from, %to, "Session state changed");
        }
    }

    /// Move `from -> to` only if the session is still in `from`.
    fn transition_if(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);
        self.state_changed.notify_all();
        info!(%from, %to, "Session state changed");
        true
    }

    fn record_error(&self, err: &StreamError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn is_worker_thread(&self) -> bool {
        *self.worker_thread.lock() == Some(thread::current().id())
    }

    /// Drop every subscriber's sender so receivers see the end of the stream.
    fn close_subscribers(&self) {
        for subscriber in self.subscribers.write().values_mut() {
            subscriber.sender = None;
        }
    }
}

#[derive(Debug, Clone)]
struct SessionInfo {
    config: StreamConfig,
    channels: Arc<[String]>,
    actual_scan_rate: Option<f64>,
}

/// Owns a device's stream session: configuration, the acquisition thread,
/// the ring buffer, and every way of reading from it.
pub struct StreamCoordinator {
    device: Device,
    options: CoordinatorOptions,
    shared: Arc<Shared>,
    ring: RwLock<RingBuffer>,
    session: Mutex<Option<SessionInfo>>,
    hook: RwLock<Option<BlockHook>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    claim: Mutex<Option<SessionClaim>>,
    /// Serializes configure / start / close
    control: Mutex<()>,
}

impl std::fmt::Debug for StreamCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCoordinator")
            .field("device", &self.device)
            .field("options", &self.options)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl StreamCoordinator {
    /// Take ownership of `device` for stream sessions.
    ///
    /// Fails with a `Busy` transport error if another coordinator already
    /// owns the device.
    pub fn new(device: Device, options: CoordinatorOptions) -> Result<Self> {
        let ring = RingBuffer::new(options.capacity, options.policy)?;
        let claim = device.claim()?;

        info!(
            handle = %device.handle(),
            capacity = options.capacity,
            policy = ?options.policy,
            "Created stream coordinator"
        );

        Ok(Self {
            device,
            options,
            shared: Arc::new(Shared::new()),
            ring: RwLock::new(ring),
            session: Mutex::new(None),
            hook: RwLock::new(None),
            worker: Mutex::new(None),
            claim: Mutex::new(Some(claim)),
            control: Mutex::new(()),
        })
    }

    /// The owned device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Buffering and retry options.
    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The configuration of the current session, if any.
    pub fn config(&self) -> Option<StreamConfig> {
        self.session.lock().as_ref().map(|s| s.config.clone())
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.claim.lock().is_none() {
            return Err(StreamError::validation(
                ErrorContext::new(operation).handle(self.device.handle()),
                "coordinator is closed",
            ));
        }
        Ok(())
    }

    fn fault(&self, err: &StreamError) {
        error!(handle = %self.device.handle(), error = %err, "Session faulted");
        self.shared.record_error(err);
        self.ring.read().close();
        self.shared.close_subscribers();
        self.shared.set_state(SessionState::Faulted);
    }

    /// Validate `config` and write it to the device.
    ///
    /// Accepted from `Idle` or `Stopped`. Parameters are checked locally and
    /// against the device's declared capabilities before any hardware call;
    /// a validation failure leaves the state unchanged. A device rejection
    /// restores the previous state, a transport failure faults the session.
    pub fn configure(&self, config: StreamConfig) -> Result<()> {
        let _control = self.control.lock();
        self.ensure_open("configure")?;

        let previous = self.shared.state();
        if !previous.can_configure() {
            return Err(StreamError::InvalidState {
                operation: "configure",
                state: previous,
            });
        }

        config.validate()?;
        config.validate_against(self.device.capabilities())?;

        self.shared.set_state(SessionState::Configuring);
        debug!(
            channels = ?config.channel_names(),
            scan_rate = config.scan_rate(),
            scans_per_read = config.scans_per_read(),
            "Configuring stream"
        );

        let result = self.device.with_driver("configure", |driver, handle| {
            driver.configure(handle, config.channels(), config.settings())
        });

        if let Err(e) = result {
            if e.is_fatal() {
                self.fault(&e);
            } else {
                warn!(error = %e, "Configuration refused");
                self.shared
                    .transition_if(SessionState::Configuring, previous);
            }
            return Err(e);
        }

        {
            let mut ring = self.ring.write();
            if ring.is_closed() {
                *ring = RingBuffer::new(self.options.capacity, self.options.policy)?;
            }
        }
        self.shared.counters.reset();
        *self.shared.last_error.lock() = None;
        *self.shared.timing.lock() = Timing::default();

        let channels: Arc<[String]> = Arc::from(config.channel_names());
        *self.session.lock() = Some(SessionInfo {
            config,
            channels,
            actual_scan_rate: None,
        });
        Ok(())
    }

    /// Start the configured stream and spawn the acquisition thread.
    pub fn start(&self) -> Result<()> {
        let _control = self.control.lock();
        self.ensure_open("start")?;

        let state = self.shared.state();
        if state != SessionState::Configuring {
            return Err(StreamError::InvalidState {
                operation: "start",
                state,
            });
        }
        let Some(session) = self.session.lock().clone() else {
            return Err(StreamError::InvalidState {
                operation: "start",
                state,
            });
        };

        self.join_worker();
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let request = session.config.request();
        let started = match self
            .device
            .with_driver("start", |driver, handle| driver.start_stream(handle, &request))
        {
            Ok(started) => started,
            Err(e) => {
                if e.is_fatal() {
                    self.fault(&e);
                } else {
                    warn!(error = %e, "Stream start refused");
                }
                return Err(e);
            }
        };

        if let Some(info) = self.session.lock().as_mut() {
            info.actual_scan_rate = Some(started.actual_scan_rate);
        }
        *self.shared.timing.lock() = Timing {
            started: Some(Instant::now()),
            finished: None,
        };

        if !self
            .shared
            .transition_if(SessionState::Configuring, SessionState::Streaming)
        {
            // stop() won the race while the driver was starting
            self.release_stream(started.token);
            return Err(StreamError::InvalidState {
                operation: "start",
                state: self.shared.state(),
            });
        }

        let total_scans = session
            .config
            .stop_condition()
            .total_scans(started.actual_scan_rate);

        let acquisition = Acquisition {
            device: self.device.clone(),
            shared: Arc::clone(&self.shared),
            ring: self.ring.read().clone(),
            token: started.token,
            channels: Arc::clone(&session.channels),
            scan_rate: started.actual_scan_rate,
            total_scans,
            read_timeout: self.options.read_timeout,
            max_read_retries: self.options.max_read_retries,
            hook: self.hook.read().clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("daq-acquisition-{}", self.device.handle().0))
            .spawn(move || acquisition.run());

        match spawned {
            Ok(handle) => {
                *self.shared.worker_thread.lock() = Some(handle.thread().id());
                *self.worker.lock() = Some(handle);
            }
            Err(e) => {
                self.release_stream(started.token);
                let err = StreamError::Io(e);
                self.fault(&err);
                return Err(err);
            }
        }

        info!(
            handle = %self.device.handle(),
            token = %started.token,
            requested_rate = session.config.scan_rate(),
            actual_rate = started.actual_scan_rate,
            total_scans = ?total_scans,
            "Started stream"
        );
        Ok(())
    }

    fn release_stream(&self, token: StreamToken) {
        if let Err(e) = self
            .device
            .with_driver("stop", |driver, _| driver.stop_stream(token))
        {
            warn!(%token, error = %e, "Failed to release stream");
        }
    }

    /// Stop acquisition. Callable from any thread, in any state.
    ///
    /// The session enters `Stopping` immediately; the in-flight read is
    /// bounded by the read timeout, after which the driver stream is
    /// released and the state becomes `Stopped`. `Faulted` is left as is.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let state = self.shared.state();
        match state {
            SessionState::Streaming => {
                self.shared
                    .transition_if(SessionState::Streaming, SessionState::Stopping);
                // Release a producer parked in a lossless push
                self.ring.read().interrupt();
            }
            SessionState::Idle | SessionState::Configuring => {
                if self.shared.transition_if(state, SessionState::Stopping) {
                    self.ring.read().close();
                    self.shared.close_subscribers();
                    self.shared
                        .transition_if(SessionState::Stopping, SessionState::Stopped);
                }
            }
            SessionState::Stopping | SessionState::Stopped | SessionState::Faulted => {}
        }

        // A hook calling stop() must not join its own thread
        if !self.shared.is_worker_thread() {
            self.join_worker();
        }
        Ok(())
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if let Err(e) = handle.join() {
                error!("Acquisition thread panicked: {:?}", e);
                self.shared.set_state(SessionState::Faulted);
            }
        }
    }

    /// Block until the session is `Stopped` or `Faulted`, or `timeout`
    /// elapses. Returns the state at that point.
    pub fn wait(&self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_terminal() {
            if self
                .shared
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        *state
    }

    /// Stop any stream and release the device for another session.
    pub fn close(&self) -> Result<()> {
        self.stop()?;
        let _control = self.control.lock();
        self.ring.read().close();
        if self.claim.lock().take().is_some() {
            info!(handle = %self.device.handle(), "Closed stream coordinator");
        }
        Ok(())
    }

    /// Run `hook` on the producer thread for every block of streams
    /// started after this call.
    pub fn on_block<F>(&self, hook: F)
    where
        F: Fn(&SampleBlock) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Arc::new(hook));
    }

    /// Register a consumer cursor at the oldest retained block.
    pub fn cursor(&self) -> Cursor {
        self.ring.read().cursor()
    }

    /// Register a consumer cursor that sees only new blocks.
    pub fn cursor_from_tail(&self) -> Cursor {
        self.ring.read().cursor_from_tail()
    }

    /// Receive every block through a bounded channel.
    ///
    /// Delivery never blocks the producer: when the channel is full the
    /// block is dropped for this subscriber and counted in
    /// [`StreamStatus::subscriber_drops`].
    pub fn subscribe(&self, name: &str, capacity: usize) -> Result<BlockReceiver> {
        if capacity == 0 {
            return Err(StreamError::validation(
                ErrorContext::new("subscribe"),
                "subscriber capacity must be greater than 0",
            ));
        }

        let mut subscribers = self.shared.subscribers.write();
        if let Some(existing) = subscribers.get(name) {
            let live = existing.sender.as_ref().is_some_and(|s| !s.is_closed());
            if live {
                return Err(StreamError::validation(
                    ErrorContext::new("subscribe"),
                    format!("subscriber '{}' already exists", name),
                ));
            }
        }

        let (tx, rx) = mpsc::channel(capacity);
        subscribers.insert(
            name.to_string(),
            Subscriber {
                sender: Some(tx),
                drops: AtomicU64::new(0),
            },
        );
        debug!(name, capacity, "Added subscriber");
        Ok(rx)
    }

    /// Remove a subscriber; its receiver sees the end of the stream.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.shared.subscribers.write().remove(name).is_some()
    }

    /// All retained blocks, labeled with the session's channels.
    pub fn snapshot(&self) -> Snapshot {
        let snapshot = self.ring.read().snapshot();
        match self.session.lock().as_ref() {
            Some(info) => snapshot.with_channels(Arc::clone(&info.channels)),
            None => snapshot,
        }
    }

    /// Flat values in scan order.
    pub fn to_sequence(&self) -> Vec<f64> {
        self.snapshot().to_sequence()
    }

    /// `[sample][channel]` table.
    pub fn to_table(&self) -> Vec<Vec<f64>> {
        self.snapshot().to_table()
    }

    /// Channel columns plus `Time` and `System Time`.
    pub fn to_labeled_table(&self) -> LabeledTable {
        self.snapshot().to_labeled_table()
    }

    /// Labeled table over a row selection.
    pub fn view(&self, selection: RowSelection) -> Result<LabeledTable> {
        Ok(self.snapshot().select(selection)?.to_labeled_table())
    }

    /// Blocks evicted from the ring under the lossy policy.
    pub fn dropped_blocks(&self) -> u64 {
        self.ring.read().dropped_blocks()
    }

    /// Counters and state at this instant.
    pub fn status(&self) -> StreamStatus {
        let ring = self.ring.read().clone();
        let counters = &self.shared.counters;
        let subscriber_drops = self
            .shared
            .subscribers
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.drops.load(Ordering::SeqCst)))
            .collect();
        let elapsed = {
            let timing = self.shared.timing.lock();
            timing
                .started
                .map(|start| timing.finished.unwrap_or_else(Instant::now) - start)
        };

        StreamStatus {
            state: self.shared.state(),
            blocks_produced: counters.blocks_produced.load(Ordering::SeqCst),
            dropped_blocks: ring.dropped_blocks(),
            buffered_blocks: ring.len(),
            overflow_events: counters.overflow_events.load(Ordering::SeqCst),
            timeouts_retried: counters.timeouts_retried.load(Ordering::SeqCst),
            skipped_samples: counters.skipped_samples.load(Ordering::SeqCst),
            device_backlog: counters.device_backlog.load(Ordering::SeqCst),
            driver_backlog: counters.driver_backlog.load(Ordering::SeqCst),
            peak_device_backlog: counters.peak_device_backlog.load(Ordering::SeqCst),
            peak_driver_backlog: counters.peak_driver_backlog.load(Ordering::SeqCst),
            subscriber_drops,
            last_error: self.shared.last_error.lock().clone(),
            elapsed,
            actual_scan_rate: self
                .session
                .lock()
                .as_ref()
                .and_then(|s| s.actual_scan_rate),
        }
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping stream on drop: {}", e);
        }
    }
}

// =============================================================================
// Acquisition Thread
// =============================================================================

enum Completion {
    /// stop() was requested
    Stopped,
    /// The stop condition was met
    Finished,
}

struct Acquisition {
    device: Device,
    shared: Arc<Shared>,
    ring: RingBuffer,
    token: StreamToken,
    channels: Arc<[String]>,
    scan_rate: f64,
    total_scans: Option<u64>,
    read_timeout: Duration,
    max_read_retries: u32,
    hook: Option<BlockHook>,
}

impl Acquisition {
    fn run(self) {
        let outcome = self.acquire();
        self.finish(outcome);
        debug!("Acquisition thread exiting");
    }

    fn limit_reached(&self, sequence: u64) -> bool {
        self.total_scans.is_some_and(|total| sequence >= total)
    }

    fn acquire(&self) -> Result<Completion> {
        let started = Instant::now();
        let n_channels = self.channels.len();
        let mut sequence = 0u64;
        let mut consecutive_timeouts = 0u32;

        loop {
            if self.shared.stop_requested() {
                return Ok(Completion::Stopped);
            }
            if self.limit_reached(sequence) {
                return Ok(Completion::Finished);
            }

            let token = self.token;
            let timeout = self.read_timeout;
            let raw = match self
                .device
                .with_driver("read", |driver, _| driver.read_block(token, timeout))
            {
                Ok(raw) => {
                    consecutive_timeouts = 0;
                    raw
                }
                Err(e) if e.is_retryable() => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts > self.max_read_retries {
                        return Err(StreamError::Timeout {
                            context: ErrorContext::new("read").handle(self.device.handle()),
                            message: format!(
                                "{} consecutive read timeouts (limit {})",
                                consecutive_timeouts, self.max_read_retries
                            ),
                        });
                    }
                    self.shared
                        .counters
                        .timeouts_retried
                        .fetch_add(1, Ordering::SeqCst);
                    warn!(
                        attempt = consecutive_timeouts,
                        max = self.max_read_retries,
                        "Read timed out, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.shared
                .counters
                .record_backlog(raw.device_backlog, raw.driver_backlog);

            let now = Instant::now();
            let elapsed = now - started;
            let mut skipped = 0usize;

            let chunks = raw.samples.chunks_exact(n_channels);
            if !chunks.remainder().is_empty() {
                warn!(
                    extra = chunks.remainder().len(),
                    "Discarding partial scan from driver"
                );
            }

            for scan in chunks {
                if self.limit_reached(sequence) {
                    break;
                }
                let block = SampleBlock::new(
                    sequence,
                    now,
                    elapsed,
                    sequence as f64 / self.scan_rate,
                    Arc::clone(&self.channels),
                    scan.to_vec(),
                )?;
                skipped += block.skipped_count();

                if let Some(hook) = &self.hook {
                    hook(&block);
                }

                let block = Arc::new(block);
                if !self.publish(&block)? {
                    return Ok(Completion::Stopped);
                }
                self.dispatch(&block);
                self.shared
                    .counters
                    .blocks_produced
                    .fetch_add(1, Ordering::SeqCst);
                sequence += 1;
            }

            if skipped > 0 {
                let total = self
                    .shared
                    .counters
                    .skipped_samples
                    .fetch_add(skipped as u64, Ordering::SeqCst)
                    + skipped as u64;
                warn!(skipped, total, device_backlog = raw.device_backlog, "Device skipped samples");
            }

            trace!(
                sequence,
                device_backlog = raw.device_backlog,
                driver_backlog = raw.driver_backlog,
                "Processed read"
            );
        }
    }

    /// Push into the ring, retrying lossless overflows until stop.
    /// Returns false if stop was requested while waiting.
    fn publish(&self, block: &Arc<SampleBlock>) -> Result<bool> {
        loop {
            match self.ring.push(Arc::clone(block)) {
                Ok(()) => return Ok(true),
                Err(StreamError::Overflow { timeout, .. }) => {
                    let events = self
                        .shared
                        .counters
                        .overflow_events
                        .fetch_add(1, Ordering::SeqCst)
                        + 1;
                    warn!(
                        sequence = block.sequence(),
                        events,
                        ?timeout,
                        "Consumers too slow, retrying push"
                    );
                    if self.shared.stop_requested() {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&self, block: &Arc<SampleBlock>) {
        let subscribers = self.shared.subscribers.read();
        for (name, subscriber) in subscribers.iter() {
            let Some(sender) = &subscriber.sender else {
                continue;
            };
            match sender.try_send(Arc::clone(block)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.drops.fetch_add(1, Ordering::SeqCst);
                    trace!(subscriber = %name, "Dropped block (subscriber full)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subscriber = %name, "Subscriber closed");
                }
            }
        }
    }

    fn finish(&self, outcome: Result<Completion>) {
        match outcome {
            Ok(completion) => {
                if matches!(completion, Completion::Finished) {
                    self.shared
                        .transition_if(SessionState::Streaming, SessionState::Stopping);
                }
                if let Err(e) = self
                    .device
                    .with_driver("stop", |driver, _| driver.stop_stream(self.token))
                {
                    warn!(token = %self.token, error = %e, "Failed to stop driver stream");
                }
                self.ring.close();
                self.shared.close_subscribers();
                self.shared.timing.lock().finished = Some(Instant::now());
                self.shared.set_state(SessionState::Stopped);
                info!(
                    blocks = self.shared.counters.blocks_produced.load(Ordering::SeqCst),
                    dropped = self.ring.dropped_blocks(),
                    overflows = self.shared.counters.overflow_events.load(Ordering::SeqCst),
                    skipped = self.shared.counters.skipped_samples.load(Ordering::SeqCst),
                    "Stream finished"
                );
            }
            Err(err) => {
                error!(token = %self.token, error = %err, "Acquisition failed");
                if let Err(e) = self
                    .device
                    .with_driver("stop", |driver, _| driver.stop_stream(self.token))
                {
                    debug!(error = %e, "Stream release after fault failed");
                }
                self.shared.record_error(&err);
                self.ring.close();
                self.shared.close_subscribers();
                self.shared.timing.lock().finished = Some(Instant::now());
                self.shared.set_state(SessionState::Faulted);
            }
        }
        *self.shared.worker_thread.lock() = None;
    }
}
