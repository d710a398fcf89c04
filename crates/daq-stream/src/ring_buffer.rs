//! Bounded single-producer / multi-consumer block buffer.
//!
//! The ring holds `Arc<SampleBlock>` references. One mutex guards the deque
//! of references, the cursor table, and the counters; payloads are never
//! copied under the lock.
//!
//! # Positions
//!
//! Every pushed block gets an absolute index (`0, 1, 2, ...` in push order).
//! Index `base` is the oldest retained block and `base + len` is the next
//! index to be written. A [`Cursor`] stores the absolute index of the next
//! block it has not read. For coordinator-produced streams the index equals
//! the block's sequence number.
//!
//! # Overflow
//!
//! ```text
//! DropOldest          evict blocks[base], dropped += 1, lagging cursors
//!                     skip ahead and count what they missed
//! Block { timeout }   wait until every cursor has read blocks[base],
//!                     then evict it; fail with Overflow after `timeout`
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::block::SampleBlock;
use crate::error::{ErrorContext, Result, StreamError};

/// What `push` does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest block; never blocks the producer.
    #[default]
    DropOldest,
    /// Wait for the slowest cursor, up to `timeout`.
    Block {
        /// How long a push waits for the slowest cursor
        timeout: Duration,
    },
}

/// Outcome of a cursor read.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorRead {
    /// The next block
    Ready(Arc<SampleBlock>),
    /// Caught up with the producer; more may arrive.
    NotYetAvailable,
    /// Caught up and the ring is closed.
    EndOfStream,
}

impl CursorRead {
    /// The block, if one was ready.
    pub fn into_block(self) -> Option<Arc<SampleBlock>> {
        match self {
            CursorRead::Ready(block) => Some(block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CursorState {
    position: u64,
    missed: u64,
}

#[derive(Debug, Default)]
struct RingState {
    blocks: VecDeque<Arc<SampleBlock>>,
    base: u64,
    last_sequence: Option<u64>,
    cursors: HashMap<u64, CursorState>,
    next_cursor_id: u64,
    dropped: u64,
    closed: bool,
    /// Lossless pushes give up instead of waiting
    interrupted: bool,
}

impl RingState {
    fn tail(&self) -> u64 {
        self.base + self.blocks.len() as u64
    }

    /// Every registered cursor has read the oldest block.
    fn front_consumed(&self) -> bool {
        !self.cursors.is_empty() && self.cursors.values().all(|c| c.position > self.base)
    }

    fn evict_front(&mut self) {
        if self.blocks.pop_front().is_some() {
            self.base += 1;
        }
    }

    fn read(&mut self, id: u64) -> CursorRead {
        let base = self.base;
        let tail = self.tail();
        let closed = self.closed;
        let Some(cursor) = self.cursors.get_mut(&id) else {
            return CursorRead::EndOfStream;
        };
        if cursor.position < base {
            cursor.missed += base - cursor.position;
            cursor.position = base;
        }
        if cursor.position >= tail {
            return if closed {
                CursorRead::EndOfStream
            } else {
                CursorRead::NotYetAvailable
            };
        }
        let offset = (cursor.position - base) as usize;
        cursor.position += 1;
        match self.blocks.get(offset) {
            Some(block) => CursorRead::Ready(Arc::clone(block)),
            None => CursorRead::NotYetAvailable,
        }
    }
}

struct Inner {
    state: Mutex<RingState>,
    /// Signalled on push and close
    readable: Condvar,
    /// Signalled when a cursor advances or goes away
    writable: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Fixed-capacity SPMC ring of sample blocks.
#[derive(Clone)]
pub struct RingBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.inner.capacity)
            .field("policy", &self.inner.policy)
            .field("len", &self.len())
            .finish()
    }
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` blocks.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(StreamError::validation(
                ErrorContext::new("create ring buffer"),
                "capacity must be greater than 0",
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RingState::default()),
                readable: Condvar::new(),
                writable: Condvar::new(),
                capacity,
                policy,
            }),
        })
    }

    /// Maximum retained blocks.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.inner.policy
    }

    /// Blocks currently retained.
    pub fn len(&self) -> usize {
        self.inner.state.lock().blocks.len()
    }

    /// True if no block is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks evicted to make room under the lossy policy.
    pub fn dropped_blocks(&self) -> u64 {
        self.inner.state.lock().dropped
    }

    /// Blocks ever accepted by `push`.
    pub fn total_pushed(&self) -> u64 {
        self.inner.state.lock().tail()
    }

    /// Registered cursors.
    pub fn cursor_count(&self) -> usize {
        self.inner.state.lock().cursors.len()
    }

    /// True once the stream has finished.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Append a block at the tail, applying the overflow policy when full.
    ///
    /// Sequence numbers must be strictly increasing. Under
    /// [`OverflowPolicy::Block`] a failed push inserts nothing.
    pub fn push(&self, block: Arc<SampleBlock>) -> Result<()> {
        let mut state = self.inner.state.lock();

        if state.closed {
            return Err(StreamError::validation(
                ErrorContext::new("push"),
                "ring buffer is closed",
            ));
        }
        if let Some(last) = state.last_sequence {
            if block.sequence() <= last {
                return Err(StreamError::validation(
                    ErrorContext::new("push"),
                    format!(
                        "sequence {} does not follow {}",
                        block.sequence(),
                        last
                    ),
                ));
            }
        }

        if state.blocks.len() >= self.inner.capacity {
            match self.inner.policy {
                OverflowPolicy::DropOldest => {
                    state.evict_front();
                    state.dropped += 1;
                    trace!(dropped = state.dropped, "Evicted oldest block");
                }
                OverflowPolicy::Block { timeout } => {
                    let deadline = Instant::now() + timeout;
                    while !state.front_consumed() {
                        if state.closed {
                            return Err(StreamError::validation(
                                ErrorContext::new("push"),
                                "ring buffer is closed",
                            ));
                        }
                        if state.interrupted {
                            return Err(StreamError::Overflow {
                                context: ErrorContext::new("push"),
                                timeout,
                            });
                        }
                        let result = self.inner.writable.wait_until(&mut state, deadline);
                        if result.timed_out() && !state.front_consumed() {
                            return Err(StreamError::Overflow {
                                context: ErrorContext::new("push"),
                                timeout,
                            });
                        }
                    }
                    state.evict_front();
                }
            }
        }

        state.last_sequence = Some(block.sequence());
        state.blocks.push_back(block);
        drop(state);
        self.inner.readable.notify_all();
        Ok(())
    }

    /// Register a cursor at the oldest retained block.
    pub fn cursor(&self) -> Cursor {
        let mut state = self.inner.state.lock();
        let position = state.base;
        self.register(&mut state, position)
    }

    /// Register a cursor that only sees blocks pushed from now on.
    pub fn cursor_from_tail(&self) -> Cursor {
        let mut state = self.inner.state.lock();
        let position = state.tail();
        self.register(&mut state, position)
    }

    fn register(&self, state: &mut RingState, position: u64) -> Cursor {
        let id = state.next_cursor_id;
        state.next_cursor_id += 1;
        state.cursors.insert(id, CursorState {
            position,
            missed: 0,
        });
        Cursor {
            ring: self.clone(),
            id,
        }
    }

    /// Next block at or after the cursor's position.
    pub fn pop_for(&self, cursor: &Cursor) -> CursorRead {
        let read = self.inner.state.lock().read(cursor.id);
        if matches!(read, CursorRead::Ready(_)) {
            self.inner.writable.notify_all();
        }
        read
    }

    /// All retained blocks, oldest first. Cursors are not touched.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        let blocks: Vec<Arc<SampleBlock>> = state.blocks.iter().cloned().collect();
        drop(state);
        let channels = blocks
            .first()
            .map(|b| Arc::clone(b.channel_set()))
            .unwrap_or_else(|| Arc::from(Vec::<String>::new()));
        Snapshot::new(channels, blocks)
    }

    /// Make blocked and later lossless pushes fail with `Overflow` at once
    /// instead of waiting out their timeout. The ring stays open.
    pub fn interrupt(&self) {
        self.inner.state.lock().interrupted = true;
        self.inner.writable.notify_all();
    }

    /// Mark the stream finished. Caught-up cursors then see `EndOfStream`
    /// and a blocked producer gives up.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.readable.notify_all();
        self.inner.writable.notify_all();
    }
}

/// A consumer's independent read position in a [`RingBuffer`].
///
/// Dropping the cursor unregisters it, so it no longer holds back a
/// lossless producer.
pub struct Cursor {
    ring: RingBuffer,
    id: u64,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("position", &self.position())
            .finish()
    }
}

impl Cursor {
    /// Non-blocking read.
    pub fn try_next(&self) -> CursorRead {
        self.ring.pop_for(self)
    }

    /// Wait up to `timeout` for the next block.
    pub fn next_timeout(&self, timeout: Duration) -> CursorRead {
        let deadline = Instant::now() + timeout;
        let inner = &self.ring.inner;
        let mut state = inner.state.lock();
        loop {
            match state.read(self.id) {
                CursorRead::NotYetAvailable => {
                    if inner.readable.wait_until(&mut state, deadline).timed_out() {
                        let read = state.read(self.id);
                        drop(state);
                        if matches!(read, CursorRead::Ready(_)) {
                            inner.writable.notify_all();
                        }
                        return read;
                    }
                }
                read => {
                    drop(state);
                    if matches!(read, CursorRead::Ready(_)) {
                        inner.writable.notify_all();
                    }
                    return read;
                }
            }
        }
    }

    /// Absolute index of the next unread block.
    pub fn position(&self) -> u64 {
        self.ring
            .inner
            .state
            .lock()
            .cursors
            .get(&self.id)
            .map(|c| c.position)
            .unwrap_or(0)
    }

    /// Blocks evicted before this cursor could read them.
    ///
    /// Lag is settled on read; blocks evicted since the last read are
    /// included too.
    pub fn missed(&self) -> u64 {
        let state = self.ring.inner.state.lock();
        state
            .cursors
            .get(&self.id)
            .map(|c| c.missed + state.base.saturating_sub(c.position))
            .unwrap_or(0)
    }

    /// Retained blocks this cursor has not read yet.
    pub fn pending(&self) -> usize {
        let state = self.ring.inner.state.lock();
        state
            .cursors
            .get(&self.id)
            .map(|c| state.tail().saturating_sub(c.position.max(state.base)) as usize)
            .unwrap_or(0)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.ring.inner.state.lock().cursors.remove(&self.id);
        self.ring.inner.writable.notify_all();
    }
}

/// A stable, read-only copy of the retained blocks.
#[derive(Debug, Clone)]
pub struct Snapshot {
    channels: Arc<[String]>,
    blocks: Vec<Arc<SampleBlock>>,
}

impl Snapshot {
    /// Snapshot over `blocks` labeled with `channels`.
    pub fn new(channels: Arc<[String]>, blocks: Vec<Arc<SampleBlock>>) -> Self {
        Self { channels, blocks }
    }

    /// Channel names for every block.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Blocks, oldest first.
    pub fn blocks(&self) -> &[Arc<SampleBlock>] {
        &self.blocks
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sequence numbers, oldest first.
    pub fn sequences(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.sequence()).collect()
    }

    pub(crate) fn channel_list(&self) -> Arc<[String]> {
        Arc::clone(&self.channels)
    }

    /// Relabel with the session's channel list; an empty snapshot
    /// otherwise has no channels to report.
    pub(crate) fn with_channels(mut self, channels: Arc<[String]>) -> Self {
        self.channels = channels;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn block(sequence: u64) -> Arc<SampleBlock> {
        Arc::new(
            SampleBlock::new(
                sequence,
                Instant::now(),
                Duration::from_millis(sequence),
                sequence as f64 / 1000.0,
                Arc::from(vec!["A0".to_string()]),
                vec![sequence as f64],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = RingBuffer::new(0, OverflowPolicy::DropOldest).unwrap_err();
        assert!(matches!(err, StreamError::Validation { .. }));
    }

    #[test]
    fn test_snapshot_under_capacity() {
        let ring = RingBuffer::new(8, OverflowPolicy::DropOldest).unwrap();
        for seq in 0..5 {
            ring.push(block(seq)).unwrap();
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.sequences(), vec![0, 1, 2, 3, 4]);
        assert_eq!(snapshot.channels(), &["A0".to_string()]);
        assert_eq!(ring.dropped_blocks(), 0);
    }

    #[test]
    fn test_drop_oldest_evicts_and_counts() {
        let ring = RingBuffer::new(3, OverflowPolicy::DropOldest).unwrap();
        for seq in 0..7 {
            ring.push(block(seq)).unwrap();
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.dropped_blocks(), 4);
        assert_eq!(ring.total_pushed(), 7);
        assert_eq!(ring.snapshot().sequences(), vec![4, 5, 6]);
    }

    #[test]
    fn test_sequence_must_increase() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        ring.push(block(5)).unwrap();
        assert!(ring.push(block(5)).is_err());
        assert!(ring.push(block(3)).is_err());
        ring.push(block(9)).unwrap();
        assert_eq!(ring.snapshot().sequences(), vec![5, 9]);
    }

    #[test]
    fn test_lagging_cursor_counts_missed() {
        let ring = RingBuffer::new(2, OverflowPolicy::DropOldest).unwrap();
        let cursor = ring.cursor();
        for seq in 0..5 {
            ring.push(block(seq)).unwrap();
        }
        assert_eq!(cursor.missed(), 3);
        let first = cursor.try_next().into_block().unwrap();
        assert_eq!(first.sequence(), 3);
        assert_eq!(cursor.missed(), 3);
        assert_eq!(cursor.try_next().into_block().unwrap().sequence(), 4);
        assert_eq!(cursor.try_next(), CursorRead::NotYetAvailable);
    }

    #[test]
    fn test_end_of_stream_after_close() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        let cursor = ring.cursor();
        ring.push(block(0)).unwrap();
        ring.close();
        assert!(matches!(cursor.try_next(), CursorRead::Ready(_)));
        assert_eq!(cursor.try_next(), CursorRead::EndOfStream);
        assert!(ring.push(block(1)).is_err());
    }

    #[test]
    fn test_cursor_from_tail_skips_history() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        ring.push(block(0)).unwrap();
        ring.push(block(1)).unwrap();
        let cursor = ring.cursor_from_tail();
        assert_eq!(cursor.pending(), 0);
        ring.push(block(2)).unwrap();
        assert_eq!(cursor.try_next().into_block().unwrap().sequence(), 2);
    }

    #[test]
    fn test_snapshot_does_not_move_cursors() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        let cursor = ring.cursor();
        ring.push(block(0)).unwrap();
        let _ = ring.snapshot();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.pending(), 1);
    }

    #[test]
    fn test_block_policy_times_out_without_insert() {
        let ring = RingBuffer::new(
            2,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(30),
            },
        )
        .unwrap();
        let _cursor = ring.cursor();
        ring.push(block(0)).unwrap();
        ring.push(block(1)).unwrap();

        let started = Instant::now();
        let err = ring.push(block(2)).unwrap_err();
        assert!(matches!(err, StreamError::Overflow { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(ring.snapshot().sequences(), vec![0, 1]);
        assert_eq!(ring.dropped_blocks(), 0);
    }

    #[test]
    fn test_block_policy_waits_for_cursor() {
        let ring = RingBuffer::new(
            2,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(2),
            },
        )
        .unwrap();
        let cursor = ring.cursor();
        ring.push(block(0)).unwrap();
        ring.push(block(1)).unwrap();

        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cursor.try_next().into_block().map(|b| b.sequence())
        });

        ring.push(block(2)).unwrap();
        assert_eq!(reader.join().unwrap(), Some(0));
        assert_eq!(ring.snapshot().sequences(), vec![1, 2]);
        assert_eq!(ring.dropped_blocks(), 0);
    }

    #[test]
    fn test_block_policy_without_cursors_overflows() {
        let ring = RingBuffer::new(
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(10),
            },
        )
        .unwrap();
        ring.push(block(0)).unwrap();
        assert!(matches!(
            ring.push(block(1)),
            Err(StreamError::Overflow { .. })
        ));
    }

    #[test]
    fn test_next_timeout_wakes_on_push() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        let cursor = ring.cursor();
        let producer = ring.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(block(0)).unwrap();
        });
        let read = cursor.next_timeout(Duration::from_secs(2));
        assert_eq!(read.into_block().map(|b| b.sequence()), Some(0));
        handle.join().unwrap();

        assert_eq!(
            cursor.next_timeout(Duration::from_millis(10)),
            CursorRead::NotYetAvailable
        );
    }

    #[test]
    fn test_dropping_cursor_unregisters() {
        let ring = RingBuffer::new(4, OverflowPolicy::DropOldest).unwrap();
        let a = ring.cursor();
        let b = ring.cursor();
        assert_eq!(ring.cursor_count(), 2);
        drop(a);
        assert_eq!(ring.cursor_count(), 1);
        drop(b);
        assert_eq!(ring.cursor_count(), 0);
    }

    #[test]
    fn test_interrupt_wakes_blocked_push() {
        let ring = RingBuffer::new(
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        let _idle = ring.cursor();
        ring.push(block(0)).unwrap();

        let producer = ring.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || producer.push(block(1)));
        thread::sleep(Duration::from_millis(50));
        ring.interrupt();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Overflow { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ring.snapshot().sequences(), vec![0]);
        assert!(!ring.is_closed());
    }
}
