//! Fixed-capacity frame buffer pool shared by the mirroring producer and the
//! snapshot consumer.
//!
//! ```text
//! producer thread                    consumer (capture_once)
//! ───────────────                    ───────────────────────
//! write_frame()                      acquire_latest()
//!   pick Free / oldest Committed       newest Committed → Acquired
//!   slot → Writing (lock released)     older Committed  → Free
//!   fill bytes                         ...
//!   slot → Committed (seq = n)       drop(PooledFrame) → Free
//! ```
//!
//! Bytes are moved out of a slot while it is written or held, so a reader
//! only ever sees a committed buffer. An acquired slot is never chosen by the
//! producer; when every slot is busy the incoming frame is dropped.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use mirrorsnap_core::RawFrame;

/// Layout of one frame as the producer wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameGeometry {
    pub row_stride_bytes:   u32,
    pub pixel_stride_bytes: u32,
    pub width:  u32,
    pub height: u32,
}

impl FrameGeometry {
    /// Tightly packed RGBA geometry with the given extra bytes per row.
    pub fn rgba(width: u32, height: u32, row_padding_bytes: u32) -> Self {
        Self {
            row_stride_bytes: width * 4 + row_padding_bytes,
            pixel_stride_bytes: 4,
            width,
            height,
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.row_stride_bytes as usize * self.height as usize
    }
}

/// Counters for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub committed:   u64,
    pub acquired:    u64,
    /// Committed frames replaced by a newer write before anyone read them.
    pub overwritten: u64,
    /// Committed frames skipped because a newer one was acquired.
    pub skipped:     u64,
    /// Incoming frames dropped because no slot was writable.
    pub dropped:     u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Committed,
    Acquired,
}

#[derive(Debug)]
struct Slot {
    state:    SlotState,
    buffer:   Vec<u8>,
    seq:      u64,
    geometry: FrameGeometry,
}

#[derive(Debug)]
struct PoolInner {
    slots:    Vec<Slot>,
    next_seq: u64,
    closed:   bool,
    stats:    PoolStats,
}

// ── FrameBufferPool ───────────────────────────────────────────────────────────

/// Cloneable handle to one pool. All clones refer to the same slots.
#[derive(Debug, Clone)]
pub struct FrameBufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl FrameBufferPool {
    /// Create a pool with `slots` buffers (at least one).
    pub fn new(slots: u32) -> Self {
        let slots = (0..slots.max(1))
            .map(|_| Slot {
                state: SlotState::Free,
                buffer: Vec::new(),
                seq: 0,
                geometry: FrameGeometry::default(),
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                slots,
                next_seq: 1,
                closed: false,
                stats: PoolStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write side of the pool, handed to the mirroring backend.
    pub fn producer(&self) -> FrameProducer {
        FrameProducer { pool: self.clone() }
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Newest committed frame, or `None` if nothing is committed yet or the
    /// pool has been closed.
    pub fn acquire_latest(&self) -> Option<PooledFrame> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }

        let (idx, seq) = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Committed)
            .map(|(i, s)| (i, s.seq))
            .max_by_key(|&(_, seq)| seq)?;

        let mut skipped = 0;
        for slot in inner.slots.iter_mut() {
            if slot.state == SlotState::Committed && slot.seq < seq {
                slot.state = SlotState::Free;
                skipped += 1;
            }
        }
        inner.stats.skipped += skipped;
        inner.stats.acquired += 1;

        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Acquired;
        let geometry = slot.geometry;
        let frame = RawFrame {
            pixel_buffer: std::mem::take(&mut slot.buffer),
            row_stride_bytes: geometry.row_stride_bytes,
            pixel_stride_bytes: geometry.pixel_stride_bytes,
            width: geometry.width,
            height: geometry.height,
        };

        Some(PooledFrame {
            frame,
            slot: idx,
            sequence: seq,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Return an acquired frame's slot to the pool.
    ///
    /// Dropping the frame has the same effect; this only makes the hand-back
    /// explicit at call sites.
    pub fn release(&self, frame: PooledFrame) {
        drop(frame);
    }

    /// Stop serving frames. Subsequent acquires return `None`, writes are
    /// discarded and released frames are not recycled.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for slot in inner.slots.iter_mut() {
            slot.state = SlotState::Free;
            slot.buffer = Vec::new();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }
}

// ── FrameProducer ─────────────────────────────────────────────────────────────

/// Write handle used by the mirroring subsystem, typically from its own thread.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    pool: FrameBufferPool,
}

impl FrameProducer {
    /// Write one frame of `geometry.buffer_len()` bytes, filled by `fill`.
    ///
    /// Returns `false` if the frame was dropped (pool closed or every slot
    /// busy). `fill` runs without the pool lock held.
    pub fn write_frame<F>(&self, geometry: FrameGeometry, fill: F) -> bool
    where
        F: FnOnce(&mut [u8]),
    {
        let len = geometry.buffer_len();
        let (idx, mut buffer) = {
            let mut inner = self.pool.lock();
            if inner.closed {
                return false;
            }
            let Some(idx) = pick_write_slot(&inner.slots) else {
                inner.stats.dropped += 1;
                return false;
            };
            if inner.slots[idx].state == SlotState::Committed {
                inner.stats.overwritten += 1;
            }
            let slot = &mut inner.slots[idx];
            slot.state = SlotState::Writing;
            (idx, std::mem::take(&mut slot.buffer))
        };

        buffer.resize(len, 0);
        fill(&mut buffer[..len]);

        let mut inner = self.pool.lock();
        if inner.closed {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.stats.committed += 1;
        let slot = &mut inner.slots[idx];
        slot.buffer = buffer;
        slot.geometry = geometry;
        slot.seq = seq;
        slot.state = SlotState::Committed;
        true
    }

    /// Copy an already-laid-out frame into the pool.
    ///
    /// `bytes` may be longer than the geometry requires (trailing bytes are
    /// ignored) or shorter (the rest of the slot is zeroed).
    pub fn commit_bytes(&self, geometry: FrameGeometry, bytes: &[u8]) -> bool {
        self.write_frame(geometry, |buf| {
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            buf[n..].fill(0);
        })
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// First free slot, else the oldest committed one. Acquired and in-flight
/// slots are never reused.
fn pick_write_slot(slots: &[Slot]) -> Option<usize> {
    if let Some(i) = slots.iter().position(|s| s.state == SlotState::Free) {
        return Some(i);
    }
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.state == SlotState::Committed)
        .min_by_key(|(_, s)| s.seq)
        .map(|(i, _)| i)
}

// ── PooledFrame ───────────────────────────────────────────────────────────────

/// A frame checked out of the pool. Its slot is returned exactly once, when
/// the frame is dropped (or passed to [`FrameBufferPool::release`]).
#[derive(Debug)]
pub struct PooledFrame {
    frame:    RawFrame,
    slot:     usize,
    sequence: u64,
    pool:     Weak<Mutex<PoolInner>>,
}

impl PooledFrame {
    /// Commit order of this frame within its pool.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Deref for PooledFrame {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        &self.frame
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        let Some(inner) = self.pool.upgrade() else { return };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return;
        }
        if let Some(slot) = inner.slots.get_mut(self.slot) {
            if slot.state == SlotState::Acquired {
                slot.buffer = std::mem::take(&mut self.frame.pixel_buffer);
                slot.state = SlotState::Free;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_value(producer: &FrameProducer, value: u8) -> bool {
        producer.write_frame(FrameGeometry::rgba(2, 2, 0), |buf| buf.fill(value))
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = FrameBufferPool::new(2);
        assert!(pool.acquire_latest().is_none());
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn newest_frame_wins_and_older_are_skipped() {
        let pool = FrameBufferPool::new(3);
        let producer = pool.producer();
        assert!(commit_value(&producer, 1));
        assert!(commit_value(&producer, 2));
        assert!(commit_value(&producer, 3));

        let frame = pool.acquire_latest().expect("frame");
        assert!(frame.pixel_buffer.iter().all(|&b| b == 3));
        assert_eq!(frame.width, 2);
        assert_eq!(frame.row_stride_bytes, 8);
        pool.release(frame);

        // Older frames were discarded by the previous acquire.
        assert!(pool.acquire_latest().is_none());
        let stats = pool.stats();
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.acquired, 1);
    }

    #[test]
    fn producer_overwrites_oldest_committed_slot() {
        let pool = FrameBufferPool::new(2);
        let producer = pool.producer();
        for v in 1..=5 {
            assert!(commit_value(&producer, v));
        }
        let frame = pool.acquire_latest().unwrap();
        assert!(frame.pixel_buffer.iter().all(|&b| b == 5));
        assert_eq!(pool.stats().overwritten, 3);
    }

    #[test]
    fn acquired_slot_is_never_overwritten() {
        let pool = FrameBufferPool::new(1);
        let producer = pool.producer();
        assert!(commit_value(&producer, 9));
        let held = pool.acquire_latest().unwrap();

        // The only slot is held by the consumer: the write is dropped.
        assert!(!commit_value(&producer, 10));
        assert!(held.pixel_buffer.iter().all(|&b| b == 9));
        assert_eq!(pool.stats().dropped, 1);

        drop(held);
        assert!(commit_value(&producer, 11));
        let next = pool.acquire_latest().unwrap();
        assert!(next.pixel_buffer.iter().all(|&b| b == 11));
    }

    #[test]
    fn release_recycles_the_slot() {
        let pool = FrameBufferPool::new(2);
        let producer = pool.producer();
        for round in 0..10u8 {
            assert!(commit_value(&producer, round));
            let f = pool.acquire_latest().expect("frame each round");
            assert_eq!(f.pixel_buffer[0], round);
            pool.release(f);
        }
        assert_eq!(pool.stats().dropped, 0);
    }

    #[test]
    fn closed_pool_yields_none_and_rejects_writes() {
        let pool = FrameBufferPool::new(2);
        let producer = pool.producer();
        assert!(commit_value(&producer, 1));
        let held = pool.acquire_latest().unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert!(producer.is_closed());
        assert!(pool.acquire_latest().is_none());
        assert!(!commit_value(&producer, 2));

        // Releasing after close is harmless and the frame still owns its bytes.
        assert_eq!(held.pixel_buffer.len(), 16);
        drop(held);
        assert!(pool.acquire_latest().is_none());
    }

    #[test]
    fn commit_bytes_pads_short_input() {
        let pool = FrameBufferPool::new(2);
        let producer = pool.producer();
        assert!(producer.commit_bytes(FrameGeometry::rgba(2, 1, 0), &[7, 7, 7]));
        let f = pool.acquire_latest().unwrap();
        assert_eq!(f.pixel_buffer, vec![7, 7, 7, 0, 0, 0, 0, 0]);
        assert_eq!(f.sequence(), 1);
    }

    #[test]
    fn concurrent_writes_are_never_torn() {
        let pool = FrameBufferPool::new(2);
        let producer = pool.producer();
        let writer = std::thread::spawn(move || {
            for v in 0..2_000u32 {
                let value = (v % 251) as u8;
                producer.write_frame(FrameGeometry::rgba(64, 64, 16), |buf| buf.fill(value));
            }
        });

        let mut seen = 0;
        while !writer.is_finished() || seen == 0 {
            if let Some(frame) = pool.acquire_latest() {
                let first = frame.pixel_buffer[0];
                assert!(frame.pixel_buffer.iter().all(|&b| b == first), "torn frame");
                seen += 1;
            }
        }
        writer.join().unwrap();
        assert!(seen > 0);
    }
}
