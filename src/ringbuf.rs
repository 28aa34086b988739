//! Lock-free trace ring buffer.
//!
//! Multi-producer, single-consumer byte channel from probe context to user
//! space. Storage is a power-of-two array of 8-byte words; each record is one
//! header word (`len`, or [`BUSY`] while unpublished) followed by the payload
//! padded to a word boundary.
//!
//! Producers reserve space by advancing the producer cursor with a single
//! compare-and-exchange, copy their payload, then publish the header with
//! release ordering. They never block, never allocate, and never write a
//! partial record: if the reservation does not fit, the record is dropped and
//! [`RingBuffer::dropped`] increments.
//!
//! The consumer walks records from the consumer cursor, stops at the first
//! unpublished header, and resets consumed words to [`BUSY`] before handing
//! the space back, so a reserved-but-unpublished slot can never be mistaken
//! for a stale record from an earlier lap.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

/// Smallest accepted capacity in bytes.
pub const MIN_CAPACITY: usize = 64;

/// Size of the per-record header word.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Header value of a slot that has not been published.
const BUSY: u64 = 1 << 63;

const LEN_MASK: u64 = u32::MAX as u64;

/// Bytes a record of `len` payload bytes occupies in the ring.
pub const fn record_footprint(len: usize) -> usize {
    RECORD_HEADER_SIZE + len.div_ceil(8) * 8
}

/// Errors returned when creating a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufError {
    /// Capacity is not a power of two.
    NotPowerOfTwo(usize),
    /// Capacity is below [`MIN_CAPACITY`].
    TooSmall(usize),
}

impl fmt::Display for RingBufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPowerOfTwo(cap) => {
                write!(f, "RingBuf capacity must be a power of two, got {}", cap)
            }
            Self::TooSmall(cap) => write!(
                f,
                "RingBuf capacity must be at least {} bytes, got {}",
                MIN_CAPACITY, cap
            ),
        }
    }
}

impl core::error::Error for RingBufError {}

/// Destination for encoded events emitted by probes.
pub trait EventSink: Sync {
    /// Write one record atomically; `false` if it was dropped.
    fn try_write(&self, record: &[u8]) -> bool;
}

/// Fixed-capacity trace ring buffer.
pub struct RingBuffer {
    words: Box<[AtomicU64]>,
    word_mask: u64,
    capacity: usize,
    producer: AtomicU64,
    consumer: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    reader: Mutex<()>,
}

impl RingBuffer {
    /// Create a ring buffer of `capacity` bytes.
    ///
    /// This is the only allocation the buffer ever makes.
    pub fn new(capacity: usize) -> Result<Self, RingBufError> {
        if !capacity.is_power_of_two() {
            return Err(RingBufError::NotPowerOfTwo(capacity));
        }
        if capacity < MIN_CAPACITY {
            return Err(RingBufError::TooSmall(capacity));
        }

        let nr_words = capacity / 8;
        let words: Vec<AtomicU64> = (0..nr_words).map(|_| AtomicU64::new(BUSY)).collect();

        log::debug!("RingBuf created: {} bytes", capacity);

        Ok(Self {
            words: words.into_boxed_slice(),
            word_mask: nr_words as u64 - 1,
            capacity,
            producer: AtomicU64::new(0),
            consumer: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            reader: Mutex::new(()),
        })
    }

    #[inline]
    fn word(&self, pos: u64) -> &AtomicU64 {
        &self.words[((pos / 8) & self.word_mask) as usize]
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records dropped for lack of space.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of records successfully written.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Bytes reserved by producers and not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        let prod = self.producer.load(Ordering::Acquire);
        let cons = self.consumer.load(Ordering::Acquire);
        prod.saturating_sub(cons) as usize
    }

    fn drop_record(&self) -> bool {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Write `record` as one atomic record.
    ///
    /// Returns `false` and bumps the drop counter when the remaining space
    /// cannot hold the whole record.
    pub fn try_write(&self, record: &[u8]) -> bool {
        let need = record_footprint(record.len());
        if need > self.capacity || record.len() as u64 > LEN_MASK {
            return self.drop_record();
        }
        let need = need as u64;

        let mut prod = self.producer.load(Ordering::Relaxed);
        loop {
            let cons = self.consumer.load(Ordering::Acquire);
            if prod.saturating_sub(cons) + need > self.capacity as u64 {
                return self.drop_record();
            }
            match self.producer.compare_exchange_weak(
                prod,
                prod + need,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => prod = current,
            }
        }

        let mut pos = prod + RECORD_HEADER_SIZE as u64;
        for chunk in record.chunks(8) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            self.word(pos).store(u64::from_le_bytes(raw), Ordering::Relaxed);
            pos += 8;
        }

        // Publishing the header makes the whole record visible at once.
        self.word(prod).store(record.len() as u64, Ordering::Release);
        self.written.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drain published records.
    ///
    /// The returned iterator stops at the producer cursor observed now, or at
    /// the first record still being written, whichever comes first. Call again
    /// to pick up later records. Concurrent readers are serialized.
    pub fn read(&self) -> Records<'_> {
        let guard = self.reader.lock();
        Records {
            ring: self,
            limit: self.producer.load(Ordering::Acquire),
            _guard: guard,
        }
    }

    /// Like [`RingBuffer::read`], but returns `None` instead of waiting for
    /// another reader.
    pub fn try_read(&self) -> Option<Records<'_>> {
        let guard = self.reader.try_lock()?;
        Some(Records {
            ring: self,
            limit: self.producer.load(Ordering::Acquire),
            _guard: guard,
        })
    }
}

impl EventSink for RingBuffer {
    fn try_write(&self, record: &[u8]) -> bool {
        RingBuffer::try_write(self, record)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("pending_bytes", &self.pending_bytes())
            .field("written", &self.written())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Lazy sequence of records returned by [`RingBuffer::read`].
pub struct Records<'a> {
    ring: &'a RingBuffer,
    limit: u64,
    _guard: MutexGuard<'a, ()>,
}

impl Iterator for Records<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let ring = self.ring;
        let cons = ring.consumer.load(Ordering::Relaxed);
        if cons >= self.limit {
            return None;
        }

        let header = ring.word(cons).load(Ordering::Acquire);
        if header & BUSY != 0 {
            return None;
        }

        let len = (header & LEN_MASK) as usize;
        let mut record = Vec::with_capacity(len);
        let mut pos = cons + RECORD_HEADER_SIZE as u64;
        while record.len() < len {
            let raw = ring.word(pos).load(Ordering::Relaxed).to_le_bytes();
            let take = (len - record.len()).min(8);
            record.extend_from_slice(&raw[..take]);
            pos += 8;
        }

        let end = cons + record_footprint(len) as u64;
        let mut pos = cons;
        while pos < end {
            ring.word(pos).store(BUSY, Ordering::Relaxed);
            pos += 8;
        }
        ring.consumer.store(end, Ordering::Release);

        Some(record)
    }
}
