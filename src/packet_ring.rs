//! Single-producer / single-consumer ring between a traffic thread and
//! the reporter.
//!
//! The traffic thread owns the producer cursor and the slots it fills;
//! the reporter owns the consumer cursor. Both cursors are word-sized
//! atomics so neither side ever observes a torn value; a stale read only
//! causes a spurious full/empty observation that resolves on the next
//! check. The producer blocks when the ring is full — records are never
//! dropped or overwritten.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Slots per ring.
pub const RING_CAPACITY: usize = 5000;

/// How long a parked thread sleeps before re-checking cursors. Signals
/// normally arrive well before this; the timeout covers a signal lost to
/// the check-then-park race.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// A condition variable with a lock, shared by address.
///
/// The reporter exposes one of these as its wake condition; every ring
/// signals it when records become available.
#[derive(Default)]
pub struct Condition {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Condition {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Park until signaled or the timeout lapses. Spurious wakeups are
    /// fine; callers re-check their predicate.
    pub fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        let _ = self.cond.wait_for(&mut guard, timeout);
    }
}

/// Bounded SPSC FIFO of capacity [`RING_CAPACITY`].
///
/// # Examples
///
/// ```
/// use rperf2::packet_ring::{Condition, PacketRing};
///
/// let wake = Condition::new();
/// let ring: PacketRing<u64> = PacketRing::new(wake);
/// ring.enqueue(7);
/// assert_eq!(ring.dequeue(), Some(7));
/// assert_eq!(ring.dequeue(), None);
/// ```
pub struct PacketRing<T> {
    producer: AtomicUsize,
    consumer: AtomicUsize,
    consumer_done: AtomicBool,
    /// Times the producer had to park on a full ring; a high value flags a
    /// CPU-bound reporter.
    await_counter: AtomicU64,
    slots: Box<[UnsafeCell<T>]>,
    /// Producer parks here when full; the consumer signals after draining.
    await_consumer: Condition,
    /// The reporter's wake condition, signaled on the was-empty edge.
    awake_consumer: Arc<Condition>,
}

// One thread writes each slot before publishing it through a release store
// of `producer`; the consumer reads it only after the matching acquire
// load. Cursor ownership is exclusive per role.
unsafe impl<T: Send> Send for PacketRing<T> {}
unsafe impl<T: Send> Sync for PacketRing<T> {}

impl<T: Copy + Default> PacketRing<T> {
    pub fn new(awake_consumer: Arc<Condition>) -> Self {
        Self::with_capacity(RING_CAPACITY, awake_consumer)
    }

    pub fn with_capacity(capacity: usize, awake_consumer: Arc<Condition>) -> Self {
        let slots = (0..capacity.max(2))
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            producer: AtomicUsize::new(0),
            consumer: AtomicUsize::new(0),
            consumer_done: AtomicBool::new(false),
            await_counter: AtomicU64::new(0),
            slots,
            await_consumer: Condition::default(),
            awake_consumer,
        }
    }

    fn next(&self, cursor: usize) -> usize {
        (cursor + 1) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producer.load(Ordering::Acquire) == self.consumer.load(Ordering::Acquire)
    }

    /// Producer side. Blocks while the ring is full; never drops.
    pub fn enqueue(&self, record: T) {
        loop {
            let p = self.producer.load(Ordering::Relaxed);
            let c = self.consumer.load(Ordering::Acquire);
            if self.next(p) == c {
                // Full. Kick the consumer and park until it advances.
                self.await_counter.fetch_add(1, Ordering::Relaxed);
                self.awake_consumer.signal();
                self.await_consumer.wait(PARK_TIMEOUT);
                continue;
            }
            let was_empty = p == c;
            // Safety: the producer exclusively owns slot `p` until the
            // release store below publishes it.
            unsafe {
                *self.slots[p].get() = record;
            }
            self.producer.store(self.next(p), Ordering::Release);
            if was_empty {
                self.awake_consumer.signal();
            }
            return;
        }
    }

    /// Consumer side. Non-blocking; `None` when the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let c = self.consumer.load(Ordering::Relaxed);
        let p = self.producer.load(Ordering::Acquire);
        if p == c {
            return None;
        }
        // Safety: the slot was published by the producer's release store
        // and the consumer owns it until the cursor advances.
        let record = unsafe { *self.slots[c].get() };
        let was_full = self.next(p) == c;
        self.consumer.store(self.next(c), Ordering::Release);
        if was_full {
            self.await_consumer.signal();
        }
        Some(record)
    }

    /// Set by the consumer once the producer has closed and the ring has
    /// drained; releases a producer parked in [`PacketRing::await_done`].
    pub fn mark_consumer_done(&self) {
        self.consumer_done.store(true, Ordering::Release);
        self.await_consumer.signal();
    }

    pub fn consumer_done(&self) -> bool {
        self.consumer_done.load(Ordering::Acquire)
    }

    /// Producer side: park until the consumer has drained everything and
    /// emitted the final report.
    pub fn await_done(&self) {
        while !self.consumer_done() {
            self.awake_consumer.signal();
            self.await_consumer.wait(PARK_TIMEOUT);
        }
    }

    pub fn await_count(&self) -> u64 {
        self.await_counter.load(Ordering::Relaxed)
    }
}
