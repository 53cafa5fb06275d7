//! Bounded single-producer / single-consumer lock-free ring.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

/// Pads a counter out to its own cache line so the producer and consumer
/// indices never share one.
#[repr(align(64))]
struct CacheAligned<T>(T);

/// SPSC ring of fixed power-of-two capacity.
///
/// Two monotonic 32-bit counters track the ring state: `head` is only
/// written by the producer, `tail` only by the consumer. The ring is full
/// when `head - tail == capacity` and empty when they are equal; the
/// counters wrap freely and are masked on slot access.
///
/// All operations take `&self`; the single-producer/single-consumer
/// discipline is a caller contract, not something the type system enforces.
/// Exactly one thread may call [`push`](RingSpsc::push) and exactly one
/// thread may call [`pop`](RingSpsc::pop)/[`front`](RingSpsc::front) at any
/// point in time.
pub struct RingSpsc<T> {
    head: CacheAligned<AtomicU32>,
    tail: CacheAligned<AtomicU32>,
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slot accesses are ordered by the acquire/release counter protocol;
// a slot is touched by at most one side at a time.
unsafe impl<T: Send> Send for RingSpsc<T> {}
unsafe impl<T: Send> Sync for RingSpsc<T> {}

impl<T> RingSpsc<T> {
    /// Create a ring with the given capacity (must be a power of two).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        assert!(capacity <= (u32::MAX as usize) / 2, "ring capacity too large");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            head: CacheAligned(AtomicU32::new(0)),
            tail: CacheAligned(AtomicU32::new(0)),
            mask: (capacity - 1) as u32,
            slots: slots.into_boxed_slice(),
        }
    }

    /// Producer side: append one element.
    ///
    /// Fails and hands the element back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) > self.mask {
            return Err(value);
        }

        // SAFETY: the slot at `head` is outside the occupied window, so the
        // consumer will not touch it until the release store below.
        unsafe {
            (*self.slots[(head & self.mask) as usize].get()).write(value);
        }
        self.head.0.store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Consumer side: remove the oldest element.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: head != tail, so the slot at `tail` holds an initialized
        // value published by the producer's release store.
        let value = unsafe {
            (*self.slots[(tail & self.mask) as usize].get()).assume_init_read()
        };
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);

        Some(value)
    }

    /// Consumer side: peek at the oldest element without removing it.
    ///
    /// The reference is only valid as long as the consumer does not `pop`;
    /// like `pop`, this must only be called from the consumer thread.
    pub fn front(&self) -> Option<&T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: same argument as `pop`; the producer never writes an
        // occupied slot and only the consumer advances `tail`.
        Some(unsafe { (*self.slots[(tail & self.mask) as usize].get()).assume_init_ref() })
    }

    /// Number of elements currently queued. Approximate when racing the
    /// other side.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }
}

impl<T> Drop for RingSpsc<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
