//! Scheduler collaborator interface.
//!
//! The driver never owns threads or timing; it asks the embedding kernel
//! for them through [`Sched`]. The trait is object-safe so driver state can
//! hold a `&'static dyn Sched` without infecting every type with a
//! scheduler parameter.
//!
//! `park`/`unpark` carry a wake token exactly like `std::thread`: an unpark
//! delivered before the park makes the park return immediately, so a
//! checked-predicate-then-park loop cannot lose a wake-up.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Opaque handle naming a thread to the scheduler. The meaning of the inner
/// value belongs to the `Sched` implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHandle(pub u64);

/// Scheduling services the data plane depends on.
pub trait Sched: Sync {
    /// Number of CPUs; per-CPU state is sized from this.
    fn cpu_count(&self) -> usize;

    /// CPU the calling thread currently runs on. Only stable while
    /// preemption is disabled.
    fn current_cpu(&self) -> usize;

    fn preempt_disable(&self);
    fn preempt_enable(&self);

    /// Monotonic timestamp in nanoseconds.
    fn now(&self) -> i64;

    /// Handle for the calling thread.
    fn current(&self) -> ThreadHandle;

    /// Spawn a named kernel thread running `f`.
    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send + 'static>) -> ThreadHandle;

    /// Block the calling thread until unparked. May return spuriously;
    /// callers loop around a predicate.
    fn park(&self);

    /// Wake the named thread (or arm its next park).
    fn unpark(&self, thread: &ThreadHandle);
}

/// One blocked waiter. Records are heap nodes owned by whatever list they
/// were published on, so the waiter can return as soon as it is woken; no
/// one holds a reference into its stack.
pub struct WaitRecord {
    thread: ThreadHandle,
    woken: AtomicBool,
}

impl WaitRecord {
    pub fn new(sched: &dyn Sched) -> Self {
        Self {
            thread: sched.current(),
            woken: AtomicBool::new(false),
        }
    }

    /// Wake the owning thread. Idempotent.
    pub fn wake(&self, sched: &dyn Sched) {
        self.woken.store(true, Ordering::Release);
        sched.unpark(&self.thread);
    }

    /// Block until [`wake`](Self::wake) is called. Must run on the thread
    /// that created the record.
    pub fn wait(&self, sched: &dyn Sched) {
        while !self.woken.load(Ordering::Acquire) {
            sched.park();
        }
    }
}

/// Exclusive-use token over a shared resource, with the data it guards.
///
/// This is not a mutex: the holder may keep it across blocking waits (the
/// dispatcher holds it while waiting for ring completions), and non-holders
/// either bail out (`try_lock`, the transmit fast path) or sleep until the
/// release wakes them (`lock`, the dispatcher).
pub struct TokenLock<T> {
    taken: AtomicBool,
    waiters: spin::Mutex<Vec<Arc<WaitRecord>>>,
    sched: &'static dyn Sched,
    value: UnsafeCell<T>,
}

// SAFETY: `value` is only reachable through a guard, and the `taken` flag
// admits one guard at a time.
unsafe impl<T: Send> Send for TokenLock<T> {}
unsafe impl<T: Send> Sync for TokenLock<T> {}

pub struct TokenGuard<'a, T> {
    lock: &'a TokenLock<T>,
}

impl<T> TokenLock<T> {
    pub fn new(value: T, sched: &'static dyn Sched) -> Self {
        Self {
            taken: AtomicBool::new(false),
            waiters: spin::Mutex::new(Vec::new()),
            sched,
            value: UnsafeCell::new(value),
        }
    }

    /// Try to take the token without blocking.
    pub fn try_lock(&self) -> Option<TokenGuard<'_, T>> {
        if self
            .taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(TokenGuard { lock: self })
        } else {
            None
        }
    }

    /// Take the token, sleeping until the current holder releases it.
    pub fn lock(&self) -> TokenGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            let record = Arc::new(WaitRecord::new(self.sched));
            self.waiters.lock().push(record.clone());
            // The holder may have released between the failed attempt and
            // the registration; retry before sleeping.
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            record.wait(self.sched);
        }
    }
}

impl<T> Deref for TokenGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the token.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TokenGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the token.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TokenGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.taken.store(false, Ordering::Release);
        let mut waiters = self.lock.waiters.lock();
        for record in waiters.drain(..) {
            record.wake(self.lock.sched);
        }
    }
}
