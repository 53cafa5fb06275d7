//! Timestamp-ordered N-way merge over independent streams.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

/// A stream of elements whose timestamps are non-decreasing.
///
/// Methods take `&self`: stream implementations are expected to be consumed
/// from exactly one thread (the merger's owner) while other threads feed
/// them.
pub trait OrderedStream {
    type Item;

    /// Timestamp of the front element, if any.
    fn peek_ts(&self) -> Option<i64>;

    /// Remove and return the front element.
    fn pop(&self) -> Option<Self::Item>;
}

/// Draining merge iterator over N ordered streams.
///
/// Holds a binary heap keyed by `(front timestamp, stream index)`, so equal
/// timestamps resolve by stream index, which is stable for any given stream.
/// After
/// an element is taken, only the winning stream is re-examined; streams
/// whose front vanished rejoin the heap on the next full rescan.
///
/// The `idle` predicate decides when an empty scan is final: if it reports
/// pending work, the merger rescans once more before giving up, catching
/// elements published between the scan and the caller's pending flag.
pub struct NwayMerger<'a, S: OrderedStream, P: Fn() -> bool> {
    streams: Vec<&'a S>,
    heap: BinaryHeap<Reverse<(i64, usize)>>,
    idle: P,
}

impl<'a, S: OrderedStream, P: Fn() -> bool> NwayMerger<'a, S, P> {
    pub fn new(streams: Vec<&'a S>, idle: P) -> Self {
        let mut merger = Self {
            heap: BinaryHeap::with_capacity(streams.len()),
            streams,
            idle,
        };
        merger.rescan();
        merger
    }

    /// Rebuild the heap from every stream's current front. Returns whether
    /// anything was found.
    fn rescan(&mut self) -> bool {
        self.heap.clear();
        for (idx, stream) in self.streams.iter().enumerate() {
            if let Some(ts) = stream.peek_ts() {
                self.heap.push(Reverse((ts, idx)));
            }
        }
        !self.heap.is_empty()
    }

    /// Pop from whichever staged stream currently has the earliest front.
    fn pop_staged(&mut self) -> Option<S::Item> {
        while let Some(Reverse((_, idx))) = self.heap.pop() {
            let stream = self.streams[idx];
            if let Some(item) = stream.pop() {
                if let Some(ts) = stream.peek_ts() {
                    self.heap.push(Reverse((ts, idx)));
                }
                return Some(item);
            }
        }
        None
    }

    /// Yield the element with the smallest timestamp across all streams.
    ///
    /// Returns `None` once every stream is empty and the idle predicate
    /// holds (or a post-signal rescan still finds nothing).
    pub fn pop(&mut self) -> Option<S::Item> {
        loop {
            if let Some(item) = self.pop_staged() {
                return Some(item);
            }
            if self.rescan() {
                continue;
            }
            if (self.idle)() {
                return None;
            }
            // Work was signalled; it is either visible to one more scan or
            // was already drained this round.
            if !self.rescan() {
                return None;
            }
        }
    }
}
