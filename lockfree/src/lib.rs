//! Lock-free building blocks for the data plane.
//!
//! Two primitives live here:
//!
//! - [`RingSpsc`]: a bounded single-producer/single-consumer ring of plain
//!   values. Wait-free, allocation-free after construction.
//! - [`NwayMerger`]: a draining iterator over N timestamp-ordered streams
//!   that always yields the entry with the smallest timestamp.
//!
//! Neither primitive retries internally; callers decide what a failed push
//! or an empty pop means.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod merger;
pub mod ring;

pub use merger::{NwayMerger, OrderedStream};
pub use ring::RingSpsc;
