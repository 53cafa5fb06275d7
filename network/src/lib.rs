//! Paravirtual NIC data plane.
//!
//! Binds to a split-I/O virtual network device (two paired descriptor
//! rings plus notification channels) and runs a non-blocking multi-producer
//! transmit path and a single-consumer receive path on top of it.
//!
//! # Architecture
//!
//! ```text
//!  xmit() on any CPU ──┬── fast path ───────────────┐
//!                      │                            ▼
//!                      └─▶ per-CPU SPSC ring ─▶ dispatcher ─▶ TX ring ─▶ host
//!                                   (timestamp-ordered drain)
//!
//!  host ─▶ RX ring ─▶ poll thread ─▶ reassembly/checksum ─▶ upper.input()
//! ```
//!
//! The hardware ring, the scheduler, the upper network stack and the
//! cluster allocator are collaborators behind traits ([`queue::VirtQueue`],
//! [`queue::NetDevice`], [`sched::Sched`], [`upper::UpperLayer`],
//! [`upper::BufAllocator`]); the embedding kernel provides them.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod driver;
pub mod error;
pub mod pbuf;
pub mod queue;
pub mod sched;
pub mod stats;
pub mod types;
pub mod upper;

pub(crate) mod pool;

pub use crate::driver::features::Features;
pub use crate::driver::{IoctlCmd, Net};
pub use crate::error::{IoctlError, ProbeError, TxError};
pub use crate::pbuf::Pbuf;
