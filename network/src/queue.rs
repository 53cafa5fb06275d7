//! Hardware-ring transport interface.
//!
//! The split-I/O descriptor ring itself (available/used index pair,
//! doorbell, interrupt masking) lives outside the data plane; the driver
//! only consumes the operations below. A request is built as a
//! scatter-gather vector, then published as one descriptor chain tagged
//! with a caller-chosen token. Completions hand the tokens back.
//!
//! Contract notes:
//!
//! - The staged scatter-gather vector survives a failed
//!   [`try_add_buf`](VirtQueue::try_add_buf) and any number of completion
//!   calls; it is only reset by the next [`init_sg`](VirtQueue::init_sg).
//!   The blocking transmit path relies on this to retry a publish after
//!   reclaiming descriptors.
//! - Fragment addresses are raw because they describe DMA: the driver
//!   guarantees each address stays valid until the chain's completion is
//!   finalized.

use crate::error::ProbeError;
use crate::sched::ThreadHandle;
use crate::types::EthernetAddress;

/// One side of the split ring pair (receive or transmit).
pub trait VirtQueue: Send {
    /// Descriptor-ring capacity.
    fn size(&self) -> u16;

    /// Opt in or out of indirect descriptors for subsequent chains.
    fn set_indirect(&mut self, enable: bool);

    /// Begin a new scatter-gather vector, discarding any staged one.
    fn init_sg(&mut self);

    /// Append a driver-to-host fragment.
    fn add_out(&mut self, addr: *const u8, len: usize);

    /// Append a host-to-driver fragment.
    fn add_in(&mut self, addr: *mut u8, len: usize);

    /// Number of fragments staged so far.
    fn sg_len(&self) -> usize;

    /// Publish the staged vector as one descriptor chain tagged `token`.
    /// Fails (without blocking or clearing the vector) when the available
    /// ring lacks room.
    fn try_add_buf(&mut self, token: u64) -> bool;

    /// Dequeue one completion: the token of a returned chain plus the byte
    /// count the host wrote. Descriptors stay occupied until finalized.
    fn get_buf_elem(&mut self, len: &mut u32) -> Option<u64>;

    /// Release the descriptors of the first `count` unfinalized completions
    /// back to the ring.
    fn get_buf_finalize(&mut self, count: u16);

    /// Whether the host has unconsumed completions.
    fn used_ring_not_empty(&self) -> bool;

    /// Whether the available ring can take a chain of `frags` fragments.
    fn avail_ring_has_room(&self, frags: usize) -> bool;

    /// Whether the posted-buffer level has dropped enough to refill.
    fn refill_needed(&self) -> bool;

    /// Ring the doorbell. Returns whether the host actually needed the
    /// notification.
    fn kick(&mut self) -> bool;

    /// Mask this queue's interrupt source.
    fn disable_interrupts(&mut self);

    /// Block until the used ring is non-empty. The caller may hold the
    /// transmit token across this wait.
    fn wait_for_used(&mut self);
}

/// The bound device: configuration space, feature negotiation and queue
/// handout.
pub trait NetDevice {
    type Queue: VirtQueue;

    /// Feature bits the device advertises.
    fn device_features(&self) -> u64;

    /// Commit the driver's accepted feature subset. An error is fatal to
    /// the probe and leaves the device unbound.
    fn ack_features(&mut self, features: u64) -> Result<(), ProbeError>;

    /// MAC address from the device config.
    fn mac(&self) -> EthernetAddress;

    /// Hand out queue `idx` (0 = receive, 1 = transmit).
    fn take_queue(&mut self, idx: u16) -> Result<Self::Queue, ProbeError>;

    /// Route queue `idx`'s interrupt to wake `thread`. The handler masks
    /// its own source and wakes the thread; it never touches the ring.
    fn bind_irq(&mut self, idx: u16, thread: ThreadHandle);

    /// Advertise DRIVER_OK: negotiation done, rings populated.
    fn set_driver_ok(&mut self);
}
