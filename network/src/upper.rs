//! Interfaces to the layers above and around the driver.

use crate::error::IoctlError;
use crate::pbuf::Pbuf;
use crate::types::EthernetAddress;

/// The network stack sitting on top of the driver.
pub trait UpperLayer: Send + Sync {
    /// Called once at probe with the device MAC.
    fn attach(&self, mac: EthernetAddress);

    /// Deliver one reassembled receive packet. Called exactly once per
    /// frame, from the poll thread.
    fn input(&self, packet: Pbuf);

    /// Whether the interface is administratively running. The poll loop
    /// stops delivering when this goes false.
    fn is_running(&self) -> bool;

    /// Generic Ethernet ioctl fallback for commands the driver does not
    /// understand.
    fn ether_ioctl(&self, _cmd: u64) -> Result<(), IoctlError> {
        Err(IoctlError::Unsupported)
    }
}

/// Source of receive clusters.
///
/// Refill treats `None` as allocator exhaustion: the burst ends early and
/// the poll loop carries on with whatever is posted.
pub trait BufAllocator: Send + Sync {
    fn alloc_cluster(&self) -> Option<Pbuf>;
}

/// Allocator backed by the global heap; never reports exhaustion.
pub struct HeapAlloc;

impl BufAllocator for HeapAlloc {
    fn alloc_cluster(&self) -> Option<Pbuf> {
        Some(Pbuf::cluster())
    }
}
