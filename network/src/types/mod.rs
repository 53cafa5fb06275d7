//! Wire-level types shared across the driver.

pub mod ethernet;
pub mod net_hdr;

pub use ethernet::EthernetAddress;
pub use net_hdr::NetHdr;
