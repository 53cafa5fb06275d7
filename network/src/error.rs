//! Driver error types.

use core::fmt;

/// Transmit-path errors surfaced to the upper layer.
///
/// Ring exhaustion is never an error: packets that do not fit are staged or
/// waited on, so `xmit` only fails for packets that cannot be sent at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The packet is malformed with respect to the requested offloads
    /// (EINVAL in the ifnet contract). The packet has been freed.
    InvalidPacket,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacket => write!(f, "malformed packet dropped during offload"),
        }
    }
}

/// Probe-time failures. All of these leave the device unbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The device rejected the negotiated feature set.
    FeatureNegotiation,
    /// A required queue could not be obtained from the transport.
    QueueUnavailable(u16),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureNegotiation => write!(f, "feature negotiation failed"),
            Self::QueueUnavailable(idx) => write!(f, "virtqueue {} unavailable", idx),
        }
    }
}

/// Errors from the ioctl surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlError {
    /// Neither the driver nor the generic Ethernet handler knows the command.
    Unsupported,
    /// The argument is out of range (e.g. an absurd MTU).
    InvalidArgument,
}

impl fmt::Display for IoctlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "unsupported ioctl"),
            Self::InvalidArgument => write!(f, "invalid ioctl argument"),
        }
    }
}
