//! Per-queue statistics.
//!
//! Counters are atomics because the fast path, the dispatcher and the poll
//! thread each bump their own while `fill_stats` reads from anywhere;
//! snapshots may be torn between fields.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct RxqStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_drops: AtomicU64,
    /// Packets whose offloaded checksum validated.
    pub rx_csum: AtomicU64,
    /// Packets whose offloaded checksum did not validate.
    pub rx_csum_err: AtomicU64,
}

#[derive(Default)]
pub struct TxqStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// Broken packets dropped during offload preparation.
    pub tx_err: AtomicU64,
    /// Staged packets invalidated by a flush.
    pub tx_drops: AtomicU64,
    /// Checksum-offload requests.
    pub tx_csum: AtomicU64,
    /// TSO packets.
    pub tx_tso: AtomicU64,
    /// Doorbells issued.
    pub tx_kicks: AtomicU64,
    /// Doorbells the host actually needed.
    pub tx_hv_kicks: AtomicU64,
    /// Packets sent via the dispatcher path.
    pub tx_pkts_from_disp: AtomicU64,
    /// Times the dispatcher was woken from its sleep.
    pub tx_disp_wakeups: AtomicU64,
}

/// Interface-level counters in the slots the upper layer expects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IfData {
    pub input_packets: u64,
    pub input_bytes: u64,
    pub input_drops: u64,
    pub input_errors: u64,
    pub output_packets: u64,
    pub output_bytes: u64,
    pub output_errors: u64,
}

/// Plain-value snapshot of the transmit counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxqSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_err: u64,
    pub tx_drops: u64,
    pub tx_csum: u64,
    pub tx_tso: u64,
    pub tx_kicks: u64,
    pub tx_hv_kicks: u64,
    pub tx_pkts_from_disp: u64,
    pub tx_disp_wakeups: u64,
}

/// Plain-value snapshot of the receive counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RxqSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_drops: u64,
    pub rx_csum: u64,
    pub rx_csum_err: u64,
}

impl TxqStats {
    pub fn snapshot(&self) -> TxqSnapshot {
        TxqSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_err: self.tx_err.load(Ordering::Relaxed),
            tx_drops: self.tx_drops.load(Ordering::Relaxed),
            tx_csum: self.tx_csum.load(Ordering::Relaxed),
            tx_tso: self.tx_tso.load(Ordering::Relaxed),
            tx_kicks: self.tx_kicks.load(Ordering::Relaxed),
            tx_hv_kicks: self.tx_hv_kicks.load(Ordering::Relaxed),
            tx_pkts_from_disp: self.tx_pkts_from_disp.load(Ordering::Relaxed),
            tx_disp_wakeups: self.tx_disp_wakeups.load(Ordering::Relaxed),
        }
    }
}

impl RxqStats {
    pub fn snapshot(&self) -> RxqSnapshot {
        RxqSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_drops: self.rx_drops.load(Ordering::Relaxed),
            rx_csum: self.rx_csum.load(Ordering::Relaxed),
            rx_csum_err: self.rx_csum_err.load(Ordering::Relaxed),
        }
    }
}
