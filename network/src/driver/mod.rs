//! Device binding and lifecycle.
//!
//! Probe negotiates features, sizes the per-packet header, wires the
//! interrupt-driven poll and dispatcher threads, fills the receive ring and
//! only then advertises DRIVER_OK. Detach runs the teardown in the reverse
//! direction: refuse new transmits, invalidate staged packets, wait out
//! everything the hardware still holds.

pub mod features;
pub(crate) mod rx;
pub(crate) mod tx;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{IoctlError, ProbeError, TxError};
use crate::pbuf::Pbuf;
use crate::queue::{NetDevice, VirtQueue};
use crate::sched::Sched;
use crate::stats::{IfData, RxqSnapshot, RxqStats, TxqSnapshot};
use crate::types::{EthernetAddress, NetHdr};
use crate::upper::{BufAllocator, UpperLayer};

use self::features::Features;

/// Default interface MTU.
pub const ETHERMTU: u32 = 1500;

/// Interface control commands. Unknown commands are delegated to the upper
/// layer's generic Ethernet handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    SetMtu(u32),
    SetFlags { up: bool },
    /// Multicast filtering is not implemented; accepted as a no-op.
    AddMulticast(EthernetAddress),
    DelMulticast(EthernetAddress),
    Other(u64),
}

/// A bound paravirtual NIC.
pub struct Net<Q: VirtQueue + 'static> {
    txq: Arc<tx::Txq<Q>>,
    rx_stats: Arc<RxqStats>,
    rx_stopping: Arc<AtomicBool>,
    upper: Arc<dyn UpperLayer>,
    mac: EthernetAddress,
    features: Features,
    hdr_size: usize,
    mtu: AtomicU32,
}

impl<Q: VirtQueue + 'static> Net<Q> {
    /// Bind to a device: negotiate, wire threads and interrupts, prime the
    /// receive ring, go live.
    pub fn probe<D: NetDevice<Queue = Q>>(
        mut dev: D,
        sched: &'static dyn Sched,
        upper: Arc<dyn UpperLayer>,
        allocator: Arc<dyn BufAllocator>,
    ) -> Result<Self, ProbeError> {
        let features = Features::negotiate(dev.device_features());
        dev.ack_features(features.bits())?;

        let mac = dev.mac();
        log::info!("negotiated features {:#x}, mac {}", features.bits(), mac);

        // Merged RX buffers add the num_buffers field to every header.
        let hdr_size = NetHdr::wire_size(features.mergeable_bufs);

        let rx_vq = dev.take_queue(0)?;
        let mut tx_vq = dev.take_queue(1)?;

        // Multi-fragment chains spend one ring slot each this way.
        tx_vq.set_indirect(true);
        // The transmit path is push-driven; completions are reaped
        // opportunistically and interrupts only matter inside explicit
        // waits.
        tx_vq.disable_interrupts();

        let rx_stats = Arc::new(RxqStats::default());
        let rx_stopping = Arc::new(AtomicBool::new(false));
        let txq = Arc::new(tx::Txq::new(tx_vq, sched, features, hdr_size));

        let mut rxq = rx::Rxq::new(
            rx_vq,
            rx_stats.clone(),
            features,
            hdr_size,
            rx_stopping.clone(),
        );
        // The ring must have buffers posted before the device may use it.
        rxq.fill_rx_ring(&*allocator);

        let disp_thread = {
            let txq = txq.clone();
            sched.spawn("virtnet-tx-disp", Box::new(move || txq.dispatch()))
        };
        txq.set_dispatcher(disp_thread.clone());

        let poll_thread = {
            let upper = upper.clone();
            let allocator = allocator.clone();
            sched.spawn(
                "virtnet-rx-poll",
                Box::new(move || rxq.receiver(&*upper, &*allocator)),
            )
        };

        dev.bind_irq(0, poll_thread);
        dev.bind_irq(1, disp_thread);
        dev.set_driver_ok();

        upper.attach(mac);

        Ok(Self {
            txq,
            rx_stats,
            rx_stopping,
            upper,
            mac,
            features,
            hdr_size,
            mtu: AtomicU32::new(ETHERMTU),
        })
    }

    /// Transmit one packet. Never blocks for ring space; see
    /// [`TxError`] for the single failure mode.
    pub fn xmit(&self, buf: Pbuf) -> Result<(), TxError> {
        self.txq.xmit(buf)
    }

    /// Invalidate all staged transmit packets.
    pub fn flush(&self) {
        self.txq.flush();
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Wire size of the per-packet net header for this negotiation.
    pub fn hdr_size(&self) -> usize {
        self.hdr_size
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Add this driver's counters into an interface-data snapshot.
    pub fn fill_stats(&self, out: &mut IfData) {
        let rx = self.rx_stats.snapshot();
        out.input_packets += rx.rx_packets;
        out.input_bytes += rx.rx_bytes;
        out.input_drops += rx.rx_drops;
        out.input_errors += rx.rx_csum_err;

        let tx = self.txq.stats.snapshot();
        out.output_packets += tx.tx_packets;
        out.output_bytes += tx.tx_bytes;
        out.output_errors += tx.tx_err + tx.tx_drops;
    }

    pub fn txq_stats(&self) -> TxqSnapshot {
        self.txq.stats.snapshot()
    }

    pub fn rxq_stats(&self) -> RxqSnapshot {
        self.rx_stats.snapshot()
    }

    /// Interface control plane.
    pub fn ioctl(&self, cmd: IoctlCmd) -> Result<(), IoctlError> {
        match cmd {
            IoctlCmd::SetMtu(mtu) => {
                if mtu == 0 || mtu > u32::from(u16::MAX) {
                    return Err(IoctlError::InvalidArgument);
                }
                log::debug!("mtu {} -> {}", self.mtu.load(Ordering::Relaxed), mtu);
                self.mtu.store(mtu, Ordering::Relaxed);
                // Staged packets were sized against the old MTU.
                self.txq.flush();
                Ok(())
            }
            IoctlCmd::SetFlags { up } => {
                log::debug!("interface {}", if up { "up" } else { "down" });
                Ok(())
            }
            IoctlCmd::AddMulticast(_) | IoctlCmd::DelMulticast(_) => Ok(()),
            IoctlCmd::Other(raw) => {
                log::debug!("ioctl {:#x} delegated to ether layer", raw);
                self.upper.ether_ioctl(raw)
            }
        }
    }

    /// Tear the binding down. Returns once every in-flight transmit request
    /// has been returned and freed; the poll thread exits at its next
    /// wake-up.
    pub fn detach(self) {
        self.rx_stopping.store(true, Ordering::Release);
        self.txq.stop();
    }
}
