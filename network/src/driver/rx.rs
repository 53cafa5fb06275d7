//! Receive engine.
//!
//! A single poll thread sleeps on the used ring, drains completions,
//! reassembles merged frames, validates offloaded checksums and hands each
//! packet to the upper layer, refilling the ring with fresh clusters when
//! the posted-buffer level drops.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;

use crate::driver::features::Features;
use crate::pbuf::{Pbuf, CSUM_DATA_VALID, CSUM_PSEUDO_HDR};
use crate::pool::ReqPool;
use crate::queue::VirtQueue;
use crate::stats::RxqStats;
use crate::types::ethernet::{
    ethertype_and_l3_offset, ETHERTYPE_IP, ETH_HLEN, IP_HLEN_MIN, TCP_CSUM_OFFSET,
    UDP_CSUM_OFFSET, UDP_HLEN,
};
use crate::types::net_hdr::{NetHdr, NET_HDR_F_NEEDS_CSUM};
use crate::upper::{BufAllocator, UpperLayer};

pub(crate) struct Rxq<Q: VirtQueue> {
    vq: Q,
    /// Clusters posted to the ring, keyed by token.
    bufs: ReqPool<Pbuf>,
    pub(crate) stats: Arc<RxqStats>,
    mergeable: bool,
    guest_csum: bool,
    hdr_size: usize,
    stopping: Arc<AtomicBool>,
}

impl<Q: VirtQueue> Rxq<Q> {
    pub(crate) fn new(
        vq: Q,
        stats: Arc<RxqStats>,
        features: Features,
        hdr_size: usize,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        let capacity = vq.size() as usize;
        Self {
            vq,
            bufs: ReqPool::with_capacity(capacity),
            stats,
            mergeable: features.mergeable_bufs,
            guest_csum: features.guest_csum,
            hdr_size,
            stopping,
        }
    }

    /// Post fresh clusters until the ring is full or the allocator gives
    /// out. One doorbell covers the whole burst.
    pub(crate) fn fill_rx_ring(&mut self, allocator: &dyn BufAllocator) {
        let mut added = 0;

        while self.vq.avail_ring_has_room(1) {
            let Some(mut cluster) = allocator.alloc_cluster() else {
                break;
            };
            let slot = cluster.first_mut();
            let (addr, len) = (slot.as_mut_ptr(), slot.len());

            self.vq.init_sg();
            self.vq.add_in(addr, len);
            let token = self.bufs.insert(cluster);
            if !self.vq.try_add_buf(token) {
                self.bufs.remove(token);
                break;
            }
            added += 1;
        }

        log::trace!("rx ring: posted {} buffers", added);
        if added > 0 {
            self.vq.kick();
        }
    }

    /// Poll loop. Runs until the upper layer stops or the driver detaches.
    pub(crate) fn receiver(&mut self, upper: &dyn UpperLayer, allocator: &dyn BufAllocator) {
        loop {
            self.vq.wait_for_used();
            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            let mut rx_packets = 0u64;
            let mut rx_bytes = 0u64;
            let mut rx_drops = 0u64;
            let mut csum_ok = 0u64;
            let mut csum_err = 0u64;

            let mut len = 0u32;
            let mut cur = self.vq.get_buf_elem(&mut len);

            while let Some(token) = cur {
                self.vq.get_buf_finalize(1);

                let Some(mut head) = self.bufs.remove(token) else {
                    log::warn!("rx completion for unknown token {}", token);
                    cur = self.vq.get_buf_elem(&mut len);
                    continue;
                };

                // Runt: not even a net header plus an Ethernet header.
                if (len as usize) < self.hdr_size + ETH_HLEN {
                    rx_drops += 1;
                    drop(head);
                    cur = self.vq.get_buf_elem(&mut len);
                    continue;
                }

                // Copy the net header out; the chain is about to be
                // truncated and adjusted.
                let hdr = NetHdr::decode(head.first(), self.mergeable);
                let nbufs = if self.mergeable { hdr.num_buffers } else { 1 };

                head.trim_first_to(len as usize);
                head.csum_flags = 0;
                head.csum_data = 0;

                // Chain the remaining fragments of a merged frame.
                let mut lost_fragment = false;
                for _ in 1..nbufs {
                    let mut frag_len = 0u32;
                    let Some(frag_token) = self.vq.get_buf_elem(&mut frag_len) else {
                        lost_fragment = true;
                        break;
                    };
                    self.vq.get_buf_finalize(1);

                    match self.bufs.remove(frag_token) {
                        Some(mut frag) => {
                            // A fragment contributes at most what was
                            // preposted, whatever the device reports.
                            let take = (frag_len as usize).min(frag.first().len());
                            frag.trim_first_to(take);
                            head.append(frag);
                        }
                        None => {
                            lost_fragment = true;
                            break;
                        }
                    }
                }
                if lost_fragment {
                    rx_drops += 1;
                    drop(head);
                    cur = self.vq.get_buf_elem(&mut len);
                    continue;
                }

                // The net header is not for the upper layer.
                head.adj(self.hdr_size);

                if self.guest_csum && hdr.flags & NET_HDR_F_NEEDS_CSUM != 0 {
                    if bad_rx_csum(&mut head, &hdr) {
                        csum_err += 1;
                    } else {
                        csum_ok += 1;
                    }
                }

                rx_packets += 1;
                rx_bytes += head.len() as u64;

                upper.input(head);

                // The interface may have been stopped while the packet
                // travelled up the stack.
                if !upper.is_running() {
                    break;
                }

                cur = self.vq.get_buf_elem(&mut len);
            }

            if self.vq.refill_needed() {
                self.fill_rx_ring(allocator);
            }

            self.stats.rx_packets.fetch_add(rx_packets, Ordering::Relaxed);
            self.stats.rx_bytes.fetch_add(rx_bytes, Ordering::Relaxed);
            self.stats.rx_drops.fetch_add(rx_drops, Ordering::Relaxed);
            self.stats.rx_csum.fetch_add(csum_ok, Ordering::Relaxed);
            self.stats.rx_csum_err.fetch_add(csum_err, Ordering::Relaxed);
        }
    }
}

/// Judge an offloaded receive checksum from the bundled offsets alone,
/// without parsing past the L2/L3 headers. Returns **true when the checksum
/// is bad** and false when it can be trusted; on trust, the upper-layer
/// validity hints are set on the packet.
///
/// The offsets are trusted only if they point at the checksum field of a
/// UDP or TCP header inside an IPv4 (optionally VLAN-tagged) frame; the
/// offsets of those two fields are distinct, which is what makes the
/// shortcut sound.
pub(crate) fn bad_rx_csum(m: &mut Pbuf, hdr: &NetHdr) -> bool {
    let csum_start = usize::from(hdr.csum_start);
    let csum_len = csum_start + usize::from(hdr.csum_offset);

    if csum_len < ETH_HLEN + IP_HLEN_MIN {
        return true;
    }
    let frame = m.first();
    if frame.len() < csum_len {
        return true;
    }

    let Some((eth_type, _)) = ethertype_and_l3_offset(frame) else {
        return true;
    };
    if eth_type != ETHERTYPE_IP {
        return true;
    }

    match hdr.csum_offset {
        UDP_CSUM_OFFSET => {
            if frame.len() < csum_start + UDP_HLEN {
                return true;
            }
            let udp_sum = u16::from_be_bytes([
                frame[csum_start + usize::from(UDP_CSUM_OFFSET)],
                frame[csum_start + usize::from(UDP_CSUM_OFFSET) + 1],
            ]);
            // UDP over IPv4 marks "no checksum" with zero; nothing to
            // distrust, but nothing to hint about either.
            if udp_sum == 0 {
                return false;
            }
        }
        TCP_CSUM_OFFSET => {}
        _ => return true,
    }

    m.csum_flags |= CSUM_DATA_VALID | CSUM_PSEUDO_HDR;
    m.csum_data = 0xFFFF;
    false
}
