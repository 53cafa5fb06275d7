//! Transmit engine.
//!
//! Producers on any CPU call [`Txq::xmit`], which never blocks and never
//! drops for space reasons. When the hardware channel is free and no work is
//! staged, the packet goes straight onto the ring; otherwise it lands in the
//! caller CPU's staging ring and a single dispatcher thread drains all the
//! staging rings in timestamp order through the one hardware channel.
//!
//! Two flags coordinate the handoff:
//!
//! - `running` (a [`TokenLock`]) grants exclusive use of the hardware ring.
//!   The fast path takes it opportunistically; the dispatcher holds it the
//!   whole time it is not sleeping, including across completion waits.
//! - `pending` marks "some staging ring has work the dispatcher has not
//!   seen". Producers set it strictly after a push; the dispatcher clears
//!   it strictly before scanning the rings. That order means a sleeping
//!   dispatcher can miss a clear but never a set.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lockfree::{NwayMerger, OrderedStream, RingSpsc};

use crate::driver::features::Features;
use crate::error::TxError;
use crate::pbuf::{Pbuf, CSUM_OFFLOAD, CSUM_TSO};
use crate::pool::ReqPool;
use crate::queue::VirtQueue;
use crate::sched::{Sched, ThreadHandle, TokenLock, WaitRecord};
use crate::stats::TxqStats;
use crate::types::ethernet::{
    ethertype_and_l3_offset, ipv4_header_len, tcp_header_len, ETHERTYPE_IP, ETHERTYPE_VLAN,
    ETH_HLEN, ETH_TYPE_OFFSET, ETH_VLAN_HLEN, IPPROTO_TCP, IP_HLEN_MIN, IP_PROTO_OFFSET,
    TCP_FLAGS_OFFSET, TCP_FLAG_CWR, TCP_HLEN_MIN,
};
use crate::types::net_hdr::{
    NetHdr, NET_HDR_F_NEEDS_CSUM, NET_HDR_GSO_ECN, NET_HDR_GSO_NONE, NET_HDR_GSO_TCPV4,
};

/// Capacity of each per-CPU staging ring.
const CPU_TXQ_SIZE: usize = 4096;

/// One staged packet; the timestamp totally orders entries within a CPU and
/// approximately across CPUs.
pub(crate) struct TxBuffDesc {
    buf: Box<Pbuf>,
    ts: i64,
}

/// Per-CPU staging queue: one SPSC ring plus the producers blocked on it.
pub(crate) struct TxCpuQueue {
    ring: RingSpsc<TxBuffDesc>,
    waiters: spin::Mutex<VecDeque<Arc<WaitRecord>>>,
    waiter_count: AtomicUsize,
    sched: &'static dyn Sched,
}

impl TxCpuQueue {
    fn new(sched: &'static dyn Sched) -> Self {
        Self {
            ring: RingSpsc::new(CPU_TXQ_SIZE),
            waiters: spin::Mutex::new(VecDeque::new()),
            waiter_count: AtomicUsize::new(0),
            sched,
        }
    }

    fn push_new_waiter(&self, record: Arc<WaitRecord>) {
        let mut waiters = self.waiters.lock();
        waiters.push_back(record);
        self.waiter_count.store(waiters.len(), Ordering::Release);
    }

    /// Wake one blocked producer; a pop just made room for it.
    fn wake_one_waiter(&self) {
        if self.waiter_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let record = {
            let mut waiters = self.waiters.lock();
            let record = waiters.pop_front();
            self.waiter_count.store(waiters.len(), Ordering::Release);
            record
        };
        if let Some(record) = record {
            record.wake(self.sched);
        }
    }

    fn wake_all_waiters(&self) {
        if self.waiter_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            self.waiter_count.store(0, Ordering::Release);
            waiters.drain(..).collect()
        };
        for record in drained {
            record.wake(self.sched);
        }
    }
}

impl OrderedStream for TxCpuQueue {
    type Item = TxBuffDesc;

    fn peek_ts(&self) -> Option<i64> {
        self.ring.front().map(|desc| desc.ts)
    }

    fn pop(&self) -> Option<TxBuffDesc> {
        let item = self.ring.pop();
        if item.is_some() {
            self.wake_one_waiter();
        }
        item
    }
}

/// A request in flight on the hardware ring: the per-packet net header
/// (referenced by the first scatter-gather fragment, so it must live
/// exactly as long as the descriptor) and the packet it covers.
struct TxReq {
    hdr: NetHdr,
    hdr_bytes: [u8; NetHdr::MRG_SIZE],
    pbuf: Pbuf,
}

impl TxReq {
    fn new(pbuf: Pbuf) -> Self {
        Self {
            hdr: NetHdr::zeroed(),
            hdr_bytes: [0; NetHdr::MRG_SIZE],
            pbuf,
        }
    }

    fn into_pbuf(self) -> Pbuf {
        self.pbuf
    }
}

/// Everything guarded by the `running` token.
struct TxChannel<Q: VirtQueue> {
    vq: Q,
    /// Live in-flight requests, keyed by the ring token.
    reqs: ReqPool<Box<TxReq>>,
    /// Packets enqueued since the last doorbell.
    pkts_to_kick: u16,
}

/// Counter deltas for one successfully prepared packet.
#[derive(Clone, Copy)]
struct TxMeta {
    bytes: u64,
    csum: bool,
    tso: bool,
}

enum TxAdd {
    /// Published to the ring.
    Done(TxMeta),
    /// The available ring had no room even after collection.
    NoRoom(Box<TxReq>, TxMeta),
    /// Offload preparation failed; the packet has been freed and counted.
    Malformed,
}

/// The transmit queue: hardware channel, per-CPU staging and dispatcher
/// coordination.
pub(crate) struct Txq<Q: VirtQueue> {
    channel: TokenLock<TxChannel<Q>>,
    cpuq: Vec<TxCpuQueue>,
    /// Staged work the dispatcher has not observed yet.
    pending: AtomicBool,
    flush_requested: AtomicBool,
    stopping: AtomicBool,
    disp_thread: spin::Mutex<Option<ThreadHandle>>,
    stop_waiter: spin::Mutex<Option<Arc<WaitRecord>>>,
    pub(crate) stats: TxqStats,
    sched: &'static dyn Sched,
    features: Features,
    hdr_size: usize,
    vq_size: u16,
}

impl<Q: VirtQueue> Txq<Q> {
    pub(crate) fn new(
        vq: Q,
        sched: &'static dyn Sched,
        features: Features,
        hdr_size: usize,
    ) -> Self {
        let vq_size = vq.size();
        let cpuq = (0..sched.cpu_count())
            .map(|_| TxCpuQueue::new(sched))
            .collect();

        Self {
            channel: TokenLock::new(
                TxChannel {
                    vq,
                    reqs: ReqPool::with_capacity(vq_size as usize),
                    pkts_to_kick: 0,
                },
                sched,
            ),
            cpuq,
            pending: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            disp_thread: spin::Mutex::new(None),
            stop_waiter: spin::Mutex::new(None),
            stats: TxqStats::default(),
            sched,
            features,
            hdr_size,
            vq_size,
        }
    }

    pub(crate) fn set_dispatcher(&self, handle: ThreadHandle) {
        *self.disp_thread.lock() = Some(handle);
    }

    // PENDING control. The set happens strictly after a push; the clear
    // strictly before the heap inspection.

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn test_and_set_pending(&self) -> bool {
        self.pending.swap(true, Ordering::AcqRel)
    }

    fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn wake_dispatcher(&self) {
        let handle = self.disp_thread.lock().clone();
        if let Some(handle) = handle {
            self.sched.unpark(&handle);
        }
    }

    /// Non-blocking transmit entry point.
    ///
    /// Returns `Ok(())` once the driver owns the packet; the only error is
    /// a malformed packet detected during offload preparation. Ring
    /// exhaustion is absorbed by staging.
    pub(crate) fn xmit(&self, buf: Pbuf) -> Result<(), TxError> {
        if self.stopping.load(Ordering::Acquire) {
            self.stats.tx_drops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Pending staged packets mean the dispatcher is running or about to;
        // a taken channel token means someone is on the ring right now.
        // Either way: stage, keep ordering, let the dispatcher batch.
        if self.has_pending() {
            self.push_cpu(buf);
            return Ok(());
        }
        let Some(mut chan) = self.channel.try_lock() else {
            self.push_cpu(buf);
            return Ok(());
        };

        let req = Box::new(TxReq::new(buf));
        let outcome = self.try_xmit_one_locked(&mut chan, req);

        if let TxAdd::Done(meta) = &outcome {
            self.update_stats(*meta);
            self.stats.tx_kicks.fetch_add(1, Ordering::Relaxed);
            if chan.vq.kick() {
                self.stats.tx_hv_kicks.fetch_add(1, Ordering::Relaxed);
            }
        }

        drop(chan);

        // Wake the dispatcher only if work appeared while we held the
        // channel; otherwise it has nothing to do.
        if self.has_pending() {
            self.wake_dispatcher();
        }

        match outcome {
            TxAdd::Done(_) => Ok(()),
            TxAdd::Malformed => Err(TxError::InvalidPacket),
            TxAdd::NoRoom(req, _) => {
                self.push_cpu(req.into_pbuf());
                Ok(())
            }
        }
    }

    /// Stage a packet on the current CPU's ring, blocking only when that
    /// ring is full.
    fn push_cpu(&self, buf: Pbuf) {
        let sched = self.sched;
        sched.preempt_disable();

        let mut cpu = sched.current_cpu();
        let mut desc = TxBuffDesc {
            buf: Box::new(buf),
            ts: sched.now(),
        };

        loop {
            match self.cpuq[cpu].ring.push(desc) {
                Ok(()) => break,
                Err(back) => {
                    let record = Arc::new(WaitRecord::new(sched));
                    self.cpuq[cpu].push_new_waiter(record.clone());

                    // Retry before sleeping: if the dispatcher emptied the
                    // whole ring between the failed push and the waiter
                    // registration, nothing would ever pop an entry of this
                    // ring again and the record would never be woken. A
                    // successful retry guarantees the dispatcher has work,
                    // hence will reach our record.
                    let leftover = match self.cpuq[cpu].ring.push(back) {
                        Ok(()) => None,
                        Err(back) => Some(back),
                    };
                    if leftover.is_none() && !self.test_and_set_pending() {
                        self.wake_dispatcher();
                    }

                    sched.preempt_enable();
                    record.wait(sched);

                    match leftover {
                        // Retry had pushed the entry; it is the dispatcher's
                        // problem now.
                        None => return,
                        Some(back) => {
                            sched.preempt_disable();
                            // The thread may have migrated while blocked, and
                            // the dispatcher has been draining entries with
                            // newer timestamps in the meantime: refresh both
                            // so per-ring timestamps stay non-decreasing.
                            cpu = sched.current_cpu();
                            desc = TxBuffDesc {
                                buf: back.buf,
                                ts: sched.now(),
                            };
                        }
                    }
                }
            }
        }

        if !self.test_and_set_pending() {
            self.wake_dispatcher();
        }
        sched.preempt_enable();
    }

    /// Prepare `req` and publish it as one descriptor chain. Runs with the
    /// channel token held. Does not ring the doorbell.
    fn try_xmit_one_locked(&self, chan: &mut TxChannel<Q>, mut req: Box<TxReq>) -> TxAdd {
        if req.pbuf.csum_flags != 0 {
            if offload(&mut req.pbuf, &mut req.hdr, self.features.host_ecn).is_err() {
                self.stats.tx_err.fetch_add(1, Ordering::Relaxed);
                return TxAdd::Malformed;
            }
        }
        req.hdr
            .encode(&mut req.hdr_bytes, self.features.mergeable_bufs);

        let meta = TxMeta {
            bytes: req.pbuf.len() as u64,
            csum: req.hdr.flags & NET_HDR_F_NEEDS_CSUM != 0,
            tso: req.hdr.gso_type != NET_HDR_GSO_NONE,
        };

        chan.vq.init_sg();
        chan.vq.add_out(req.hdr_bytes.as_ptr(), self.hdr_size);
        for seg in req.pbuf.segments() {
            chan.vq.add_out(seg.as_ptr(), seg.len());
        }

        let frags = chan.vq.sg_len();
        if !chan.vq.avail_ring_has_room(frags) && chan.vq.used_ring_not_empty() {
            self.gc(chan);
        }

        let token = chan.reqs.insert(req);
        if !chan.vq.try_add_buf(token) {
            let req = chan.reqs.remove(token).expect("token minted above");
            return TxAdd::NoRoom(req, meta);
        }

        TxAdd::Done(meta)
    }

    /// Transmit one packet with the channel token held, waiting for
    /// completions if the ring is out of room. Dispatcher only.
    fn xmit_one_locked(&self, chan: &mut TxChannel<Q>, buf: Box<Pbuf>) -> Result<(), TxError> {
        let req = Box::new(TxReq::new(*buf));

        match self.try_xmit_one_locked(chan, req) {
            TxAdd::Done(meta) => {
                self.update_stats(meta);
                chan.pkts_to_kick += 1;
                Ok(())
            }
            // There is no caller to hand the error to on this path; the
            // packet is gone and tx_err already counted.
            TxAdd::Malformed => Err(TxError::InvalidPacket),
            TxAdd::NoRoom(req, meta) => {
                // About to wait: make sure the host knows about everything
                // queued so far, or it may never produce the completions we
                // are waiting for.
                self.kick(chan);

                let token = chan.reqs.insert(req);
                loop {
                    chan.vq.wait_for_used();
                    self.gc(chan);
                    if chan.vq.try_add_buf(token) {
                        break;
                    }
                }

                self.update_stats(meta);
                chan.pkts_to_kick += 1;
                Ok(())
            }
        }
    }

    fn update_stats(&self, meta: TxMeta) {
        self.stats.tx_bytes.fetch_add(meta.bytes, Ordering::Relaxed);
        self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        if meta.csum {
            self.stats.tx_csum.fetch_add(1, Ordering::Relaxed);
        }
        if meta.tso {
            self.stats.tx_tso.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Doorbell for the dispatcher path: flushes the accumulated packet
    /// count in one notification.
    fn kick(&self, chan: &mut TxChannel<Q>) {
        if chan.pkts_to_kick == 0 {
            return;
        }
        self.stats
            .tx_pkts_from_disp
            .fetch_add(u64::from(chan.pkts_to_kick), Ordering::Relaxed);
        chan.pkts_to_kick = 0;
        self.stats.tx_kicks.fetch_add(1, Ordering::Relaxed);
        if chan.vq.kick() {
            self.stats.tx_hv_kicks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reclaim completed requests. Finalizes in quarter-ring batches so the
    /// host can keep filling the used ring while we drain it.
    fn gc(&self, chan: &mut TxChannel<Q>) {
        let fin_thr = (self.vq_size / 4).max(1);
        let mut count: u16 = 0;
        let mut len = 0u32;

        while let Some(token) = chan.vq.get_buf_elem(&mut len) {
            if chan.reqs.remove(token).is_none() {
                log::warn!("tx completion for unknown token {}", token);
            }
            count += 1;
            if count >= fin_thr {
                chan.vq.get_buf_finalize(count);
                count = 0;
            }
        }
        if count > 0 {
            chan.vq.get_buf_finalize(count);
        }
    }

    fn wake_waiters_all(&self) {
        for queue in &self.cpuq {
            queue.wake_all_waiters();
        }
    }

    /// Invalidate everything currently staged (MTU change, teardown). The
    /// dispatcher performs the drain; staging rings are single-consumer.
    pub(crate) fn flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
        self.wake_dispatcher();
    }

    /// Stop the dispatcher and reclaim every in-flight request. Returns
    /// once the hardware ring is empty. Called once, at detach.
    pub(crate) fn stop(&self) {
        let record = Arc::new(WaitRecord::new(self.sched));
        *self.stop_waiter.lock() = Some(record.clone());
        self.stopping.store(true, Ordering::Release);
        self.wake_dispatcher();
        record.wait(self.sched);
    }

    fn wait_for_work(&self) {
        loop {
            if self.has_pending()
                || self.stopping.load(Ordering::Acquire)
                || self.flush_requested.load(Ordering::Acquire)
            {
                return;
            }
            self.sched.park();
        }
    }

    fn drain_staged<P: Fn() -> bool>(&self, mg: &mut NwayMerger<'_, TxCpuQueue, P>) {
        let mut dropped = 0u64;
        while let Some(desc) = mg.pop() {
            drop(desc);
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.tx_drops.fetch_add(dropped, Ordering::Relaxed);
        }
        self.wake_waiters_all();
    }

    /// Wait out every request the hardware still holds and free it.
    fn reclaim_in_flight(&self, chan: &mut TxChannel<Q>) {
        self.kick(chan);
        loop {
            self.gc(chan);
            if chan.reqs.is_empty() {
                return;
            }
            chan.vq.kick();
            chan.vq.wait_for_used();
        }
    }

    /// Dispatcher thread body. Exactly one per queue for the driver's
    /// lifetime.
    pub(crate) fn dispatch(self: Arc<Self>) {
        self.set_dispatcher(self.sched.current());

        // Ring the doorbell at least once per hardware-ring of packets.
        // Posting a full ring without one would leave the host unaware of
        // the work while we block waiting for its completions.
        let kick_thresh = self.vq_size;

        let mut mg = NwayMerger::new(self.cpuq.iter().collect(), || !self.has_pending());

        // The token is held the whole time the dispatcher is awake.
        let mut chan = self.channel.lock();

        loop {
            // Producers set `pending` after their push: clearing first means
            // either the scan below sees their entry, or their set survives
            // and the sleep falls through immediately.
            self.clear_pending();

            if self.stopping.load(Ordering::Acquire) {
                self.drain_staged(&mut mg);
                self.reclaim_in_flight(&mut chan);
                break;
            }
            if self.flush_requested.swap(false, Ordering::AcqRel) {
                self.drain_staged(&mut mg);
            }

            match mg.pop() {
                Some(desc) => {
                    let _ = self.xmit_one_locked(&mut chan, desc.buf);
                }
                None => {
                    // Going to sleep: anyone blocked on a full staging ring
                    // would wait forever now, so let them all retry.
                    self.wake_waiters_all();
                    drop(chan);
                    self.wait_for_work();
                    self.stats.tx_disp_wakeups.fetch_add(1, Ordering::Relaxed);
                    chan = self.channel.lock();
                }
            }

            while let Some(desc) = mg.pop() {
                if chan.pkts_to_kick >= kick_thresh {
                    self.kick(&mut chan);
                }
                let _ = self.xmit_one_locked(&mut chan, desc.buf);
            }
            self.kick(&mut chan);
        }

        drop(chan);
        self.wake_waiters_all();
        if let Some(record) = self.stop_waiter.lock().take() {
            record.wake(self.sched);
        }
    }
}

/// Rewrite the per-packet header for the offloads the stack requested.
///
/// Parses Ethernet (optionally one VLAN tag), then IPv4, then (for TSO)
/// TCP, pulling fragments up as needed so each header is contiguous.
/// Returns `Err` when the packet cannot be prepared; the caller drops it.
fn offload(pbuf: &mut Pbuf, hdr: &mut NetHdr, host_ecn: bool) -> Result<(), ()> {
    if pbuf.first().len() < ETH_HLEN {
        pbuf.pullup(ETH_HLEN)?;
    }
    // One VLAN tag may sit between the Ethernet header and the IP header.
    let raw_type =
        u16::from_be_bytes([pbuf.first()[ETH_TYPE_OFFSET], pbuf.first()[ETH_TYPE_OFFSET + 1]]);
    if raw_type == ETHERTYPE_VLAN && pbuf.first().len() < ETH_VLAN_HLEN {
        pbuf.pullup(ETH_VLAN_HLEN)?;
    }
    let Some((eth_type, ip_offset)) = ethertype_and_l3_offset(pbuf.first()) else {
        return Err(());
    };

    if eth_type != ETHERTYPE_IP {
        // Nothing we can offload; send as-is with a zero header.
        return Ok(());
    }

    if pbuf.first().len() < ip_offset + IP_HLEN_MIN {
        pbuf.pullup(ip_offset + IP_HLEN_MIN)?;
    }
    let (csum_start, ip_proto) = {
        let ip = &pbuf.first()[ip_offset..];
        (ip_offset + ipv4_header_len(ip), ip[IP_PROTO_OFFSET])
    };

    if pbuf.csum_flags & CSUM_OFFLOAD != 0 {
        hdr.flags |= NET_HDR_F_NEEDS_CSUM;
        hdr.csum_start = csum_start as u16;
        hdr.csum_offset = pbuf.csum_data;
    }

    if pbuf.csum_flags & CSUM_TSO != 0 {
        if ip_proto != IPPROTO_TCP {
            // TSO was asked of a non-TCP packet; fall back to checksum
            // offload alone.
            return Ok(());
        }

        if pbuf.first().len() < csum_start + TCP_HLEN_MIN {
            pbuf.pullup(csum_start + TCP_HLEN_MIN)?;
        }
        let tcp_hdr_len = tcp_header_len(&pbuf.first()[csum_start..]);

        hdr.gso_type = NET_HDR_GSO_TCPV4;
        hdr.hdr_len = (csum_start + tcp_hdr_len) as u16;
        hdr.gso_size = pbuf.tso_segsz;

        if pbuf.first()[csum_start + TCP_FLAGS_OFFSET] & TCP_FLAG_CWR != 0 {
            if !host_ecn {
                log::warn!("TSO with ECN not supported by host");
                return Err(());
            }
            hdr.gso_type |= NET_HDR_GSO_ECN;
        }
    }

    Ok(())
}
