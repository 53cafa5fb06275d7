//! Packet buffers: owned chains of segments.
//!
//! A `Pbuf` is the unit of exchange with the upper layer and the transport.
//! On transmit it is borrowed from the stack until the hardware ring accepts
//! it, then owned by the driver until the completion returns. On receive the
//! driver allocates cluster-sized buffers, posts them, and hands reassembled
//! chains up.

use alloc::vec;
use alloc::vec::Vec;

/// Receive cluster size; every posted receive slot is this large.
pub const MCLBYTES: usize = 2048;

// Checksum request/result flags (pkthdr csum_flags).
/// Transmit: complete the TCP checksum.
pub const CSUM_TCP: u32 = 0x0002;
/// Transmit: complete the UDP checksum.
pub const CSUM_UDP: u32 = 0x0004;
/// Transmit: segment this packet (TSO).
pub const CSUM_TSO: u32 = 0x0100;
/// Receive: the data checksum has been verified.
pub const CSUM_DATA_VALID: u32 = 0x0400;
/// Receive: the pseudo-header checksum has been verified.
pub const CSUM_PSEUDO_HDR: u32 = 0x0800;

/// Checksum offloads the transmit path can ask the host to finish.
pub const CSUM_OFFLOAD: u32 = CSUM_TCP | CSUM_UDP;

/// One segment of a packet buffer.
#[derive(Debug)]
struct Seg {
    data: Vec<u8>,
    off: usize,
    len: usize,
}

impl Seg {
    fn as_slice(&self) -> &[u8] {
        &self.data[self.off..self.off + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.off..self.off + self.len]
    }
}

/// A chain of buffer segments plus packet-header metadata.
#[derive(Debug, Default)]
pub struct Pbuf {
    segs: Vec<Seg>,
    len: usize,
    /// CSUM_* request flags (transmit) or validity hints (receive).
    pub csum_flags: u32,
    /// For transmit checksum offload: offset of the checksum field within
    /// the L4 header. For receive: 0xFFFF once validated.
    pub csum_data: u16,
    /// TSO segment size requested by the stack.
    pub tso_segsz: u16,
}

impl Pbuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-segment buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut p = Self::new();
        p.segs.push(Seg {
            data: data.to_vec(),
            off: 0,
            len: data.len(),
        });
        p.len = data.len();
        p
    }

    /// A zero-filled receive cluster of [`MCLBYTES`].
    pub fn cluster() -> Self {
        let mut p = Self::new();
        p.segs.push(Seg {
            data: vec![0; MCLBYTES],
            off: 0,
            len: MCLBYTES,
        });
        p.len = MCLBYTES;
        p
    }

    /// Append a copy of `data` as a new segment.
    pub fn push_segment(&mut self, data: &[u8]) {
        self.len += data.len();
        self.segs.push(Seg {
            data: data.to_vec(),
            off: 0,
            len: data.len(),
        });
    }

    /// Total packet length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn seg_count(&self) -> usize {
        self.segs.len()
    }

    /// The first segment's payload. Header parsing operates on this view;
    /// callers needing more contiguous bytes use [`pullup`](Self::pullup)
    /// first.
    pub fn first(&self) -> &[u8] {
        self.segs.first().map(Seg::as_slice).unwrap_or(&[])
    }

    pub fn first_mut(&mut self) -> &mut [u8] {
        self.segs
            .first_mut()
            .map(Seg::as_mut_slice)
            .unwrap_or(&mut [])
    }

    /// Iterate over the non-empty segments.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Seg::as_slice).filter(|s| !s.is_empty())
    }

    /// Shrink the first segment to `len` bytes (receive: the device reports
    /// how much of the posted cluster it filled).
    pub fn trim_first_to(&mut self, len: usize) {
        if let Some(seg) = self.segs.first_mut() {
            if len < seg.len {
                self.len -= seg.len - len;
                seg.len = len;
            }
        }
    }

    /// Strip `count` bytes from the front of the chain.
    pub fn adj(&mut self, mut count: usize) {
        count = count.min(self.len);
        self.len -= count;
        for seg in &mut self.segs {
            let take = count.min(seg.len);
            seg.off += take;
            seg.len -= take;
            count -= take;
            if count == 0 {
                break;
            }
        }
    }

    /// Move every segment of `other` onto the end of this chain. Metadata of
    /// `other` is discarded; only the payload travels.
    pub fn append(&mut self, mut other: Pbuf) {
        self.len += other.len;
        self.segs.append(&mut other.segs);
    }

    /// Make the first `count` bytes of the chain contiguous in the first
    /// segment. Fails if the whole chain is shorter than `count`.
    pub fn pullup(&mut self, count: usize) -> Result<(), ()> {
        if count > self.len {
            return Err(());
        }
        if self.segs.first().map(|s| s.len >= count).unwrap_or(false) {
            return Ok(());
        }

        let mut merged = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let seg = &mut self.segs[0];
            let take = remaining.min(seg.len);
            merged.extend_from_slice(&seg.data[seg.off..seg.off + take]);
            seg.off += take;
            seg.len -= take;
            remaining -= take;
            if seg.len == 0 {
                self.segs.remove(0);
            }
        }
        let merged_len = merged.len();
        self.segs.insert(
            0,
            Seg {
                data: merged,
                off: 0,
                len: merged_len,
            },
        );
        Ok(())
    }

    /// Copy the whole chain into one flat vector (tests, diagnostics).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }
}
