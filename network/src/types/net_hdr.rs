//! Per-packet net header, prepended to every frame on the wire.
//!
//! All multi-byte fields are little-endian. Without merged RX buffers the
//! header is 12 bytes; with them it grows to 16 and carries the
//! `num_buffers` count at offset 10 (the bytes past the last field are
//! reserved and stay zero).

// Header flags
/// Checksum must be completed using `csum_start`/`csum_offset`.
pub const NET_HDR_F_NEEDS_CSUM: u8 = 1;
/// Checksum has been validated by the peer.
pub const NET_HDR_F_DATA_VALID: u8 = 2;

// GSO types
/// Not a GSO frame.
pub const NET_HDR_GSO_NONE: u8 = 0;
/// GSO frame, IPv4 TCP (TSO).
pub const NET_HDR_GSO_TCPV4: u8 = 1;
/// GSO frame, IPv4 UDP (UFO).
pub const NET_HDR_GSO_UDP: u8 = 3;
/// GSO frame, IPv6 TCP.
pub const NET_HDR_GSO_TCPV6: u8 = 4;
/// TCP has ECN set.
pub const NET_HDR_GSO_ECN: u8 = 0x80;

/// Decoded per-packet net header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetHdr {
    pub flags: u8,
    pub gso_type: u8,
    /// Ethernet + IP + TCP/UDP header length.
    pub hdr_len: u16,
    /// Bytes to append per segment when segmenting.
    pub gso_size: u16,
    /// Offset to start checksumming from.
    pub csum_start: u16,
    /// Offset after `csum_start` to place the checksum.
    pub csum_offset: u16,
    /// Number of merged receive buffers. Only on the wire when merged RX
    /// buffers were negotiated.
    pub num_buffers: u16,
}

impl NetHdr {
    /// Header size without merged RX buffers.
    pub const SIZE: usize = 12;
    /// Header size with merged RX buffers (`num_buffers` present).
    pub const MRG_SIZE: usize = 16;

    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            gso_type: NET_HDR_GSO_NONE,
            hdr_len: 0,
            gso_size: 0,
            csum_start: 0,
            csum_offset: 0,
            num_buffers: 0,
        }
    }

    /// Wire size for the given negotiation.
    pub const fn wire_size(mergeable: bool) -> usize {
        if mergeable {
            Self::MRG_SIZE
        } else {
            Self::SIZE
        }
    }

    /// Encode into `out` (at least [`wire_size`](Self::wire_size) bytes).
    pub fn encode(&self, out: &mut [u8], mergeable: bool) {
        let size = Self::wire_size(mergeable);
        let out = &mut out[..size];
        out.fill(0);
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        if mergeable {
            out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        }
    }

    /// Decode from the leading bytes of a received buffer. `num_buffers` is
    /// only read when merged RX buffers were negotiated.
    pub fn decode(data: &[u8], mergeable: bool) -> Self {
        let mut hdr = Self {
            flags: data[0],
            gso_type: data[1],
            hdr_len: u16::from_le_bytes([data[2], data[3]]),
            gso_size: u16::from_le_bytes([data[4], data[5]]),
            csum_start: u16::from_le_bytes([data[6], data[7]]),
            csum_offset: u16::from_le_bytes([data[8], data[9]]),
            num_buffers: 0,
        };
        if mergeable {
            hdr.num_buffers = u16::from_le_bytes([data[10], data[11]]);
        }
        hdr
    }
}
