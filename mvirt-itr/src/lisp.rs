//! LISP data-plane wire format
//!
//! Layout of an encapsulated datagram:
//!
//! ```text
//! outer IPv4/IPv6 | UDP (dst 4341) | LISP (8) | [IV (16)] | inner IPv6 [| GCM tag (16)]
//! ```
//!
//! The scratch buffer reserves `HEADROOM` octets in front of the captured
//! Ethernet frame. Once the 14-octet Ethernet header is discarded, the space
//! in front of the inner IP packet holds the largest outer header stack
//! (IPv6 + UDP + LISP + IV), so encapsulation never moves the payload.

use std::net::Ipv6Addr;

use smoltcp::wire::{IpProtocol, Ipv6Packet, Ipv6Repr, UdpPacket};

use crate::packet::{ETHERNET_HDR_SIZE, IPV6_HDR_SIZE};

/// LISP data port (RFC 6830)
pub const LISP_DATA_PORT: u16 = 4341;

/// LISP data header size
pub const LISP_HDR_SIZE: usize = 8;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// In-band IV carried in front of an encrypted payload
pub const LISP_IV_SIZE: usize = 16;

/// AES-GCM authentication tag appended to an encrypted payload
pub const GCM_TAG_SIZE: usize = 16;

/// Capture snapshot length
pub const SNAPLEN: usize = 65536;

/// Octets reserved in front of the captured Ethernet frame (58).
pub const HEADROOM: usize =
    IPV6_HDR_SIZE + UDP_HDR_SIZE + LISP_HDR_SIZE + LISP_IV_SIZE - ETHERNET_HDR_SIZE;

/// Offset of the inner IP packet within the scratch buffer (72).
pub const INNER_OFFSET: usize = HEADROOM + ETHERNET_HDR_SIZE;

/// Scratch buffer size: headroom, a full snapshot and room for the GCM tag.
pub const SCRATCH_SIZE: usize = HEADROOM + SNAPLEN + GCM_TAG_SIZE;

/// Outer IPv6 hop limit
pub const OUTER_HOP_LIMIT: u8 = 64;

/// N bit: nonce present
pub const FLAG_N: u8 = 0x80;
/// I bit: instance ID present
pub const FLAG_I: u8 = 0x08;
/// Key-id bits (RFC 8061)
pub const KEY_ID_MASK: u8 = 0x03;

/// The 8-octet LISP data header.
///
/// The 24-bit instance ID occupies the trailing three octets of the second
/// word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LispHeader {
    pub flags: u8,
    /// 24-bit nonce
    pub nonce: u32,
    /// 24-bit instance ID
    pub iid: u32,
}

impl LispHeader {
    /// Header with the nonce and instance-ID bits set.
    pub fn new(nonce: u32, iid: u32) -> Self {
        LispHeader {
            flags: FLAG_N | FLAG_I,
            nonce: nonce & 0x00ff_ffff,
            iid: iid & 0x00ff_ffff,
        }
    }

    /// Mark the payload as encrypted under `key_id` (1..=3).
    pub fn with_key_id(mut self, key_id: u8) -> Self {
        self.flags = (self.flags & !KEY_ID_MASK) | (key_id & KEY_ID_MASK);
        self
    }

    pub fn key_id(&self) -> u8 {
        self.flags & KEY_ID_MASK
    }

    pub fn emit(&self, buf: &mut [u8]) {
        let nonce = self.nonce.to_be_bytes();
        let iid = self.iid.to_be_bytes();
        buf[0] = self.flags;
        buf[1..4].copy_from_slice(&nonce[1..4]);
        buf[4] = 0;
        buf[5..8].copy_from_slice(&iid[1..4]);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < LISP_HDR_SIZE {
            return None;
        }
        Some(LispHeader {
            flags: buf[0],
            nonce: u32::from_be_bytes([0, buf[1], buf[2], buf[3]]),
            iid: u32::from_be_bytes([0, buf[5], buf[6], buf[7]]),
        })
    }
}

/// UDP source port for a flow: low 16 bits of the hash, forced out of the
/// well-known and registered range.
#[inline]
pub fn source_port(hash: u32) -> u16 {
    (hash as u16) | 0x8000
}

/// Write a UDP header. The checksum is left zero.
pub fn emit_udp(buf: &mut [u8], src_port: u16, len: u16) {
    let mut udp = UdpPacket::new_unchecked(&mut buf[..UDP_HDR_SIZE]);
    udp.set_src_port(src_port);
    udp.set_dst_port(LISP_DATA_PORT);
    udp.set_len(len);
    udp.set_checksum(0);
}

/// Write a fixed IPv6 header carrying UDP.
pub fn emit_ipv6(buf: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr, payload_len: u16) {
    let ipv6_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Udp,
        payload_len: usize::from(payload_len),
        hop_limit: OUTER_HOP_LIMIT,
    };
    let mut ipv6_packet = Ipv6Packet::new_unchecked(&mut buf[..IPV6_HDR_SIZE]);
    ipv6_repr.emit(&mut ipv6_packet);
}

/// UDP checksum over the IPv6 pseudo-header.
pub fn udp_checksum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, udp: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Pseudo-header
    for chunk in src.octets().chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    for chunk in dst.octets().chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += udp.len() as u32;
    sum += u8::from(IpProtocol::Udp) as u32;

    let mut i = 0;
    while i + 1 < udp.len() {
        sum += u16::from_be_bytes([udp[i], udp[i + 1]]) as u32;
        i += 2;
        // Fold early so a 64K datagram cannot overflow
        if sum > 0x7fff_ffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if i < udp.len() {
        sum += (udp[i] as u32) << 8;
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    let result = !(sum as u16);
    if result == 0 { 0xffff } else { result }
}
