//! Inner packet decoding and flow hashing
//!
//! Captured frames are Ethernet with an IPv6 payload. Decoding only extracts
//! what the forwarding path needs: both addresses, the next header and the
//! first four transport octets (the port pair for TCP/UDP).

use std::net::Ipv6Addr;

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv6Packet};
use thiserror::Error;

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// Fixed IPv6 header size
pub const IPV6_HDR_SIZE: usize = 40;

/// Why a captured frame was not forwarded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame does not carry IPv6")]
    NotIpv6,
    #[error("truncated IPv6 packet")]
    Truncated,
    #[error("{0} packet without a transport header")]
    MissingTransport(IpProtocol),
}

/// The parts of an inner IPv6 packet the ITR looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: IpProtocol,
    /// First four transport octets for TCP/UDP (src port, dst port), else 0.
    pub ports: u32,
    /// Length of the IPv6 packet (header + payload), excluding link-layer padding.
    pub ip_len: usize,
}

/// Decode an Ethernet frame carrying IPv6.
pub fn decode_frame(frame: &[u8]) -> Result<DecodedPacket, DecodeError> {
    let eth = EthernetFrame::new_checked(frame).map_err(|_| DecodeError::NotIpv6)?;
    if eth.ethertype() != EthernetProtocol::Ipv6 {
        return Err(DecodeError::NotIpv6);
    }
    decode_ipv6(eth.payload())
}

/// Decode a bare IPv6 packet.
pub fn decode_ipv6(data: &[u8]) -> Result<DecodedPacket, DecodeError> {
    if data.first().map(|b| b >> 4) != Some(6) {
        return Err(DecodeError::NotIpv6);
    }
    let ip = Ipv6Packet::new_checked(data).map_err(|_| DecodeError::Truncated)?;

    let next_header = ip.next_header();
    let ports = match next_header {
        IpProtocol::Tcp | IpProtocol::Udp => {
            let transport = ip.payload();
            if transport.len() < 4 {
                return Err(DecodeError::MissingTransport(next_header));
            }
            u32::from_be_bytes([transport[0], transport[1], transport[2], transport[3]])
        }
        _ => 0,
    };

    Ok(DecodedPacket {
        src: ip.src_addr(),
        dst: ip.dst_addr(),
        next_header,
        ports,
        ip_len: IPV6_HDR_SIZE + usize::from(ip.payload_len()),
    })
}

/// Last four octets of an IPv6 address, big-endian.
#[inline]
fn low32(addr: &Ipv6Addr) -> u32 {
    let o = addr.octets();
    u32::from_be_bytes([o[12], o[13], o[14], o[15]])
}

/// Flow hash used for RLOC selection and UDP source port entropy.
///
/// `low32(src) ^ low32(dst) ^ ports`, where `ports` is the big-endian
/// `(src_port << 16) | dst_port` for TCP and UDP and zero otherwise.
#[inline]
pub fn flow_hash(packet: &DecodedPacket) -> u32 {
    low32(&packet.src) ^ low32(&packet.dst) ^ packet.ports
}
