//! Packet builders and LISP parsers for tests
//!
//! Uses smoltcp for the link and transport layers, matching the forwarding
//! path's decoder.

use std::net::Ipv6Addr;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv6Packet,
    Ipv6Repr, UdpPacket,
};

use crate::lisp::{GCM_TAG_SIZE, LISP_HDR_SIZE, LISP_IV_SIZE, LispHeader, UDP_HDR_SIZE};
use crate::packet::{ETHERNET_HDR_SIZE, IPV6_HDR_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Source MAC of test frames
pub const HOST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Destination MAC of test frames
pub const GATEWAY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0xfe];

/// Hop limit of test frames
pub const INNER_HOP_LIMIT: u8 = 64;

// ============================================================================
// Inner frames
// ============================================================================

/// Ethernet + IPv6 frame with an arbitrary payload under `next_header`.
pub fn build_frame(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: IpProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IPV6_HDR_SIZE + payload.len()];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(HOST_MAC),
        dst_addr: EthernetAddress(GATEWAY_MAC),
        ethertype: EthernetProtocol::Ipv6,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame);
    eth_repr.emit(&mut eth);

    let ipv6_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header,
        payload_len: payload.len(),
        hop_limit: INNER_HOP_LIMIT,
    };
    let mut ipv6_packet = Ipv6Packet::new_unchecked(eth.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);
    ipv6_packet.payload_mut().copy_from_slice(payload);

    frame
}

/// Ethernet + IPv6 + UDP frame. The UDP checksum is left zero.
pub fn build_ipv6_udp(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp_bytes = vec![0u8; UDP_HDR_SIZE + payload.len()];
    let mut udp = UdpPacket::new_unchecked(&mut udp_bytes);
    udp.set_src_port(src_port);
    udp.set_dst_port(dst_port);
    udp.set_len((UDP_HDR_SIZE + payload.len()) as u16);
    udp.set_checksum(0);
    udp_bytes[UDP_HDR_SIZE..].copy_from_slice(payload);

    build_frame(src, dst, IpProtocol::Udp, &udp_bytes)
}

/// Ethernet + IPv6 + ICMPv6 echo request.
pub fn build_ipv6_echo(src: Ipv6Addr, dst: Ipv6Addr, ident: u16, seq: u16) -> Vec<u8> {
    let mut icmp = vec![128, 0, 0, 0];
    icmp.extend_from_slice(&ident.to_be_bytes());
    icmp.extend_from_slice(&seq.to_be_bytes());
    build_frame(src, dst, IpProtocol::Icmpv6, &icmp)
}

/// Ethernet frame with an IPv4 ethertype and a dummy body.
pub fn build_ipv4_frame() -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + 20];
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(HOST_MAC),
        dst_addr: EthernetAddress(GATEWAY_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame);
    eth_repr.emit(&mut eth);
    frame[ETHERNET_HDR_SIZE] = 0x45;
    frame
}

// ============================================================================
// LISP datagrams
// ============================================================================

/// A parsed LISP datagram.
#[derive(Debug, Clone)]
pub struct LispDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub udp_len: u16,
    pub checksum: u16,
    pub header: LispHeader,
    /// Everything after the LISP header (IV, ciphertext and tag if encrypted)
    pub payload: Vec<u8>,
}

/// Parse a datagram sent to an IPv4 RLOC (UDP header onward).
pub fn parse_lisp_udp(datagram: &[u8]) -> Option<LispDatagram> {
    let udp = UdpPacket::new_checked(datagram).ok()?;
    let body = udp.payload();
    let header = LispHeader::parse(body)?;
    Some(LispDatagram {
        src_port: udp.src_port(),
        dst_port: udp.dst_port(),
        udp_len: udp.len(),
        checksum: udp.checksum(),
        header,
        payload: body[LISP_HDR_SIZE..].to_vec(),
    })
}

/// Parse a packet sent to an IPv6 RLOC (outer IPv6 header onward).
pub fn parse_lisp_ipv6(packet: &[u8]) -> Option<LispDatagram> {
    let ip = Ipv6Packet::new_checked(packet).ok()?;
    if ip.version() != 6 || ip.next_header() != IpProtocol::Udp {
        return None;
    }
    parse_lisp_udp(ip.payload())
}

/// Open an encrypted LISP payload (`IV || ciphertext || tag`).
pub fn decrypt_payload(key_material: &[u8; 32], payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < LISP_IV_SIZE + GCM_TAG_SIZE {
        return None;
    }
    let (iv, sealed) = payload.split_at(LISP_IV_SIZE);

    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&iv[..8]);
    nonce[8..].copy_from_slice(&iv[12..]);

    let key = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, key_material).ok()?);
    let mut in_out = sealed.to_vec();
    let plain = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .ok()?;
    Some(plain.to_vec())
}

/// The IPv6 packet inside a frame built by this module.
pub fn inner_packet(frame: &[u8]) -> &[u8] {
    &frame[ETHERNET_HDR_SIZE..]
}
