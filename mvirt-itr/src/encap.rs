//! LISP encapsulation
//!
//! The `Encapsulator` owns everything one forwarding thread needs to emit
//! LISP datagrams: the egress sockets, the IV state and a scratch buffer.
//! The captured frame lives in the scratch buffer at `HEADROOM`, so the
//! outer headers are written in place in front of the inner IP packet.

use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};

use ring::aead::{Aad, Nonce};
use thiserror::Error;
use tracing::trace;

use crate::egress::Egress;
use crate::lisp::{
    GCM_TAG_SIZE, HEADROOM, INNER_OFFSET, LISP_HDR_SIZE, LISP_IV_SIZE, LispHeader, SCRATCH_SIZE,
    SNAPLEN, UDP_HDR_SIZE, emit_ipv6, emit_udp, source_port, udp_checksum_v6,
};
use crate::map_cache::{BufferedPacket, MapEntry, PRIORITY_UNUSABLE, Rloc};
use crate::packet::{ETHERNET_HDR_SIZE, IPV6_HDR_SIZE};

#[derive(Debug, Error)]
pub enum EncapError {
    #[error("entry has no usable RLOC")]
    NoUsableRloc,
    #[error("inner packet of {0} octets does not fit the scratch buffer")]
    FrameTooLong(usize),
    #[error("encapsulated datagram of {0} octets exceeds 65535")]
    Oversize(usize),
    #[error("AES-GCM seal failed")]
    Seal,
    #[error("send to {rloc} failed: {source}")]
    Send {
        rloc: IpAddr,
        #[source]
        source: io::Error,
    },
}

/// Per-thread IV state for AES-GCM.
///
/// The 96-bit nonce is `high || low32(low)`; `low` advances once per
/// encrypted packet.
pub struct IvState {
    high: u64,
    low: AtomicU64,
}

impl IvState {
    pub fn new(high: u64, low: u64) -> Self {
        IvState {
            high,
            low: AtomicU64::new(low),
        }
    }

    /// Seed both halves from the OS-seeded thread RNG.
    pub fn seeded() -> Self {
        Self::new(rand::random(), rand::random())
    }

    /// Advance the counter and return `(in-band IV field, GCM nonce)`.
    fn next(&self) -> ([u8; LISP_IV_SIZE], [u8; 12]) {
        let low = self.low.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let mut iv = [0u8; LISP_IV_SIZE];
        iv[..8].copy_from_slice(&self.high.to_be_bytes());
        iv[8..].copy_from_slice(&low.to_be_bytes());

        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.high.to_be_bytes());
        nonce[8..].copy_from_slice(&(low as u32).to_be_bytes());
        (iv, nonce)
    }
}

/// Pick an RLOC for a flow.
///
/// Only the lowest-priority tier is eligible (priority 255 never is). Within
/// the tier, `hash % total_weight` is matched against the running weight sum;
/// list order breaks ties. A tier whose weights are all zero is split evenly.
pub fn select_rloc(rlocs: &[Rloc], hash: u32) -> Option<&Rloc> {
    let best = rlocs
        .iter()
        .map(|r| r.priority)
        .filter(|p| *p != PRIORITY_UNUSABLE)
        .min()?;
    let tier = || rlocs.iter().filter(move |r| r.priority == best);

    let total: u32 = tier().map(|r| u32::from(r.weight)).sum();
    if total == 0 {
        let count = tier().count() as u32;
        return tier().nth((hash % count) as usize);
    }

    let target = hash % total;
    let mut running = 0u32;
    for rloc in tier() {
        running += u32::from(rloc.weight);
        if running > target {
            return Some(rloc);
        }
    }
    None
}

/// Builds and sends LISP datagrams for one thread.
pub struct Encapsulator<E> {
    egress: E,
    iv: IvState,
    scratch: Box<[u8]>,
    /// Source address of outer IPv6 headers
    ipv6_source: Ipv6Addr,
}

impl<E: Egress> Encapsulator<E> {
    pub fn new(egress: E, ipv6_source: Ipv6Addr) -> Self {
        Self::with_iv(egress, ipv6_source, IvState::seeded())
    }

    pub fn with_iv(egress: E, ipv6_source: Ipv6Addr, iv: IvState) -> Self {
        Encapsulator {
            egress,
            iv,
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
            ipv6_source,
        }
    }

    pub fn egress(&self) -> &E {
        &self.egress
    }

    /// Capture area of the scratch buffer (one snapshot length).
    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.scratch[HEADROOM..HEADROOM + SNAPLEN]
    }

    /// The first `len` octets of the captured frame.
    pub fn frame(&self, len: usize) -> &[u8] {
        &self.scratch[HEADROOM..HEADROOM + len.min(SNAPLEN)]
    }

    /// Copy a frame into the capture area.
    pub fn load_frame(&mut self, frame: &[u8]) -> Result<(), EncapError> {
        if frame.len() > SNAPLEN {
            return Err(EncapError::FrameTooLong(frame.len()));
        }
        self.scratch[HEADROOM..HEADROOM + frame.len()].copy_from_slice(frame);
        Ok(())
    }

    /// Re-load a buffered packet and send it through `entry`.
    pub fn forward_buffered(
        &mut self,
        packet: &BufferedPacket,
        entry: &MapEntry,
        iid: u32,
    ) -> Result<usize, EncapError> {
        self.load_frame(&packet.frame)?;
        self.encapsulate(packet.packet.ip_len, packet.hash, entry, iid)
    }

    /// Encapsulate the inner IP packet (`ip_len` octets at `INNER_OFFSET`)
    /// towards one of `entry`'s RLOCs and send it. On success the entry's
    /// counters are updated and the datagram length is returned.
    pub fn encapsulate(
        &mut self,
        ip_len: usize,
        hash: u32,
        entry: &MapEntry,
        iid: u32,
    ) -> Result<usize, EncapError> {
        let rlocs = entry.rlocs().ok_or(EncapError::NoUsableRloc)?;
        let rloc = select_rloc(&rlocs, hash).ok_or(EncapError::NoUsableRloc)?;

        let inner_end = INNER_OFFSET + ip_len;
        if ip_len + ETHERNET_HDR_SIZE > SNAPLEN {
            return Err(EncapError::FrameTooLong(ip_len));
        }

        let mut header = LispHeader::new(hash, iid);
        let (lisp_start, end) = match &rloc.key {
            Some(key) => {
                let (iv, nonce) = self.iv.next();
                let tag = key
                    .aead()
                    .seal_in_place_separate_tag(
                        Nonce::assume_unique_for_key(nonce),
                        Aad::empty(),
                        &mut self.scratch[INNER_OFFSET..inner_end],
                    )
                    .map_err(|_| EncapError::Seal)?;
                self.scratch[inner_end..inner_end + GCM_TAG_SIZE].copy_from_slice(tag.as_ref());
                self.scratch[INNER_OFFSET - LISP_IV_SIZE..INNER_OFFSET].copy_from_slice(&iv);
                header = header.with_key_id(key.key_id());
                (
                    INNER_OFFSET - LISP_IV_SIZE - LISP_HDR_SIZE,
                    inner_end + GCM_TAG_SIZE,
                )
            }
            None => (INNER_OFFSET - LISP_HDR_SIZE, inner_end),
        };
        header.emit(&mut self.scratch[lisp_start..lisp_start + LISP_HDR_SIZE]);

        let udp_start = lisp_start - UDP_HDR_SIZE;
        let udp_len = end - udp_start;
        let udp_len16 = u16::try_from(udp_len).map_err(|_| EncapError::Oversize(udp_len))?;
        emit_udp(
            &mut self.scratch[udp_start..udp_start + UDP_HDR_SIZE],
            source_port(hash),
            udp_len16,
        );

        let sent = match rloc.address {
            IpAddr::V4(dst) => {
                // Checksum stays zero on IPv4
                self.egress.send_v4(&self.scratch[udp_start..end], dst)
            }
            IpAddr::V6(dst) => {
                let csum = udp_checksum_v6(&self.ipv6_source, &dst, &self.scratch[udp_start..end]);
                self.scratch[udp_start + 6..udp_start + 8].copy_from_slice(&csum.to_be_bytes());

                let ip_start = udp_start - IPV6_HDR_SIZE;
                emit_ipv6(
                    &mut self.scratch[ip_start..udp_start],
                    self.ipv6_source,
                    dst,
                    udp_len16,
                );
                self.egress.send_v6(&self.scratch[ip_start..end], dst)
            }
        }
        .map_err(|source| EncapError::Send {
            rloc: rloc.address,
            source,
        })?;

        entry.record_sent(sent);
        trace!(iid, rloc = %rloc.address, len = sent, "LISP datagram sent");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lisp::{LISP_DATA_PORT, LispHeader};
    use crate::map_cache::{MapCache, RlocKey};
    use crate::packet::decode_frame;
    use crate::test_util::RecordingEgress;
    use crate::test_util::packets::build_ipv6_udp;
    use ring::aead::{AES_256_GCM, LessSafeKey, UnboundKey};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    const KEY: [u8; 32] = [0x42; 32];

    fn rloc(addr: &str, priority: u8, weight: u8) -> Rloc {
        Rloc::new(addr.parse().unwrap(), priority, weight)
    }

    fn inner_frame() -> Vec<u8> {
        build_ipv6_udp(
            "fd00::1".parse().unwrap(),
            "fd00::2".parse().unwrap(),
            1000,
            2000,
            b"inner payload",
        )
    }

    fn resolved_entry(rlocs: Vec<Rloc>) -> std::sync::Arc<MapEntry> {
        let cache = MapCache::new();
        cache.install(42, "fd00::2/128".parse().unwrap(), rlocs).unwrap()
    }

    fn encapsulator() -> Encapsulator<RecordingEgress> {
        Encapsulator::with_iv(
            RecordingEgress::new(),
            "2001:db8::100".parse().unwrap(),
            IvState::new(0x0102_0304_0506_0708, 0x10),
        )
    }

    #[test]
    fn test_select_lowest_priority_tier() {
        let rlocs = vec![
            rloc("192.0.2.1", 2, 100),
            rloc("192.0.2.2", 1, 1),
            rloc("192.0.2.3", 3, 100),
        ];
        for hash in 0..32 {
            assert_eq!(
                select_rloc(&rlocs, hash).unwrap().address,
                "192.0.2.2".parse::<IpAddr>().unwrap()
            );
        }
    }

    #[test]
    fn test_select_weighted_prefix_sum() {
        let rlocs = vec![rloc("192.0.2.1", 1, 1), rloc("192.0.2.2", 1, 3)];
        let picks: Vec<_> = (0..8)
            .map(|h| select_rloc(&rlocs, h).unwrap().address.to_string())
            .collect();
        assert_eq!(
            picks,
            vec![
                "192.0.2.1", "192.0.2.2", "192.0.2.2", "192.0.2.2", "192.0.2.1", "192.0.2.2",
                "192.0.2.2", "192.0.2.2"
            ]
        );
    }

    #[test]
    fn test_select_zero_weights_split_evenly() {
        let rlocs = vec![rloc("192.0.2.1", 1, 0), rloc("192.0.2.2", 1, 0)];
        assert_eq!(select_rloc(&rlocs, 4).unwrap().address.to_string(), "192.0.2.1");
        assert_eq!(select_rloc(&rlocs, 5).unwrap().address.to_string(), "192.0.2.2");
    }

    #[test]
    fn test_select_skips_unusable() {
        let rlocs = vec![rloc("192.0.2.1", 255, 1), rloc("192.0.2.2", 200, 1)];
        assert_eq!(select_rloc(&rlocs, 0).unwrap().address.to_string(), "192.0.2.2");

        let unusable = vec![rloc("192.0.2.1", 255, 1)];
        assert!(select_rloc(&unusable, 0).is_none());
        assert!(select_rloc(&[], 0).is_none());
    }

    #[test]
    fn test_iv_state_advances() {
        let iv = IvState::new(0xaabb_ccdd_eeff_0011, u64::from(u32::MAX));
        let (field, nonce) = iv.next();
        assert_eq!(&field[..8], &0xaabb_ccdd_eeff_0011u64.to_be_bytes());
        assert_eq!(&field[8..], &(1u64 << 32).to_be_bytes());
        assert_eq!(&nonce[8..], &[0, 0, 0, 0]);

        let (_, nonce2) = iv.next();
        assert_eq!(&nonce2[8..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_encapsulate_ipv4_plaintext() {
        let entry = resolved_entry(vec![rloc("192.0.2.1", 1, 1)]);
        let mut encap = encapsulator();
        let frame = inner_frame();
        let pkt = decode_frame(&frame).unwrap();
        encap.load_frame(&frame).unwrap();

        let len = encap.encapsulate(pkt.ip_len, 0x1234_abcd, &entry, 42).unwrap();

        let sent = encap.egress().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dst, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let dgram = &sent[0].bytes;
        assert_eq!(dgram.len(), len);
        assert_eq!(len, UDP_HDR_SIZE + LISP_HDR_SIZE + pkt.ip_len);

        // UDP
        assert_eq!(u16::from_be_bytes([dgram[0], dgram[1]]), 0xabcd);
        assert_eq!(u16::from_be_bytes([dgram[2], dgram[3]]), LISP_DATA_PORT);
        assert_eq!(u16::from_be_bytes([dgram[4], dgram[5]]) as usize, len);
        assert_eq!(&dgram[6..8], &[0, 0]);

        // LISP
        let hdr = LispHeader::parse(&dgram[8..]).unwrap();
        assert_eq!(hdr.iid, 42);
        assert_eq!(hdr.key_id(), 0);

        // Inner
        assert_eq!(&dgram[16..], &frame[ETHERNET_HDR_SIZE..]);

        let counters = entry.counters();
        assert_eq!(counters.packets, 1);
        assert_eq!(counters.bytes, len as u64);
    }

    #[test]
    fn test_encapsulate_ipv6_outer_header() {
        let entry = resolved_entry(vec![rloc("2001:db8::7", 1, 1)]);
        let mut encap = encapsulator();
        let frame = inner_frame();
        let pkt = decode_frame(&frame).unwrap();
        encap.load_frame(&frame).unwrap();

        let len = encap.encapsulate(pkt.ip_len, 5, &entry, 42).unwrap();
        let sent = encap.egress().sent();
        let outer = &sent[0].bytes;
        assert_eq!(outer.len(), len);
        assert_eq!(len, IPV6_HDR_SIZE + UDP_HDR_SIZE + LISP_HDR_SIZE + pkt.ip_len);

        let decoded = crate::packet::decode_ipv6(outer).unwrap();
        assert_eq!(decoded.src, "2001:db8::100".parse::<Ipv6Addr>().unwrap());
        assert_eq!(decoded.dst, "2001:db8::7".parse::<Ipv6Addr>().unwrap());
        assert_eq!(decoded.ports, (0x8005u32 << 16) | LISP_DATA_PORT as u32);

        // A correct checksum folds to zero
        let udp = &outer[IPV6_HDR_SIZE..];
        assert_eq!(udp_checksum_v6(&decoded.src, &decoded.dst, udp), 0xffff);
        assert_eq!(&udp[16..], &frame[ETHERNET_HDR_SIZE..]);
    }

    #[test]
    fn test_encapsulate_encrypted_round_trip() {
        let key = RlocKey::new(1, &KEY).unwrap();
        let entry = resolved_entry(vec![rloc("192.0.2.1", 1, 1).with_key(key)]);
        let mut encap = encapsulator();
        let frame = inner_frame();
        let pkt = decode_frame(&frame).unwrap();
        encap.load_frame(&frame).unwrap();

        let len = encap.encapsulate(pkt.ip_len, 9, &entry, 42).unwrap();
        assert_eq!(
            len,
            UDP_HDR_SIZE + LISP_HDR_SIZE + LISP_IV_SIZE + pkt.ip_len + GCM_TAG_SIZE
        );

        let mut dgram = encap.egress().sent()[0].bytes.clone();
        let hdr = LispHeader::parse(&dgram[8..]).unwrap();
        assert_eq!(hdr.key_id(), 1);

        let iv_start = UDP_HDR_SIZE + LISP_HDR_SIZE;
        let iv: [u8; LISP_IV_SIZE] = dgram[iv_start..iv_start + LISP_IV_SIZE].try_into().unwrap();
        assert_eq!(&iv[..8], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&iv[8..], &0x11u64.to_be_bytes());

        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&iv[..8]);
        nonce[8..].copy_from_slice(&iv[12..]);

        let key = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &KEY).unwrap());
        let plain = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut dgram[iv_start + LISP_IV_SIZE..],
            )
            .unwrap();
        assert_eq!(plain, &frame[ETHERNET_HDR_SIZE..]);
    }

    #[test]
    fn test_encapsulate_unresolved_entry() {
        let cache = MapCache::new();
        let (entry, _) = cache.lookup_or_insert(42, "fd00::2".parse().unwrap(), Instant::now());
        let mut encap = encapsulator();
        encap.load_frame(&inner_frame()).unwrap();

        let err = encap.encapsulate(40, 0, &entry, 42).unwrap_err();
        assert!(matches!(err, EncapError::NoUsableRloc));
        assert!(encap.egress().sent().is_empty());
    }

    #[test]
    fn test_send_error_leaves_counters() {
        let entry = resolved_entry(vec![rloc("192.0.2.1", 1, 1)]);
        let mut encap = encapsulator();
        encap.egress().fail_sends(true);
        let frame = inner_frame();
        let pkt = decode_frame(&frame).unwrap();
        encap.load_frame(&frame).unwrap();

        let err = encap.encapsulate(pkt.ip_len, 0, &entry, 42).unwrap_err();
        assert!(matches!(err, EncapError::Send { .. }));
        assert_eq!(entry.counters().packets, 0);
        assert_eq!(entry.counters().bytes, 0);
    }

    #[test]
    fn test_same_hash_same_rloc() {
        let entry = resolved_entry(vec![
            rloc("192.0.2.1", 1, 1),
            rloc("192.0.2.2", 1, 1),
            rloc("192.0.2.3", 1, 1),
        ]);
        let mut encap = encapsulator();
        let frame = inner_frame();
        let pkt = decode_frame(&frame).unwrap();

        for _ in 0..5 {
            encap.load_frame(&frame).unwrap();
            encap.encapsulate(pkt.ip_len, 0xdead_beef, &entry, 42).unwrap();
        }
        let sent = encap.egress().sent();
        assert!(sent.iter().all(|s| s.dst == sent[0].dst));
    }
}
