//! Shared EID-to-RLOC map-cache
//!
//! The map-cache is shared between ITR workers (readers that also create
//! unresolved entries on a miss) and the controller (which resolves and
//! invalidates entries). The spine is a per-IID prefix trie behind an
//! `RwLock`; each entry is handed out as an `Arc<MapEntry>` and is safe to
//! use without the spine lock:
//! - counters and the punt timestamp are atomics
//! - pending packets sit in a lock-free bounded queue
//! - the RLOC set is published through an `ArcSwapOption`
//!
//! Entry lifecycle: `absent -> unresolved -> resolved -> absent`. Resolution
//! is never undone; `invalidate` removes the entry and the next miss creates
//! a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam_queue::ArrayQueue;
use ipnet::Ipv6Net;
use prefix_trie::PrefixMap;
use ring::aead::{AES_256_GCM, LessSafeKey, UnboundKey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::egress::Egress;
use crate::encap::Encapsulator;
use crate::packet::DecodedPacket;

/// Maximum packets buffered per unresolved entry
pub const PKT_BUFFER_CAPACITY: usize = 10;

/// Minimum time between two punts for the same unresolved entry
pub const DEFAULT_PUNT_INTERVAL: Duration = Duration::from_secs(1);

/// RLOC priority meaning "do not use" (RFC 6830)
pub const PRIORITY_UNUSABLE: u8 = 255;

#[derive(Debug, Error)]
pub enum MapCacheError {
    #[error("refusing to resolve {iid}/{prefix} with an empty RLOC set")]
    EmptyRlocSet { iid: u32, prefix: Ipv6Net },
    #[error("invalid AES-256-GCM key material")]
    InvalidKey,
}

/// Address family of an RLOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlocFamily {
    V4,
    V6,
}

/// Encryption key shared with the ETR behind an RLOC.
pub struct RlocKey {
    key_id: u8,
    key: LessSafeKey,
}

impl RlocKey {
    /// Build a key from 32 octets of AES-256 key material.
    pub fn new(key_id: u8, material: &[u8; 32]) -> Result<Self, MapCacheError> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, material).map_err(|_| MapCacheError::InvalidKey)?;
        Ok(RlocKey {
            key_id,
            key: LessSafeKey::new(unbound),
        })
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub(crate) fn aead(&self) -> &LessSafeKey {
        &self.key
    }
}

impl fmt::Debug for RlocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RlocKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// A routing locator record.
#[derive(Debug, Clone)]
pub struct Rloc {
    pub address: IpAddr,
    /// Lower wins
    pub priority: u8,
    /// Share of traffic within a priority tier
    pub weight: u8,
    pub key: Option<Arc<RlocKey>>,
}

impl Rloc {
    pub fn new(address: IpAddr, priority: u8, weight: u8) -> Self {
        Rloc {
            address,
            priority,
            weight,
            key: None,
        }
    }

    pub fn with_key(mut self, key: RlocKey) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn family(&self) -> RlocFamily {
        match self.address {
            IpAddr::V4(_) => RlocFamily::V4,
            IpAddr::V6(_) => RlocFamily::V6,
        }
    }
}

/// A packet held while its entry is unresolved.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    /// Captured Ethernet frame, trimmed to the IP packet length
    pub frame: Vec<u8>,
    pub packet: DecodedPacket,
    pub hash: u32,
}

/// Outcome of `MapEntry::enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Buffered,
    Dropped,
}

/// Point-in-time copy of an entry's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryCounters {
    pub packets: u64,
    pub bytes: u64,
    pub buffered_pkts: u64,
    pub tail_drops: u64,
}

/// One map-cache entry.
pub struct MapEntry {
    iid: u32,
    prefix: Ipv6Net,
    rlocs: ArcSwapOption<Vec<Rloc>>,
    pkt_buffer: ArrayQueue<BufferedPacket>,
    packets: AtomicU64,
    bytes: AtomicU64,
    buffered_pkts: AtomicU64,
    tail_drops: AtomicU64,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last punt
    last_punt_at: AtomicU64,
}

impl MapEntry {
    fn new(iid: u32, prefix: Ipv6Net, now: Instant, capacity: usize) -> Self {
        MapEntry {
            iid,
            prefix,
            rlocs: ArcSwapOption::empty(),
            pkt_buffer: ArrayQueue::new(capacity.max(1)),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            buffered_pkts: AtomicU64::new(0),
            tail_drops: AtomicU64::new(0),
            created_at: now,
            last_punt_at: AtomicU64::new(0),
        }
    }

    pub fn iid(&self) -> u32 {
        self.iid
    }

    pub fn prefix(&self) -> Ipv6Net {
        self.prefix
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_resolved(&self) -> bool {
        self.rlocs.load().is_some()
    }

    /// Current RLOC set, `None` while unresolved.
    pub fn rlocs(&self) -> Option<Arc<Vec<Rloc>>> {
        self.rlocs.load_full()
    }

    /// Buffer a packet; never blocks. A full buffer drops the new packet.
    pub fn enqueue(&self, packet: BufferedPacket) -> EnqueueResult {
        // Count first so a racing dequeue never takes the counter below zero
        self.buffered_pkts.fetch_add(1, Ordering::Relaxed);
        match self.pkt_buffer.push(packet) {
            Ok(()) => EnqueueResult::Buffered,
            Err(_) => {
                self.buffered_pkts.fetch_sub(1, Ordering::Relaxed);
                self.tail_drops.fetch_add(1, Ordering::Relaxed);
                EnqueueResult::Dropped
            }
        }
    }

    /// Take the oldest buffered packet; never blocks.
    pub fn try_dequeue(&self) -> Option<BufferedPacket> {
        let packet = self.pkt_buffer.pop()?;
        self.buffered_pkts.fetch_sub(1, Ordering::Relaxed);
        Some(packet)
    }

    pub fn counters(&self) -> EntryCounters {
        EntryCounters {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            buffered_pkts: self.buffered_pkts.load(Ordering::Relaxed),
            tail_drops: self.tail_drops.load(Ordering::Relaxed),
        }
    }

    /// Account one successfully sent datagram.
    pub fn record_sent(&self, wire_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    fn install(&self, rlocs: Vec<Rloc>) {
        self.rlocs.store(Some(Arc::new(rlocs)));
    }

    /// Claim the punt slot if the entry is still unresolved and the last
    /// punt is older than `interval`. At most one caller wins per slot.
    fn punt_due(&self, now: Instant, interval: Duration) -> bool {
        if self.is_resolved() {
            return false;
        }
        let now_ns = now.saturating_duration_since(self.created_at).as_nanos() as u64;
        let interval_ns = interval.as_nanos() as u64;
        let last = self.last_punt_at.load(Ordering::Acquire);
        if now_ns <= last.saturating_add(interval_ns) {
            return false;
        }
        self.last_punt_at
            .compare_exchange(last, now_ns, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for MapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapEntry")
            .field("iid", &self.iid)
            .field("prefix", &self.prefix)
            .field("resolved", &self.is_resolved())
            .field("counters", &self.counters())
            .finish()
    }
}

/// Summary of an entry for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub iid: u32,
    pub prefix: Ipv6Net,
    pub resolved: bool,
    pub rloc_count: usize,
    pub counters: EntryCounters,
}

/// Map-cache tuning.
#[derive(Debug, Clone)]
pub struct MapCacheConfig {
    pub buffer_capacity: usize,
    pub punt_interval: Duration,
}

impl Default for MapCacheConfig {
    fn default() -> Self {
        MapCacheConfig {
            buffer_capacity: PKT_BUFFER_CAPACITY,
            punt_interval: DEFAULT_PUNT_INTERVAL,
        }
    }
}

/// The `::/0` default route.
pub fn default_route() -> Ipv6Net {
    Ipv6Net::default()
}

fn host_prefix(eid: Ipv6Addr) -> Ipv6Net {
    Ipv6Net::from(eid)
}

/// Per-IID prefix tables.
type Spine = HashMap<u32, PrefixMap<Ipv6Net, Arc<MapEntry>>>;

/// Shared map-cache.
pub struct MapCache {
    tables: RwLock<Spine>,
    config: MapCacheConfig,
}

impl MapCache {
    pub fn new() -> Self {
        Self::with_config(MapCacheConfig::default())
    }

    pub fn with_config(config: MapCacheConfig) -> Self {
        MapCache {
            tables: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &MapCacheConfig {
        &self.config
    }

    /// Longest non-default prefix covering `eid`.
    fn find(tables: &Spine, iid: u32, eid: Ipv6Addr) -> Option<Arc<MapEntry>> {
        let table = tables.get(&iid)?;
        table
            .get_lpm(&host_prefix(eid))
            .filter(|(prefix, _)| prefix.prefix_len() > 0)
            .map(|(_, entry)| Arc::clone(entry))
    }

    /// Return the entry covering `(iid, eid)`, inserting an unresolved host
    /// entry on a miss. The flag tells the caller to punt: always on insert,
    /// and again once per punt interval while the entry stays unresolved.
    pub fn lookup_or_insert(&self, iid: u32, eid: Ipv6Addr, now: Instant) -> (Arc<MapEntry>, bool) {
        {
            let tables = self.tables.read().unwrap();
            if let Some(entry) = Self::find(&tables, iid, eid) {
                let punt = entry.punt_due(now, self.config.punt_interval);
                return (entry, punt);
            }
        }

        let mut tables = self.tables.write().unwrap();
        // Another worker may have inserted it while we waited for the lock
        if let Some(entry) = Self::find(&tables, iid, eid) {
            let punt = entry.punt_due(now, self.config.punt_interval);
            return (entry, punt);
        }

        let prefix = host_prefix(eid);
        let entry = Arc::new(MapEntry::new(
            iid,
            prefix,
            now,
            self.config.buffer_capacity,
        ));
        tables
            .entry(iid)
            .or_insert_with(PrefixMap::new)
            .insert(prefix, Arc::clone(&entry));
        debug!(iid, %eid, "Map-cache miss, created unresolved entry");
        (entry, true)
    }

    /// Exact-match lookup without insertion.
    pub fn get(&self, iid: u32, prefix: Ipv6Net) -> Option<Arc<MapEntry>> {
        let tables = self.tables.read().unwrap();
        tables.get(&iid)?.get(&prefix.trunc()).cloned()
    }

    /// The `(iid, ::/0)` entry, if any. Never inserts.
    pub fn lookup_default(&self, iid: u32) -> Option<Arc<MapEntry>> {
        self.get(iid, default_route())
    }

    /// Install `rlocs` for `(iid, prefix)` and mark the entry resolved,
    /// creating it if absent. Buffered packets are left for the caller.
    ///
    /// Unresolved entries strictly inside a non-default `prefix` would shadow
    /// it in longest-prefix match, so they are removed and their buffered
    /// packets move to the installed entry, oldest first.
    pub fn install(
        &self,
        iid: u32,
        prefix: Ipv6Net,
        rlocs: Vec<Rloc>,
    ) -> Result<Arc<MapEntry>, MapCacheError> {
        let prefix = prefix.trunc();
        if rlocs.is_empty() {
            return Err(MapCacheError::EmptyRlocSet { iid, prefix });
        }

        let mut tables = self.tables.write().unwrap();
        let table = tables.entry(iid).or_insert_with(PrefixMap::new);
        let entry = match table.get(&prefix) {
            Some(entry) => Arc::clone(entry),
            None => {
                let entry = Arc::new(MapEntry::new(
                    iid,
                    prefix,
                    Instant::now(),
                    self.config.buffer_capacity,
                ));
                table.insert(prefix, Arc::clone(&entry));
                entry
            }
        };

        let shadowed: Vec<Ipv6Net> = if prefix.prefix_len() > 0 {
            table
                .iter()
                .filter(|(p, e)| **p != prefix && prefix.contains(*p) && !e.is_resolved())
                .map(|(p, _)| *p)
                .collect()
        } else {
            Vec::new()
        };
        for covered in &shadowed {
            if let Some(old) = table.remove(covered) {
                while let Some(packet) = old.try_dequeue() {
                    entry.enqueue(packet);
                }
            }
        }

        // Still under the spine lock: a worker re-checking an entry removed
        // above must find this one resolved.
        entry.install(rlocs);
        drop(tables);

        info!(
            iid,
            %prefix,
            rlocs = entry.rlocs().map_or(0, |r| r.len()),
            superseded = shadowed.len(),
            "Map-cache entry resolved"
        );
        Ok(entry)
    }

    /// Resolve `(iid, prefix)` and drain its buffered packets, in enqueue
    /// order, through `encap`. Packets of superseded host entries are
    /// drained too. Returns the number of packets sent.
    pub fn resolve<E: Egress>(
        &self,
        iid: u32,
        prefix: Ipv6Net,
        rlocs: Vec<Rloc>,
        encap: &mut Encapsulator<E>,
    ) -> Result<usize, MapCacheError> {
        let entry = self.install(iid, prefix, rlocs)?;

        let mut sent = 0;
        while let Some(packet) = entry.try_dequeue() {
            match encap.forward_buffered(&packet, &entry, iid) {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(iid, prefix = %entry.prefix(), error = %e, "Failed to send buffered packet");
                }
            }
        }
        if sent > 0 {
            debug!(iid, prefix = %entry.prefix(), sent, "Drained buffered packets");
        }
        Ok(sent)
    }

    /// Remove `(iid, prefix)`. Buffered packets go with it.
    pub fn invalidate(&self, iid: u32, prefix: Ipv6Net) -> Option<Arc<MapEntry>> {
        let prefix = prefix.trunc();
        let mut tables = self.tables.write().unwrap();
        let table = tables.get_mut(&iid)?;
        let removed = table.remove(&prefix);
        if table.iter().next().is_none() {
            tables.remove(&iid);
        }
        if removed.is_some() {
            info!(iid, %prefix, "Map-cache entry invalidated");
        }
        removed
    }

    /// Drop unresolved entries created more than `max_age` before `now`.
    pub fn purge_unresolved(&self, now: Instant, max_age: Duration) -> usize {
        let mut purged = 0;
        let mut tables = self.tables.write().unwrap();
        for table in tables.values_mut() {
            table.retain(|_, entry| {
                let stale = !entry.is_resolved()
                    && now.saturating_duration_since(entry.created_at()) > max_age;
                if stale {
                    purged += 1;
                }
                !stale
            });
        }
        tables.retain(|_, table| table.iter().next().is_some());
        if purged > 0 {
            debug!(purged, "Purged stale unresolved map-cache entries");
        }
        purged
    }

    /// Every entry with its counters.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let tables = self.tables.read().unwrap();
        let mut entries: Vec<EntrySnapshot> = tables
            .iter()
            .flat_map(|(iid, table)| {
                table.iter().map(move |(prefix, entry)| EntrySnapshot {
                    iid: *iid,
                    prefix: *prefix,
                    resolved: entry.is_resolved(),
                    rloc_count: entry.rlocs().map_or(0, |r| r.len()),
                    counters: entry.counters(),
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.iid, e.prefix));
        entries
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.read().unwrap();
        tables.values().map(|t| t.iter().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MapCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_frame;
    use crate::test_util::RecordingEgress;
    use crate::test_util::packets::build_ipv6_udp;
    use std::net::Ipv4Addr;
    use std::thread;

    fn eid(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn buffered(dst: &str, sport: u16) -> BufferedPacket {
        let frame = build_ipv6_udp(eid("fd00::1"), eid(dst), sport, 2000, b"data");
        let packet = decode_frame(&frame).unwrap();
        BufferedPacket {
            frame,
            packet,
            hash: sport as u32,
        }
    }

    fn v4_rloc(last: u8) -> Rloc {
        Rloc::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 1, 1)
    }

    #[test]
    fn test_lookup_or_insert_creates_unresolved() {
        let cache = MapCache::new();
        let now = Instant::now();

        let (entry, punt) = cache.lookup_or_insert(42, eid("fd00::2"), now);
        assert!(punt);
        assert!(!entry.is_resolved());
        assert_eq!(entry.prefix(), "fd00::2/128".parse().unwrap());
        assert_eq!(cache.len(), 1);

        let (again, punt) = cache.lookup_or_insert(42, eid("fd00::2"), now);
        assert!(!punt);
        assert!(Arc::ptr_eq(&entry, &again));
    }

    #[test]
    fn test_iids_are_separate() {
        let cache = MapCache::new();
        let now = Instant::now();
        let (a, _) = cache.lookup_or_insert(1, eid("fd00::2"), now);
        let (b, punt) = cache.lookup_or_insert(2, eid("fd00::2"), now);
        assert!(punt);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_punt_rate_limit() {
        let cache = MapCache::with_config(MapCacheConfig {
            punt_interval: Duration::from_millis(500),
            ..Default::default()
        });
        let t0 = Instant::now();

        let (_, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0);
        assert!(punt);
        let (_, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0 + Duration::from_millis(200));
        assert!(!punt);
        let (_, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0 + Duration::from_millis(600));
        assert!(punt);
        let (_, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0 + Duration::from_millis(700));
        assert!(!punt);
        let (_, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0 + Duration::from_millis(1200));
        assert!(punt);
    }

    #[test]
    fn test_no_punt_once_resolved() {
        let cache = MapCache::new();
        let t0 = Instant::now();
        cache.lookup_or_insert(42, eid("fd00::2"), t0);
        cache
            .install(42, "fd00::2/128".parse().unwrap(), vec![v4_rloc(1)])
            .unwrap();

        let (entry, punt) = cache.lookup_or_insert(42, eid("fd00::2"), t0 + Duration::from_secs(60));
        assert!(entry.is_resolved());
        assert!(!punt);
    }

    #[test]
    fn test_enqueue_tail_drop() {
        let cache = MapCache::new();
        let (entry, _) = cache.lookup_or_insert(42, eid("fd00::3"), Instant::now());

        for sport in 0..PKT_BUFFER_CAPACITY as u16 {
            assert_eq!(entry.enqueue(buffered("fd00::3", sport)), EnqueueResult::Buffered);
        }
        assert_eq!(entry.enqueue(buffered("fd00::3", 99)), EnqueueResult::Dropped);

        let counters = entry.counters();
        assert_eq!(counters.buffered_pkts, 10);
        assert_eq!(counters.tail_drops, 1);

        // The overflow did not displace the oldest packet
        let first = entry.try_dequeue().unwrap();
        assert_eq!(first.hash, 0);
        assert_eq!(entry.counters().buffered_pkts, 9);
    }

    #[test]
    fn test_dequeue_empty() {
        let cache = MapCache::new();
        let (entry, _) = cache.lookup_or_insert(42, eid("fd00::3"), Instant::now());
        assert!(entry.try_dequeue().is_none());
        assert_eq!(entry.counters(), EntryCounters::default());
    }

    #[test]
    fn test_prefix_entry_covers_hosts() {
        let cache = MapCache::new();
        cache
            .install(7, "fd00:1::/48".parse().unwrap(), vec![v4_rloc(1)])
            .unwrap();

        let (entry, punt) = cache.lookup_or_insert(7, eid("fd00:1::99"), Instant::now());
        assert!(!punt);
        assert!(entry.is_resolved());
        assert_eq!(entry.prefix(), "fd00:1::/48".parse().unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_prefix_resolve_supersedes_unresolved_host_entry() {
        let cache = MapCache::new();
        let t0 = Instant::now();
        let (host, punt) = cache.lookup_or_insert(7, eid("fd00:1::99"), t0);
        assert!(punt);
        host.enqueue(buffered("fd00:1::99", 1));
        host.enqueue(buffered("fd00:1::99", 2));

        let egress = RecordingEgress::new();
        let mut encap = Encapsulator::new(egress.clone(), Ipv6Addr::UNSPECIFIED);
        let sent = cache
            .resolve(7, "fd00:1::/48".parse().unwrap(), vec![v4_rloc(1)], &mut encap)
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(egress.sent_count(), 2);
        assert_eq!(host.counters().buffered_pkts, 0);

        let (entry, punt) = cache.lookup_or_insert(7, eid("fd00:1::99"), t0 + Duration::from_secs(5));
        assert!(!punt);
        assert!(entry.is_resolved());
        assert_eq!(entry.prefix(), "fd00:1::/48".parse().unwrap());
        assert_eq!(entry.counters().packets, 2);
        assert_eq!(entry.counters().buffered_pkts, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_prefix_install_keeps_resolved_and_outside_entries() {
        let cache = MapCache::new();
        let now = Instant::now();
        cache
            .install(7, "fd00:1::5/128".parse().unwrap(), vec![v4_rloc(5)])
            .unwrap();
        let (outside, _) = cache.lookup_or_insert(7, eid("fd00:2::1"), now);
        let (other_iid, _) = cache.lookup_or_insert(8, eid("fd00:1::6"), now);

        cache
            .install(7, "fd00:1::/48".parse().unwrap(), vec![v4_rloc(1)])
            .unwrap();

        let more_specific = cache.get(7, "fd00:1::5/128".parse().unwrap()).unwrap();
        assert_eq!(more_specific.rlocs().unwrap()[0].address.to_string(), "192.0.2.5");
        assert!(Arc::ptr_eq(&cache.get(7, outside.prefix()).unwrap(), &outside));
        assert!(Arc::ptr_eq(&cache.get(8, other_iid.prefix()).unwrap(), &other_iid));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_default_route_install_keeps_host_entries() {
        let cache = MapCache::new();
        let (host, _) = cache.lookup_or_insert(42, eid("fd00::4"), Instant::now());
        host.enqueue(buffered("fd00::4", 1));

        cache.install(42, default_route(), vec![v4_rloc(7)]).unwrap();

        assert!(Arc::ptr_eq(&cache.get(42, host.prefix()).unwrap(), &host));
        assert_eq!(host.counters().buffered_pkts, 1);
    }

    #[test]
    fn test_default_route_never_matches_host_lookup() {
        let cache = MapCache::new();
        cache.install(42, default_route(), vec![v4_rloc(7)]).unwrap();

        let (entry, punt) = cache.lookup_or_insert(42, eid("fd00::4"), Instant::now());
        assert!(punt);
        assert!(!entry.is_resolved());
        assert_eq!(entry.prefix().prefix_len(), 128);

        let default = cache.lookup_default(42).unwrap();
        assert!(default.is_resolved());
        assert!(cache.lookup_default(43).is_none());
    }

    #[test]
    fn test_install_rejects_empty_rlocs() {
        let cache = MapCache::new();
        let err = cache
            .install(42, "fd00::2/128".parse().unwrap(), vec![])
            .unwrap_err();
        assert!(matches!(err, MapCacheError::EmptyRlocSet { iid: 42, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = MapCache::new();
        let now = Instant::now();
        let (old, _) = cache.lookup_or_insert(42, eid("fd00::2"), now);
        cache
            .install(42, "fd00::2/128".parse().unwrap(), vec![v4_rloc(1)])
            .unwrap();

        assert!(cache.invalidate(42, "fd00::2/128".parse().unwrap()).is_some());
        assert!(cache.is_empty());
        assert!(cache.invalidate(42, "fd00::2/128".parse().unwrap()).is_none());

        // Old handle stays resolved; the next miss builds a fresh entry
        assert!(old.is_resolved());
        let (fresh, punt) = cache.lookup_or_insert(42, eid("fd00::2"), now);
        assert!(punt);
        assert!(!fresh.is_resolved());
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[test]
    fn test_purge_unresolved() {
        let cache = MapCache::new();
        let t0 = Instant::now();
        cache.lookup_or_insert(42, eid("fd00::2"), t0);
        cache.lookup_or_insert(42, eid("fd00::3"), t0 + Duration::from_secs(50));
        cache
            .install(42, "fd00::9/128".parse().unwrap(), vec![v4_rloc(1)])
            .unwrap();

        let purged = cache.purge_unresolved(t0 + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(purged, 1);

        let remaining: Vec<_> = cache.snapshot().into_iter().map(|e| e.prefix).collect();
        assert_eq!(
            remaining,
            vec![
                "fd00::3/128".parse::<Ipv6Net>().unwrap(),
                "fd00::9/128".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_snapshot_reports_counters() {
        let cache = MapCache::new();
        let (entry, _) = cache.lookup_or_insert(42, eid("fd00::2"), Instant::now());
        entry.enqueue(buffered("fd00::2", 1));
        entry.record_sent(120);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].resolved);
        assert_eq!(snapshot[0].rloc_count, 0);
        assert_eq!(
            snapshot[0].counters,
            EntryCounters {
                packets: 1,
                bytes: 120,
                buffered_pkts: 1,
                tail_drops: 0,
            }
        );
    }

    #[test]
    fn test_concurrent_lookup_single_punt() {
        let cache = Arc::new(MapCache::new());
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.lookup_or_insert(42, eid("fd00::2"), now).1)
            })
            .collect();

        let punts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|p| *p)
            .count();
        assert_eq!(punts, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_enqueue_respects_capacity() {
        let cache = Arc::new(MapCache::new());
        let (entry, _) = cache.lookup_or_insert(42, eid("fd00::3"), Instant::now());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || {
                    for i in 0..25u16 {
                        entry.enqueue(buffered("fd00::3", t * 100 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let counters = entry.counters();
        assert_eq!(counters.buffered_pkts, 10);
        assert_eq!(counters.tail_drops, 90);
    }

    #[test]
    fn test_buffered_counter_never_underflows() {
        let cache = Arc::new(MapCache::new());
        let (entry, _) = cache.lookup_or_insert(42, eid("fd00::3"), Instant::now());
        let packet = buffered("fd00::3", 1);

        let producer = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                for _ in 0..20_000 {
                    entry.enqueue(packet.clone());
                }
            })
        };
        let consumer = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                for _ in 0..20_000 {
                    entry.try_dequeue();
                }
            })
        };

        while !producer.is_finished() || !consumer.is_finished() {
            let buffered_pkts = entry.counters().buffered_pkts;
            assert!(buffered_pkts <= PKT_BUFFER_CAPACITY as u64 + 2, "{buffered_pkts}");
        }
        producer.join().unwrap();
        consumer.join().unwrap();

        let mut left = 0;
        while entry.try_dequeue().is_some() {
            left += 1;
        }
        assert_eq!(entry.counters().buffered_pkts, 0);
        assert!(left <= PKT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_rloc_key_debug_hides_material() {
        let key = RlocKey::new(1, &[7u8; 32]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("key_id: 1"));
        assert!(!rendered.contains('7'));
    }
}
