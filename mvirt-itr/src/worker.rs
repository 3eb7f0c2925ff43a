//! Per-interface ITR worker
//!
//! Each capture interface gets its own OS thread that:
//! - waits until the interface's instance ID has EIDs
//! - captures outgoing IPv6 frames and drops spoofed sources
//! - looks the destination EID up in the shared map-cache
//! - encapsulates towards an RLOC, or buffers and punts on a miss
//!
//! The worker blocks only in the capture poll and in the EID wait, both
//! bounded, so a terminate request is seen within one poll interval. With
//! the capture waker it is seen immediately.

use std::collections::HashSet;
use std::io;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{AfPacketCapture, CaptureError, CaptureWaker, PacketCapture};
use crate::config::{ItrConfig, SEND_ERROR_LOG_EVERY};
use crate::egress::{Egress, EgressSockets};
use crate::encap::{EncapError, Encapsulator};
use crate::map_cache::{BufferedPacket, EnqueueResult, MapCache, MapEntry};
use crate::packet::{DecodedPacket, ETHERNET_HDR_SIZE, decode_frame, flow_hash};
use crate::punt::{PuntEmitter, PuntError, PuntMessage};
use crate::registry::{EidRegistry, UNKNOWN_IID};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to open egress sockets: {0}")]
    Egress(#[source] io::Error),
    #[error("interface {0} has no instance ID")]
    UnknownInterface(String),
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker thread panicked")]
    Panicked,
}

/// Per-worker drop and forwarding counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    decode_drops: AtomicU64,
    spoof_drops: AtomicU64,
    forwarded: AtomicU64,
    buffered: AtomicU64,
    encap_drops: AtomicU64,
    send_errors: AtomicU64,
    punts: AtomicU64,
    punt_drops: AtomicU64,
}

/// Point-in-time copy of `WorkerStats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Frames that were not decodable IPv6
    pub decode_drops: u64,
    /// Frames whose source is not a local EID
    pub spoof_drops: u64,
    /// Datagrams handed to the egress
    pub forwarded: u64,
    /// Packets placed in an entry buffer
    pub buffered: u64,
    /// Packets with no usable RLOC or that failed to encapsulate
    pub encap_drops: u64,
    pub send_errors: u64,
    pub punts: u64,
    /// Punts lost to a full or closed channel
    pub punt_drops: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            decode_drops: self.decode_drops.load(Ordering::Relaxed),
            spoof_drops: self.spoof_drops.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            encap_drops: self.encap_drops.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            punts: self.punts.load(Ordering::Relaxed),
            punt_drops: self.punt_drops.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub map_cache: Arc<MapCache>,
    pub registry: Arc<dyn EidRegistry>,
    pub punt: PuntEmitter,
    pub config: ItrConfig,
}

/// The ITR loop for one interface.
pub struct ItrWorker<C, E> {
    ifname: String,
    capture: C,
    encap: Encapsulator<E>,
    ctx: WorkerContext,
    terminate: Receiver<()>,
    stats: Arc<WorkerStats>,
}

impl<C: PacketCapture, E: Egress> ItrWorker<C, E> {
    /// Build a worker. Sending on, or dropping the sender of, `terminate`
    /// stops it.
    pub fn new(
        ifname: &str,
        capture: C,
        egress: E,
        ctx: WorkerContext,
        terminate: Receiver<()>,
    ) -> Self {
        let encap = Encapsulator::new(egress, ctx.config.ipv6_source_or_unspecified());
        ItrWorker {
            ifname: ifname.to_string(),
            capture,
            encap,
            ctx,
            terminate,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until terminated or the capture fails.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let iid = self.ctx.registry.lookup_iface_iid(&self.ifname);
        if iid == UNKNOWN_IID {
            error!(ifname = %self.ifname, "Interface has no instance ID");
            return Err(WorkerError::UnknownInterface(self.ifname));
        }

        let Some(eids) = self.wait_for_eids(iid) else {
            info!(ifname = %self.ifname, "ITR worker terminated before EIDs were available");
            return Ok(());
        };
        info!(ifname = %self.ifname, iid, eids = eids.len(), "ITR worker started");

        loop {
            if self.terminated() {
                break;
            }

            let info = match self.capture.read_into(self.encap.frame_mut()) {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(CaptureError::Closed) if self.terminated() => break,
                Err(e) => {
                    error!(ifname = %self.ifname, error = %e, "Packet capture failed");
                    return Err(e.into());
                }
            };

            // Terminate wins over a ready packet
            if self.terminated() {
                break;
            }
            if info.capture_length == 0 {
                continue;
            }

            self.handle_frame(iid, &eids, info.capture_length, info.timestamp);
        }

        info!(ifname = %self.ifname, "ITR worker received terminate");
        Ok(())
    }

    fn terminated(&self) -> bool {
        !matches!(self.terminate.try_recv(), Err(TryRecvError::Empty))
    }

    /// Poll the registry until the instance has EIDs. `None` if terminated
    /// while waiting.
    fn wait_for_eids(&self, iid: u32) -> Option<HashSet<Ipv6Addr>> {
        loop {
            if let Some(eids) = self.ctx.registry.lookup_iface_eids(iid) {
                return Some(eids.into_iter().collect());
            }
            debug!(ifname = %self.ifname, iid, "Re-trying EID lookup");
            match self
                .terminate
                .recv_timeout(self.ctx.config.eid_retry_interval)
            {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn handle_frame(
        &mut self,
        iid: u32,
        eids: &HashSet<Ipv6Addr>,
        capture_length: usize,
        timestamp: Instant,
    ) {
        let packet = match decode_frame(self.encap.frame(capture_length)) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_drops.fetch_add(1, Ordering::Relaxed);
                trace!(ifname = %self.ifname, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        if !eids.contains(&packet.src) {
            self.stats.spoof_drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                ifname = %self.ifname,
                src = %packet.src,
                "Dropping packet with a source that is not a local EID"
            );
            return;
        }

        let hash = flow_hash(&packet);
        self.forward(iid, &packet, hash, timestamp);
    }

    /// The packet sits in the scratch buffer.
    fn forward(&mut self, iid: u32, packet: &DecodedPacket, hash: u32, now: Instant) {
        self.forward_with(iid, packet, hash, now, || {});
    }

    /// `forward`, running `before_enqueue` between a miss and buffering.
    pub(crate) fn forward_with(
        &mut self,
        iid: u32,
        packet: &DecodedPacket,
        hash: u32,
        now: Instant,
        before_enqueue: impl FnOnce(),
    ) {
        let map_cache = Arc::clone(&self.ctx.map_cache);

        let (entry, mut punt) = map_cache.lookup_or_insert(iid, packet.dst, now);
        if entry.is_resolved() {
            self.send(iid, packet.ip_len, hash, &entry);
        } else {
            before_enqueue();
            self.buffer(&entry, packet, hash);

            // The controller may have resolved the entry after our lookup and
            // drained before our enqueue
            let (current, punt_again) = map_cache.lookup_or_insert(iid, packet.dst, now);
            punt |= punt_again;

            if current.is_resolved() {
                if let Some(buffered) = entry.try_dequeue() {
                    self.send_buffered(iid, &buffered, &current);
                }
            } else if let Some(default) = map_cache.lookup_default(iid).filter(|d| d.is_resolved()) {
                self.send(iid, packet.ip_len, hash, &default);
            }
        }

        if punt {
            self.punt(packet);
        }
    }

    fn buffer(&self, entry: &MapEntry, packet: &DecodedPacket, hash: u32) {
        let frame = self
            .encap
            .frame(ETHERNET_HDR_SIZE + packet.ip_len)
            .to_vec();
        match entry.enqueue(BufferedPacket {
            frame,
            packet: *packet,
            hash,
        }) {
            EnqueueResult::Buffered => {
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
            }
            EnqueueResult::Dropped => {
                trace!(ifname = %self.ifname, dst = %packet.dst, "Entry buffer full, dropping");
            }
        }
    }

    fn send(&mut self, iid: u32, ip_len: usize, hash: u32, entry: &MapEntry) {
        let result = self.encap.encapsulate(ip_len, hash, entry, iid);
        self.account(result, entry);
    }

    fn send_buffered(&mut self, iid: u32, packet: &BufferedPacket, entry: &MapEntry) {
        let result = self.encap.forward_buffered(packet, entry, iid);
        self.account(result, entry);
    }

    fn account(&self, result: Result<usize, EncapError>, entry: &MapEntry) {
        match result {
            Ok(_) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(EncapError::Send { rloc, source }) => {
                let n = self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                if n % SEND_ERROR_LOG_EVERY == 0 {
                    warn!(
                        ifname = %self.ifname,
                        %rloc,
                        error = %source,
                        total = n + 1,
                        "Failed to send LISP datagram"
                    );
                }
            }
            Err(e) => {
                self.stats.encap_drops.fetch_add(1, Ordering::Relaxed);
                debug!(
                    ifname = %self.ifname,
                    prefix = %entry.prefix(),
                    error = %e,
                    "Dropping packet"
                );
            }
        }
    }

    fn punt(&self, packet: &DecodedPacket) {
        let msg = PuntMessage::discovery(packet.dst, packet.src, &self.ifname);
        match self.ctx.punt.emit(&msg) {
            Ok(()) => {
                self.stats.punts.fetch_add(1, Ordering::Relaxed);
                debug!(ifname = %self.ifname, dst = %packet.dst, "Punted map-cache miss");
            }
            Err(PuntError::Serialize(e)) => {
                error!(ifname = %self.ifname, error = %e, "Failed to serialize punt");
            }
            Err(e) => {
                self.stats.punt_drops.fetch_add(1, Ordering::Relaxed);
                warn!(ifname = %self.ifname, dst = %packet.dst, error = %e, "Dropping punt");
            }
        }
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    /// Interface name
    pub ifname: String,
    thread: Option<JoinHandle<Result<(), WorkerError>>>,
    terminate: Sender<()>,
    waker: CaptureWaker,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wake it if it is polling.
    pub fn terminate(&self) {
        let _ = self.terminate.try_send(());
        self.waker.close();
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| WorkerError::Panicked)?,
            None => Ok(()),
        }
    }

    /// Terminate, join, and return the final counters.
    pub fn shutdown(self) -> (WorkerStatsSnapshot, Result<(), WorkerError>) {
        self.terminate();
        let stats = Arc::clone(&self.stats);
        let result = self.join();
        (stats.snapshot(), result)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a worker thread over the given capture and egress.
pub fn spawn<C, E>(
    ifname: &str,
    capture: C,
    egress: E,
    ctx: WorkerContext,
) -> Result<WorkerHandle, WorkerError>
where
    C: PacketCapture + 'static,
    E: Egress + 'static,
{
    let (terminate_tx, terminate_rx) = bounded(1);
    let waker = capture.waker();
    let worker = ItrWorker::new(ifname, capture, egress, ctx, terminate_rx);
    let stats = worker.stats();

    let thread_ifname = ifname.to_string();
    let thread = thread::Builder::new()
        .name(format!("itr-{ifname}"))
        .spawn(move || {
            let result = worker.run();
            if let Err(e) = &result {
                error!(ifname = %thread_ifname, error = %e, "ITR worker failed");
            }
            result
        })
        .map_err(WorkerError::Spawn)?;

    Ok(WorkerHandle {
        ifname: ifname.to_string(),
        thread: Some(thread),
        terminate: terminate_tx,
        waker,
        stats,
    })
}

/// Open the capture and egress sockets for `ifname` and spawn its worker.
pub fn spawn_af_packet(ifname: &str, ctx: WorkerContext) -> Result<WorkerHandle, WorkerError> {
    let capture = AfPacketCapture::open(ifname, ctx.config.poll_interval)?;
    let egress = EgressSockets::open().map_err(WorkerError::Egress)?;
    spawn(ifname, capture, egress, ctx)
}
