//! Test utilities for driving ITR workers without raw sockets
//!
//! `ChannelCapture` replays frames pushed through a channel and
//! `RecordingEgress` keeps every datagram the worker sends.

pub mod packets;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::capture::{CaptureError, CaptureInfo, CaptureWaker, PacketCapture};
use crate::egress::Egress;

// ============================================================================
// Egress
// ============================================================================

/// One datagram handed to the egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub dst: IpAddr,
    /// UDP header onward for IPv4, outer IPv6 header onward for IPv6
    pub bytes: Vec<u8>,
}

/// Egress that records datagrams instead of sending them.
///
/// Clones share the same log, so a test can keep one handle while the
/// worker owns another.
#[derive(Clone, Default)]
pub struct RecordingEgress {
    sent: Arc<Mutex<Vec<SentDatagram>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingEgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every datagram sent so far, in order.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Make subsequent sends fail with `ENETUNREACH`.
    pub fn fail_sends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `count` datagrams were sent.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sent_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.sent_count() >= count
    }

    fn record(&self, dst: IpAddr, bytes: &[u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(nix::libc::ENETUNREACH));
        }
        self.sent.lock().unwrap().push(SentDatagram {
            dst,
            bytes: bytes.to_vec(),
        });
        Ok(bytes.len())
    }
}

impl Egress for RecordingEgress {
    fn send_v4(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        self.record(IpAddr::V4(dst), datagram)
    }

    fn send_v6(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<usize> {
        self.record(IpAddr::V6(dst), packet)
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Capture fed from a channel.
///
/// Dropping every `FrameInjector` or closing the waker ends the capture.
pub struct ChannelCapture {
    rx: Receiver<Vec<u8>>,
    waker: CaptureWaker,
    poll_interval: Duration,
}

/// Sending half of a `ChannelCapture`.
#[derive(Clone)]
pub struct FrameInjector {
    tx: Sender<Vec<u8>>,
}

impl FrameInjector {
    /// Queue a frame as if the local endpoint had transmitted it.
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.tx.send(frame);
    }
}

impl ChannelCapture {
    pub fn new(poll_interval: Duration) -> (Self, FrameInjector) {
        let (tx, rx) = unbounded();
        (
            ChannelCapture {
                rx,
                waker: CaptureWaker::new(),
                poll_interval,
            },
            FrameInjector { tx },
        )
    }
}

impl PacketCapture for ChannelCapture {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<Option<CaptureInfo>, CaptureError> {
        if self.waker.is_closed() {
            return Err(CaptureError::Closed);
        }
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(CaptureInfo {
                    capture_length: len,
                    timestamp: Instant::now(),
                }))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn waker(&self) -> CaptureWaker {
        self.waker.clone()
    }
}
