//! Packet capture on an application-facing interface
//!
//! The ITR only wants packets the local endpoints transmit, and only IPv6.
//! On Linux this is an `AF_PACKET` socket bound to the interface with
//! `ETH_P_IPV6`, in promiscuous mode, keeping frames whose packet type is
//! `PACKET_OUTGOING`.
//!
//! A read polls the socket together with an eventfd. Firing the eventfd
//! through a `CaptureWaker` closes the capture from another thread and
//! unblocks a pending read.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::net::if_::if_nametoindex;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info};

use crate::lisp::SNAPLEN;

/// Frames drained per readiness event before returning to the caller
const MAX_SKIPPED_PER_READ: usize = 64;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("capture closed")]
    Closed,
    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Metadata of one captured frame.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    pub capture_length: usize,
    pub timestamp: Instant,
}

/// A source of captured Ethernet frames.
pub trait PacketCapture: Send {
    /// Wait up to one poll interval for a frame and copy it into `buf`.
    ///
    /// `Ok(None)` means the deadline passed without a frame. `Closed` is
    /// terminal.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<Option<CaptureInfo>, CaptureError>;

    /// Handle that closes this capture from another thread.
    fn waker(&self) -> CaptureWaker;
}

struct WakerInner {
    closed: AtomicBool,
    eventfd: Option<EventFd>,
}

/// Closes a capture and wakes its reader.
#[derive(Clone)]
pub struct CaptureWaker {
    inner: Arc<WakerInner>,
}

impl CaptureWaker {
    /// Waker for captures that poll a closed flag only.
    pub fn new() -> Self {
        CaptureWaker {
            inner: Arc::new(WakerInner {
                closed: AtomicBool::new(false),
                eventfd: None,
            }),
        }
    }

    fn with_eventfd(eventfd: EventFd) -> Self {
        CaptureWaker {
            inner: Arc::new(WakerInner {
                closed: AtomicBool::new(false),
                eventfd: Some(eventfd),
            }),
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(efd) = &self.inner.eventfd {
            let _ = efd.write(1);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn eventfd(&self) -> Option<&EventFd> {
        self.inner.eventfd.as_ref()
    }
}

impl Default for CaptureWaker {
    fn default() -> Self {
        Self::new()
    }
}

/// `AF_PACKET` capture of outgoing IPv6 frames on one interface.
pub struct AfPacketCapture {
    ifname: String,
    socket: Socket,
    waker: CaptureWaker,
    poll_interval: Duration,
}

impl AfPacketCapture {
    /// Open a capture on `ifname`. Requires `CAP_NET_RAW`.
    pub fn open(ifname: &str, poll_interval: Duration) -> Result<Self, CaptureError> {
        let if_index = if_nametoindex(ifname)
            .map_err(|_| CaptureError::InterfaceNotFound(ifname.to_string()))?;
        let proto = (libc::ETH_P_IPV6 as u16).to_be();

        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(proto as libc::c_int)),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(4 * SNAPLEN)?;

        // Bind to the interface; the protocol restricts us to IPv6 frames
        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = proto;
        sll.sll_ifindex = if_index as libc::c_int;
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
        mreq.mr_ifindex = if_index as libc::c_int;
        mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;

        info!(ifname, if_index, "Packet capture enabled");
        Ok(AfPacketCapture {
            ifname: ifname.to_string(),
            socket,
            waker: CaptureWaker::with_eventfd(eventfd),
            poll_interval,
        })
    }

    /// Receive until an outgoing frame arrives or the socket would block.
    fn recv_outgoing(&self, buf: &mut [u8]) -> Result<Option<CaptureInfo>, CaptureError> {
        for _ in 0..MAX_SKIPPED_PER_READ {
            let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut sll_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.socket.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut sll_len,
                )
            };
            if n < 0 {
                match Errno::last() {
                    Errno::EAGAIN | Errno::EINTR => return Ok(None),
                    errno => return Err(io::Error::from(errno).into()),
                }
            }
            if sll.sll_pkttype != libc::PACKET_OUTGOING {
                continue;
            }
            return Ok(Some(CaptureInfo {
                capture_length: n as usize,
                timestamp: Instant::now(),
            }));
        }
        Ok(None)
    }
}

impl PacketCapture for AfPacketCapture {
    fn read_into(&mut self, buf: &mut [u8]) -> Result<Option<CaptureInfo>, CaptureError> {
        if self.waker.is_closed() {
            return Err(CaptureError::Closed);
        }
        if let Some(info) = self.recv_outgoing(buf)? {
            return Ok(Some(info));
        }

        let timeout = u16::try_from(self.poll_interval.as_millis()).unwrap_or(u16::MAX);
        let (sock_events, wake_events) = {
            let mut fds = vec![PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
            if let Some(efd) = self.waker.eventfd() {
                fds.push(PollFd::new(efd.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, PollTimeout::from(timeout)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(None),
                Ok(_) => {}
                Err(errno) => return Err(io::Error::from(errno).into()),
            }
            (
                fds[0].revents().unwrap_or(PollFlags::empty()),
                fds.get(1)
                    .and_then(|fd| fd.revents())
                    .unwrap_or(PollFlags::empty()),
            )
        };

        if self.waker.is_closed() || wake_events.contains(PollFlags::POLLIN) {
            debug!(ifname = %self.ifname, "Capture closed by waker");
            return Err(CaptureError::Closed);
        }
        if sock_events.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            let err = self
                .socket
                .take_error()?
                .unwrap_or_else(|| io::Error::other("capture socket hung up"));
            return Err(err.into());
        }
        self.recv_outgoing(buf)
    }

    fn waker(&self) -> CaptureWaker {
        self.waker.clone()
    }
}
