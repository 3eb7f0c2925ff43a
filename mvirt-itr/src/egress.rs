//! Raw egress sockets for encapsulated datagrams
//!
//! - IPv4: `SOCK_RAW`/`IPPROTO_UDP`, the kernel prepends the outer IPv4 header
//! - IPv6: `SOCK_RAW`/`IPPROTO_RAW`, we write the outer IPv6 header ourselves
//!
//! Both sockets get a 64 KiB send buffer and path-MTU discovery disabled.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Kernel send buffer size for both egress sockets
pub const EGRESS_SNDBUF: usize = 64 * 1024;

/// Sink for encapsulated datagrams.
pub trait Egress: Send {
    /// Send a UDP datagram (UDP header onward) to an IPv4 RLOC.
    fn send_v4(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize>;

    /// Send a full IPv6 packet (outer IPv6 header onward) to an IPv6 RLOC.
    fn send_v6(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<usize>;
}

/// The raw IPv4/IPv6 socket pair. Closed on drop.
pub struct EgressSockets {
    v4: Socket,
    v6: Socket,
}

impl EgressSockets {
    /// Create and configure both sockets. Requires `CAP_NET_RAW`.
    ///
    /// Only socket creation is fatal; option failures are logged.
    pub fn open() -> io::Result<Self> {
        let v4 = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
        if let Err(e) = v4.set_send_buffer_size(EGRESS_SNDBUF) {
            warn!(error = %e, "Setting IPv4 egress send buffer size failed");
        }
        if let Err(e) = set_int_opt(
            v4.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DONT,
        ) {
            warn!(error = %e, "Disabling IPv4 path MTU discovery failed");
        }
        if let Err(e) = set_int_opt(v4.as_raw_fd(), libc::IPPROTO_IP, libc::IP_HDRINCL, 0) {
            warn!(error = %e, "Disabling IP_HDRINCL failed");
        }

        let v6 = Socket::new(
            Domain::IPV6,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )?;
        if let Err(e) = v6.set_send_buffer_size(EGRESS_SNDBUF) {
            warn!(error = %e, "Setting IPv6 egress send buffer size failed");
        }
        if let Err(e) = set_int_opt(
            v6.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_DONT,
        ) {
            warn!(error = %e, "Disabling IPv6 path MTU discovery failed");
        }

        debug!("Egress sockets ready");
        Ok(EgressSockets { v4, v6 })
    }
}

impl Egress for EgressSockets {
    fn send_v4(&mut self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        // Port is ignored for raw sockets; the UDP header carries it
        let addr = SocketAddrV4::new(dst, 0);
        self.v4.send_to(datagram, &addr.into())
    }

    fn send_v6(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<usize> {
        let addr = SocketAddrV6::new(dst, 0, 0, 0);
        self.v6.send_to(packet, &addr.into())
    }
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
