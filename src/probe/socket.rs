//! Raw socket access for SYN probes.
//!
//! The prober never touches sockets directly: it asks a [`SocketProvider`]
//! for a [`ProbeSocket`] per candidate and drops it when the candidate is
//! done. Production code uses [`RawSocketProvider`], which needs
//! `CAP_NET_RAW`; tests substitute an in-memory provider.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::ProbeError;

/// A socket that sends hand-built IPv4 packets and receives inbound TCP
/// segments with their IP header.
#[async_trait]
pub trait ProbeSocket: Send + Sync {
    async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Creates probe sockets.
pub trait SocketProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn ProbeSocket>, ProbeError>;
}

/// Opens `AF_INET/SOCK_RAW/IPPROTO_TCP` sockets with `IP_HDRINCL`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketProvider;

impl RawSocketProvider {
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for RawSocketProvider {
    fn open(&self) -> Result<Box<dyn ProbeSocket>, ProbeError> {
        Ok(Box::new(RawSocket::open()?))
    }
}

struct RawSocket {
    inner: AsyncFd<Socket>,
}

impl RawSocket {
    fn open() -> Result<Self, ProbeError> {
        let socket =
            Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)).map_err(socket_error)?;
        // The kernel sends our IPv4 header as-is.
        socket
            .set_header_included_v4(true)
            .map_err(socket_error)?;
        socket.set_nonblocking(true).map_err(ProbeError::Socket)?;

        let inner = AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)
            .map_err(ProbeError::Socket)?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl ProbeSocket for RawSocket {
    async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let target = SockAddr::from(SocketAddrV4::new(destination, 0));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(packet, &target)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Classify a socket error, separating out missing privilege.
fn socket_error(e: io::Error) -> ProbeError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        ProbeError::PermissionDenied
    } else {
        ProbeError::Socket(e)
    }
}

/// Best guess at the host's outbound IPv4 address: the local end of a
/// connected (but unused) UDP socket.
pub fn discover_local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_unspecified() => Ok(v4),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no routable IPv4 source address (got {other})"),
        )),
    }
}
