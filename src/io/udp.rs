// io/udp.rs - socket setup, raw IPv4 capability detection and IP/UDP framing
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::DatagramSink;
use crate::buffer::PooledBuffer;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const FRAMING_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

const DEFAULT_TTL: u8 = 64;
const DONT_FRAGMENT: u16 = 0x4000;

/// Binds a non-blocking UDP socket and registers it with the current runtime.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Writes IPv4 and UDP headers for a datagram of `payload_len` bytes.
///
/// Both checksums are left zero: the kernel fills the IPv4 one and a zero
/// UDP checksum means "not computed" over IPv4. An unspecified source
/// address is likewise filled in by the kernel.
pub fn write_ipv4_udp_header(
    out: &mut [u8; FRAMING_LEN],
    source: SocketAddrV4,
    target: SocketAddrV4,
    payload_len: usize,
) -> io::Result<()> {
    let total = u16::try_from(FRAMING_LEN + payload_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram exceeds IPv4 length"))?;
    let udp_len = total - IPV4_HEADER_LEN as u16;

    out.fill(0);
    out[0] = 0x45;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    out[6..8].copy_from_slice(&DONT_FRAGMENT.to_be_bytes());
    out[8] = DEFAULT_TTL;
    out[9] = libc::IPPROTO_UDP as u8;
    out[12..16].copy_from_slice(&source.ip().octets());
    out[16..20].copy_from_slice(&target.ip().octets());

    let udp = &mut out[IPV4_HEADER_LEN..];
    udp[0..2].copy_from_slice(&source.port().to_be_bytes());
    udp[2..4].copy_from_slice(&target.port().to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    Ok(())
}

#[cfg(target_os = "linux")]
mod raw {
    use super::*;

    use socket2::SockAddr;
    use tokio::io::{unix::AsyncFd, Interest};

    /// Send-only raw IPv4 socket; datagrams carry caller-written IP/UDP headers.
    #[derive(Debug)]
    pub struct RawSender {
        fd: AsyncFd<Socket>,
        source: SocketAddrV4,
    }

    impl RawSender {
        pub fn open(source: SocketAddrV4) -> io::Result<Self> {
            let socket = Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(Protocol::from(libc::IPPROTO_RAW)),
            )?;
            socket.set_header_included_v4(true)?;
            socket.set_nonblocking(true)?;
            Ok(Self {
                fd: AsyncFd::with_interest(socket, Interest::WRITABLE)?,
                source,
            })
        }

        /// Prepends the framing into the buffer's reservation and sends it.
        /// Returns the number of envelope bytes sent.
        pub async fn send(&self, buf: &mut PooledBuffer, target: SocketAddrV4) -> io::Result<usize> {
            let mut header = [0u8; FRAMING_LEN];
            write_ipv4_udp_header(&mut header, self.source, target, buf.len())?;
            buf.prepend(&header)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

            let dest = SockAddr::from(SocketAddrV4::new(*target.ip(), 0));
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(buf.as_slice(), &dest)) {
                    Ok(result) => return result.map(|sent| sent.saturating_sub(FRAMING_LEN)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod raw {
    use super::*;

    #[derive(Debug)]
    pub struct RawSender;

    impl RawSender {
        pub fn open(_source: SocketAddrV4) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw IPv4 sockets not supported on this platform",
            ))
        }

        pub async fn send(&self, _buf: &mut PooledBuffer, _target: SocketAddrV4) -> io::Result<usize> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw IPv4 sockets not supported on this platform",
            ))
        }
    }
}

pub use raw::RawSender;

/// Outbound path chosen at startup.
#[derive(Debug)]
pub enum Outbound {
    Udp(Arc<UdpSocket>),
    /// IPv4 targets go through the raw socket; others use `udp`.
    Raw { raw: RawSender, udp: Arc<UdpSocket> },
}

impl Outbound {
    pub fn is_raw(&self) -> bool {
        matches!(self, Outbound::Raw { .. })
    }
}

impl DatagramSink for Outbound {
    async fn send_buffer(&self, buf: &mut PooledBuffer, target: SocketAddr) -> io::Result<usize> {
        match (self, target) {
            (Outbound::Raw { raw, .. }, SocketAddr::V4(v4)) => raw.send(buf, v4).await,
            (Outbound::Raw { udp, .. }, _) | (Outbound::Udp(udp), _) => {
                udp.send_to(buf.as_slice(), target).await
            }
        }
    }
}

/// Picks the outbound path, falling back to plain UDP when raw sockets are
/// unavailable (no privilege, IPv6 bind, unsupported platform).
pub fn open_outbound(udp: Arc<UdpSocket>, want_raw: bool) -> Outbound {
    if !want_raw {
        return Outbound::Udp(udp);
    }
    let source = match udp.local_addr() {
        Ok(SocketAddr::V4(v4)) => v4,
        Ok(addr) => {
            warn!(%addr, "raw socket mode needs an IPv4 bind; using udp");
            return Outbound::Udp(udp);
        }
        Err(err) => {
            warn!(?err, "could not read local address; using udp");
            return Outbound::Udp(udp);
        }
    };
    match RawSender::open(source) {
        Ok(raw) => {
            debug!(%source, "raw socket framing enabled");
            Outbound::Raw { raw, udp }
        }
        Err(err) => {
            warn!(?err, "raw socket unavailable; using udp");
            Outbound::Udp(udp)
        }
    }
}

/// Loopback address with an ephemeral port.
pub fn loopback_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}
