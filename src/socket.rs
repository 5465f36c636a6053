//! TCP socket backend: thin wrapper over `tokio::net` sockets, with the
//! one knob `tokio` itself doesn't expose — marking the v6 listener
//! `IPV6_V6ONLY` — set through `socket2` before handing the raw socket
//! to `tokio`.

use std::net::SocketAddr;

use socket2::{Domain, Socket as Socket2, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::*;

pub struct Listener {
    inner: TcpListener,
}

pub struct Socket {
    inner: TcpStream,
}

/// Binds a listening socket at `addr`. For `SocketAddr::V6`, the socket
/// is marked `IPV6_V6ONLY` so it never also serves v4 traffic.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Listener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket2::new(domain, Type::STREAM, None).wrapped(ErrorKind::UvError)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true).wrapped(ErrorKind::UvError)?;
    }
    sock.set_reuse_address(true).wrapped(ErrorKind::UvError)?;
    sock.set_nonblocking(true).wrapped(ErrorKind::UvError)?;
    sock.bind(&addr.into()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            Error::wrapped(ErrorKind::EAddrInUse, e)
        } else {
            Error::wrapped(ErrorKind::UvError, e)
        }
    })?;
    sock.listen(backlog as i32).wrapped(ErrorKind::UvError)?;
    let std_listener: std::net::TcpListener = sock.into();
    let inner = TcpListener::from_std(std_listener).wrapped(ErrorKind::UvError)?;
    Ok(Listener { inner })
}

pub async fn connect(addr: SocketAddr) -> Result<Socket> {
    let inner = TcpStream::connect(addr).await.map_err(|e| {
        if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
        ) {
            Error::wrapped(ErrorKind::CannotConnect, e)
        } else {
            Error::wrapped(ErrorKind::UvError, e)
        }
    })?;
    let _ = inner.set_nodelay(true);
    Ok(Socket { inner })
}

impl Listener {
    pub async fn accept(&self) -> Result<(Socket, SocketAddr)> {
        let (inner, peer) = self.inner.accept().await.wrapped(ErrorKind::Fatal)?;
        let _ = inner.set_nodelay(true);
        Ok((Socket { inner }, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().wrapped(ErrorKind::UvError)
    }
}

impl Socket {
    pub fn into_inner(self) -> TcpStream {
        self.inner
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().wrapped(ErrorKind::UvError)
    }
}
