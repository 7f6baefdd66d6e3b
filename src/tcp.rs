//! Non-blocking TCP, cooperatively blocking the calling coroutine.
//!
//! Every socket is switched to non-blocking mode at creation; whenever an
//! operation would block, the coroutine parks on a readiness event and the
//! scheduler keeps running everything else. Addresses go through the OS
//! resolver, so both IPv4 and IPv6 work wherever the resolver says so.
//!
//! Errors are reported as `false`/`None` returns; the OS error code of the
//! most recent failure is reachable through `std::io::Error::last_os_error`.
//! The [`io::Read`]/[`io::Write`] impls let embedders use the std adaptors
//! (`read_to_end`, `write_all`, `BufReader`, ...) directly on a stream.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};

use crate::wait::{wait, WatchedEvent};

/// A listening TCP socket.
pub struct TcpListener {
    inner: Option<net::TcpListener>,
}

/// A connected TCP stream.
pub struct TcpStream {
    inner: Option<net::TcpStream>,
}

fn nonblocking_socket(addr: SocketAddr) -> Option<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| debug!("socket creation failed: {}", e))
        .ok()?;
    sock.set_nonblocking(true).ok()?;
    Some(sock)
}

impl TcpListener {
    /// Bind and listen on `(host, port)`. Port zero picks an ephemeral
    /// port; see [`local_addr`](Self::local_addr).
    pub fn bind(host: &str, port: u16) -> Option<TcpListener> {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("resolve {}:{} failed: {}", host, port, e);
                return None;
            }
        };
        for addr in addrs {
            let Some(sock) = nonblocking_socket(addr) else {
                continue;
            };
            let bound = sock
                .set_reuse_address(true)
                .and_then(|_| sock.bind(&addr.into()))
                .and_then(|_| sock.listen(5));
            match bound {
                Ok(()) => {
                    let inner: net::TcpListener = sock.into();
                    trace!("fd {}: listening on {}", inner.as_raw_fd(), addr);
                    return Some(TcpListener { inner: Some(inner) });
                }
                Err(e) => debug!("listen on {} failed: {}", addr, e),
            }
        }
        None
    }

    /// Block the current coroutine until a client connects.
    pub fn accept(&self) -> Option<TcpStream> {
        loop {
            let listener = self.inner.as_ref()?;
            let fd = listener.as_raw_fd();
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("fd {}: accepted {} (fd {})", fd, peer, stream.as_raw_fd());
                    if stream.set_nonblocking(true).is_err() {
                        return None;
                    }
                    return Some(TcpStream { inner: Some(stream) });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("fd {}: waiting for a connection", fd);
                    let events = [WatchedEvent::can_read(fd)];
                    wait(&events);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("fd {}: accept failed: {}", fd, e);
                    return None;
                }
            }
        }
    }

    /// The locally bound address, if the listener is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref()?.local_addr().ok()
    }

    /// Is the listener still open?
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Close the listening socket.
    pub fn close(&mut self) {
        if let Some(l) = self.inner.take() {
            trace!("fd {}: closed", l.as_raw_fd());
        }
    }
}

fn connect_one(addr: SocketAddr) -> Option<net::TcpStream> {
    let sock = nonblocking_socket(addr)?;
    let fd = sock.as_raw_fd();
    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            trace!("fd {}: connect to {} in progress", fd, addr);
            let events = [WatchedEvent::can_write(fd)];
            wait(&events);
            // Writability alone does not mean connected; ask the socket.
            match sock.take_error() {
                Ok(None) => {}
                Ok(Some(err)) => {
                    if err.raw_os_error() != Some(libc::ECONNREFUSED) {
                        debug!("fd {}: connect to {} failed: {}", fd, addr, err);
                    }
                    return None;
                }
                Err(err) => {
                    debug!("fd {}: connect to {} failed: {}", fd, addr, err);
                    return None;
                }
            }
        }
        Err(e) => {
            debug!("fd {}: connect to {} failed: {}", fd, addr, e);
            return None;
        }
    }
    trace!("fd {}: connected to {}", fd, addr);
    Some(sock.into())
}

impl TcpStream {
    /// Connect to `(host, port)`, blocking the current coroutine while the
    /// handshake is in flight. Tries every resolved address in order.
    pub fn connect(host: &str, port: u16) -> Option<TcpStream> {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("resolve {}:{} failed: {}", host, port, e);
                return None;
            }
        };
        for addr in addrs {
            if let Some(stream) = connect_one(addr) {
                return Some(TcpStream { inner: Some(stream) });
            }
        }
        None
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        Some(self.inner.as_ref()?.as_raw_fd())
    }

    /// Is the stream still open?
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// The peer's address, if connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref()?.peer_addr().ok()
    }

    /// The local address, if connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref()?.local_addr().ok()
    }

    /// Send all of `buf`, blocking as needed. `false` on any error or if
    /// the stream closes midway.
    pub fn send(&self, buf: &[u8]) -> bool {
        let mut sent = 0;
        while sent < buf.len() {
            let Some(s) = self.inner.as_ref() else {
                return false;
            };
            match (&mut &*s).write(&buf[sent..]) {
                Ok(0) => return false,
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let events = [WatchedEvent::can_write(s.as_raw_fd())];
                    wait(&events);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("fd {}: send failed: {}", s.as_raw_fd(), e);
                    return false;
                }
            }
        }
        true
    }

    /// Receive exactly `buf.len()` bytes. `false` on error or if the peer
    /// closes before the buffer fills.
    pub fn recv(&self, buf: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(s) = self.inner.as_ref() else {
                return false;
            };
            match (&mut &*s).read(&mut buf[filled..]) {
                Ok(0) => return false,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let events = [WatchedEvent::can_read(s.as_raw_fd())];
                    wait(&events);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("fd {}: recv failed: {}", s.as_raw_fd(), e);
                    return false;
                }
            }
        }
        true
    }

    /// Receive whatever is available, up to `buf.len()` bytes, blocking
    /// until at least something arrives. `Some(0)` is an orderly EOF,
    /// `None` an error.
    pub fn recv_up_to(&self, buf: &mut [u8]) -> Option<usize> {
        loop {
            let s = self.inner.as_ref()?;
            match (&mut &*s).read(buf) {
                Ok(n) => return Some(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let events = [WatchedEvent::can_read(s.as_raw_fd())];
                    wait(&events);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("fd {}: recv failed: {}", s.as_raw_fd(), e);
                    return None;
                }
            }
        }
    }

    /// Close the stream.
    pub fn close(&mut self) {
        if let Some(s) = self.inner.take() {
            trace!("fd {}: closed", s.as_raw_fd());
        }
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(s) = self.inner.as_ref() else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream is closed"));
            };
            match (&mut &*s).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let events = [WatchedEvent::can_read(s.as_raw_fd())];
                    wait(&events);
                }
                other => return other,
            }
        }
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let Some(s) = self.inner.as_ref() else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream is closed"));
            };
            match (&mut &*s).write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let events = [WatchedEvent::can_write(s.as_raw_fd())];
                    wait(&events);
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_ref() {
            Some(mut s) => s.flush(),
            None => Ok(()),
        }
    }
}
