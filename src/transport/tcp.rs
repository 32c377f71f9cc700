//! Framed TCP realization of the three messaging patterns.
//!
//! Every endpoint runs in non-blocking mode. Messages travel as frames with a
//! u32 little-endian length prefix so message boundaries survive the stream.
//! Server endpoints accept any number of peers and contain per-connection
//! failures by dropping the connection; client endpoints treat a broken
//! connection as a channel error, which the backend escalates to its fault
//! handler (the fail-fast stance of the protocol).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, warn};

use super::{Channel, ChannelError, Subscription};

const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame; anything larger marks the connection dead.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A subscriber that falls this far behind is dropped rather than buffered
/// without bound.
const MAX_BUFFERED_OUTPUT: usize = 4 * 1024 * 1024;

/// Addresses are URI-style; only the `tcp://` scheme is supported and a bare
/// `host:port` is accepted as shorthand.
fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("tcp://").unwrap_or(addr)
}

fn oversized(len: usize) -> ChannelError {
    ChannelError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("frame of {len} bytes exceeds maximum of {MAX_FRAME_BYTES}"),
    ))
}

/// One non-blocking connection carrying length-prefixed frames, with inbound
/// and outbound buffering for partial transfers.
struct FramedStream {
    stream: TcpStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    dead: bool,
}

impl FramedStream {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(FramedStream { stream, rbuf: Vec::new(), wbuf: Vec::new(), dead: false })
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Move whatever the socket has ready into the read buffer.
    fn fill(&mut self) {
        if self.dead {
            return;
        }
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.dead = true;
                    return;
                }
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "connection read failed");
                    self.dead = true;
                    return;
                }
            }
        }
    }

    /// Extract one complete frame from the read buffer, if present.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.rbuf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len =
            u32::from_le_bytes([self.rbuf[0], self.rbuf[1], self.rbuf[2], self.rbuf[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            debug!(len, "oversized frame, dropping connection");
            self.dead = true;
            return None;
        }
        if self.rbuf.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        let frame = self.rbuf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.rbuf.drain(..FRAME_HEADER_LEN + len);
        Some(frame)
    }

    fn queue_frame(&mut self, payload: &[u8]) {
        self.wbuf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.wbuf.extend_from_slice(payload);
    }

    /// Write as much buffered output as the socket accepts.
    fn flush(&mut self) {
        if self.dead {
            return;
        }
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => {
                    self.dead = true;
                    return;
                }
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "connection write failed");
                    self.dead = true;
                    return;
                }
            }
        }
    }
}

fn connect_stream(addr: &str) -> io::Result<FramedStream> {
    FramedStream::new(TcpStream::connect(strip_scheme(addr))?)
}

/// Listener plus the set of live accepted connections, identified by stable
/// ids so references survive reaping.
struct Acceptor {
    listener: TcpListener,
    conns: Vec<(u64, FramedStream)>,
    next_id: u64,
}

impl Acceptor {
    fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(strip_scheme(addr))?;
        listener.set_nonblocking(true)?;
        Ok(Acceptor { listener, conns: Vec::new(), next_id: 0 })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match FramedStream::new(stream) {
                    Ok(conn) => {
                        debug!(%peer, "accepted connection");
                        self.conns.push((self.next_id, conn));
                        self.next_id += 1;
                    }
                    Err(e) => warn!(error = %e, "failed to prepare accepted connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn conn_mut(&mut self, id: u64) -> Option<&mut FramedStream> {
        self.conns.iter_mut().find(|(cid, _)| *cid == id).map(|(_, c)| c)
    }

    fn flush_all(&mut self) {
        for (_, conn) in &mut self.conns {
            conn.flush();
        }
    }

    fn reap(&mut self) {
        self.conns.retain(|(_, conn)| !conn.dead);
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        out.push(self.listener.as_raw_fd());
        for (_, conn) in &self.conns {
            out.push(conn.fd());
        }
    }

    fn buffered_write_fds(&self, out: &mut Vec<RawFd>) {
        for (_, conn) in &self.conns {
            if !conn.wbuf.is_empty() {
                out.push(conn.fd());
            }
        }
    }

    fn has_buffered_output(&self) -> bool {
        self.conns.iter().any(|(_, conn)| !conn.wbuf.is_empty())
    }
}

/// Server end of the lock-step pattern. Receives one request from any peer
/// and pins that peer until the reply has been handed over; no second request
/// is surfaced while a reply is owed.
pub struct TcpReply {
    acceptor: Acceptor,
    pinned: Option<u64>,
}

impl TcpReply {
    pub fn bind(addr: &str) -> io::Result<Self> {
        Ok(TcpReply { acceptor: Acceptor::bind(addr)?, pinned: None })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl Channel for TcpReply {
    fn pump(&mut self) -> Result<(), ChannelError> {
        self.acceptor.accept_new();
        self.acceptor.flush_all();
        // A pinned peer that died releases the reply obligation.
        if let Some(id) = self.pinned {
            if self.acceptor.conn_mut(id).map_or(true, |c| c.dead) {
                self.pinned = None;
            }
        }
        self.acceptor.reap();
        Ok(())
    }

    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(oversized(frame.len()));
        }
        let Some(id) = self.pinned.take() else {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no request awaiting a reply",
            )));
        };
        match self.acceptor.conn_mut(id) {
            Some(conn) => {
                conn.queue_frame(frame);
                conn.flush();
            }
            // The requester vanished; its reply is dropped.
            None => debug!("reply peer gone, dropping response"),
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        if self.pinned.is_some() {
            return Err(ChannelError::WouldBlock);
        }
        self.acceptor.accept_new();
        for (_, conn) in &mut self.acceptor.conns {
            conn.fill();
        }
        for (id, conn) in &mut self.acceptor.conns {
            if let Some(frame) = conn.take_frame() {
                self.pinned = Some(*id);
                return Ok(frame);
            }
        }
        self.acceptor.reap();
        Err(ChannelError::WouldBlock)
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        self.acceptor.read_fds(out);
    }

    fn write_fds(&self, out: &mut Vec<RawFd>) {
        if let Some(id) = self.pinned {
            if let Some((_, conn)) = self.acceptor.conns.iter().find(|(cid, _)| *cid == id) {
                out.push(conn.fd());
            }
        }
        self.acceptor.buffered_write_fds(out);
    }

    fn has_buffered_output(&self) -> bool {
        self.acceptor.has_buffered_output()
    }
}

/// Server end of the broadcast pattern: every frame fans out to every
/// connected subscriber. Filtering happens subscriber-side.
pub struct TcpPublisher {
    acceptor: Acceptor,
}

impl TcpPublisher {
    pub fn bind(addr: &str) -> io::Result<Self> {
        Ok(TcpPublisher { acceptor: Acceptor::bind(addr)? })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of currently connected subscribers. Connections are only
    /// discovered during [`Channel::pump`] or a send.
    pub fn peer_count(&self) -> usize {
        self.acceptor.conns.len()
    }
}

impl Channel for TcpPublisher {
    fn pump(&mut self) -> Result<(), ChannelError> {
        self.acceptor.accept_new();
        self.acceptor.flush_all();
        for (_, conn) in &mut self.acceptor.conns {
            if conn.wbuf.len() > MAX_BUFFERED_OUTPUT {
                warn!("dropping slow subscriber");
                conn.dead = true;
            }
        }
        self.acceptor.reap();
        Ok(())
    }

    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(oversized(frame.len()));
        }
        self.acceptor.accept_new();
        for (_, conn) in &mut self.acceptor.conns {
            conn.queue_frame(frame);
            conn.flush();
        }
        self.acceptor.reap();
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "publishers do not receive",
        )))
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        // The listener only; subscriber connections are write-only.
        out.push(self.acceptor.listener.as_raw_fd());
    }

    fn write_fds(&self, out: &mut Vec<RawFd>) {
        for (_, conn) in &self.acceptor.conns {
            out.push(conn.fd());
        }
    }

    fn has_buffered_output(&self) -> bool {
        self.acceptor.has_buffered_output()
    }
}

/// Server end of the pipeline pattern. Receives from any pusher, round-robin
/// across connections so one busy peer cannot starve the rest.
pub struct TcpPull {
    acceptor: Acceptor,
    next_conn: usize,
}

impl TcpPull {
    pub fn bind(addr: &str) -> io::Result<Self> {
        Ok(TcpPull { acceptor: Acceptor::bind(addr)?, next_conn: 0 })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl Channel for TcpPull {
    fn pump(&mut self) -> Result<(), ChannelError> {
        self.acceptor.accept_new();
        self.acceptor.reap();
        Ok(())
    }

    fn try_send(&mut self, _frame: &[u8]) -> Result<(), ChannelError> {
        Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "pull endpoints do not send",
        )))
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.acceptor.accept_new();
        for (_, conn) in &mut self.acceptor.conns {
            conn.fill();
        }
        let n = self.acceptor.conns.len();
        if n > 0 {
            for i in 0..n {
                let idx = (self.next_conn + i) % n;
                if let Some(frame) = self.acceptor.conns[idx].1.take_frame() {
                    self.next_conn = idx + 1;
                    return Ok(frame);
                }
            }
        }
        self.acceptor.reap();
        Err(ChannelError::WouldBlock)
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        self.acceptor.read_fds(out);
    }
}

/// Client end of the lock-step pattern.
pub struct TcpRequest {
    conn: FramedStream,
}

impl TcpRequest {
    pub fn connect(addr: &str) -> io::Result<Self> {
        Ok(TcpRequest { conn: connect_stream(addr)? })
    }
}

impl Channel for TcpRequest {
    fn pump(&mut self) -> Result<(), ChannelError> {
        self.conn.flush();
        client_liveness(&self.conn)
    }

    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        client_send(&mut self.conn, frame)
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.conn.flush();
        self.conn.fill();
        if let Some(frame) = self.conn.take_frame() {
            return Ok(frame);
        }
        client_liveness(&self.conn)?;
        Err(ChannelError::WouldBlock)
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        out.push(self.conn.fd());
    }

    fn write_fds(&self, out: &mut Vec<RawFd>) {
        out.push(self.conn.fd());
    }

    fn has_buffered_output(&self) -> bool {
        !self.conn.wbuf.is_empty()
    }
}

/// Client end of the broadcast pattern, with prefix filtering on receive.
pub struct TcpSubscriber {
    conn: FramedStream,
    filters: Vec<Vec<u8>>,
}

impl TcpSubscriber {
    pub fn connect(addr: &str) -> io::Result<Self> {
        Ok(TcpSubscriber { conn: connect_stream(addr)?, filters: Vec::new() })
    }
}

impl Channel for TcpSubscriber {
    fn pump(&mut self) -> Result<(), ChannelError> {
        client_liveness(&self.conn)
    }

    fn try_send(&mut self, _frame: &[u8]) -> Result<(), ChannelError> {
        Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "subscribers do not send",
        )))
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.conn.fill();
        while let Some(frame) = self.conn.take_frame() {
            if self.filters.iter().any(|p| frame.starts_with(p)) {
                return Ok(frame);
            }
        }
        client_liveness(&self.conn)?;
        Err(ChannelError::WouldBlock)
    }

    fn read_fds(&self, out: &mut Vec<RawFd>) {
        out.push(self.conn.fd());
    }
}

impl Subscription for TcpSubscriber {
    fn subscribe(&mut self, prefix: &[u8]) {
        self.filters.push(prefix.to_vec());
    }

    fn unsubscribe(&mut self, prefix: &[u8]) {
        self.filters.retain(|p| p != prefix);
    }
}

/// Client end of the pipeline pattern.
pub struct TcpPush {
    conn: FramedStream,
}

impl TcpPush {
    pub fn connect(addr: &str) -> io::Result<Self> {
        Ok(TcpPush { conn: connect_stream(addr)? })
    }
}

impl Channel for TcpPush {
    fn pump(&mut self) -> Result<(), ChannelError> {
        self.conn.flush();
        client_liveness(&self.conn)
    }

    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        client_send(&mut self.conn, frame)
    }

    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "push endpoints do not receive",
        )))
    }

    fn write_fds(&self, out: &mut Vec<RawFd>) {
        out.push(self.conn.fd());
    }

    fn has_buffered_output(&self) -> bool {
        !self.conn.wbuf.is_empty()
    }
}

fn client_send(conn: &mut FramedStream, frame: &[u8]) -> Result<(), ChannelError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(oversized(frame.len()));
    }
    client_liveness(conn)?;
    conn.queue_frame(frame);
    conn.flush();
    client_liveness(conn)
}

/// A dead client connection is a channel error, not a silent drop: the
/// protocol has no reconnect path and the backend escalates.
fn client_liveness(conn: &FramedStream) -> Result<(), ChannelError> {
    if conn.dead {
        Err(ChannelError::Disconnected)
    } else {
        Ok(())
    }
}
