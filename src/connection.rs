//! Connection: the central entity of the worker
//!
//! One `Connection` per accepted client socket. It owns its descriptors,
//! four byte buffers, and a per-request arena; the worker owns the slab the
//! connection lives in and drives every state transition from reactor
//! callbacks. Closing returns the buffer/arena shell to a freelist so the
//! next accept skips the allocations.

use std::fs::File;
use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use rustls::ServerConnection;

use crate::arena::Arena;
use crate::net::buffer::{Buffer, FdIo};
use crate::parser::{Method, Version};
use crate::proxy::ResponseFramer;
use crate::timeout::TimeoutHandle;

/// Capacity of the downstream and upstream read buffers.
pub const READ_BUF_SIZE: usize = 64 * 1024;

/// Capacity of the downstream and upstream write buffers.
pub const WRITE_BUF_SIZE: usize = 128 * 1024;

/// Initial block size of the per-request arena.
pub const ARENA_BLOCK_SIZE: usize = 16 * 1024;

/// State of the per-connection machine. Exactly one state at a time; all
/// transitions happen inside the worker's event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating request bytes and attempting a parse.
    ReadingRequest,
    /// Draining the serialized response from the write buffer.
    WritingResponse,
    /// Splicing bytes between client and upstream, response-framed.
    Proxying,
    /// Opaque bidirectional splice after a protocol upgrade.
    Tunnel,
    /// Streaming a file to the client after the response head.
    SendFile,
    /// Terminal; the connection is being recycled.
    Closing,
}

/// File transmission progress for the SendFile state.
#[derive(Debug)]
pub struct SendFile {
    /// The open file being served
    pub file: File,
    /// Offset of the next byte to send
    pub offset: i64,
    /// Bytes left to send
    pub remaining: u64,
}

/// Request facts that outlive the parse borrow, kept for the access log on
/// deferred (proxied) completions and for latency observation.
#[derive(Debug)]
pub struct RequestMeta {
    /// Request method
    pub method: Method,
    /// Request path (owned copy)
    pub path: String,
    /// Protocol version
    pub version: Version,
    /// When the request was parsed
    pub start: Instant,
}

/// The reusable allocation-heavy parts of a connection.
#[derive(Debug)]
pub struct ConnShell {
    rbuf: Buffer,
    wbuf: Buffer,
    upstream_rbuf: Buffer,
    upstream_wbuf: Buffer,
    arena: Arena,
}

impl ConnShell {
    fn new() -> Self {
        ConnShell {
            rbuf: Buffer::with_capacity(READ_BUF_SIZE),
            wbuf: Buffer::with_capacity(WRITE_BUF_SIZE),
            upstream_rbuf: Buffer::with_capacity(READ_BUF_SIZE),
            upstream_wbuf: Buffer::with_capacity(WRITE_BUF_SIZE),
            arena: Arena::new(ARENA_BLOCK_SIZE),
        }
    }
}

/// Freelist of connection shells, bounded by `cap`. Beyond the cap, shells
/// are genuinely freed.
#[derive(Debug)]
pub struct ShellPool {
    free: Vec<ConnShell>,
    cap: usize,
}

impl ShellPool {
    /// Creates a pool retaining up to `cap` shells.
    pub fn new(cap: usize) -> Self {
        ShellPool {
            free: Vec::new(),
            cap,
        }
    }

    /// Pops a recycled shell or builds a fresh one.
    pub fn get(&mut self) -> ConnShell {
        self.free.pop().unwrap_or_else(ConnShell::new)
    }

    /// Returns a shell for reuse; drops it when the pool is full.
    pub fn put(&mut self, shell: ConnShell) {
        if self.free.len() < self.cap {
            self.free.push(shell);
        }
    }

    /// Number of shells currently parked.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// True when the freelist is empty.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

/// Disjoint mutable borrows of the connection fields that handler dispatch
/// writes through, alongside the immutable parse borrow of the read buffer.
/// Passing the worker's collaborators down the call chain this way avoids
/// any back-pointers from the connection to the worker.
pub struct DispatchIo<'c> {
    /// Response bytes are framed here
    pub wbuf: &'c mut Buffer,
    /// Proxied request bytes are framed here
    pub upstream_wbuf: &'c mut Buffer,
    /// Per-request scratch allocator
    pub arena: &'c Arena,
    /// Connection state to transition
    pub state: &'c mut ConnState,
    /// Upstream socket slot, populated when proxying starts
    pub upstream: &'c mut Option<TcpStream>,
    /// Borrowed backend index, for release on completion
    pub backend: &'c mut Option<usize>,
    /// File transmission slot, populated by the file server
    pub sendfile: &'c mut Option<SendFile>,
    /// Upstream response framing state
    pub framer: &'c mut ResponseFramer,
    /// Keep-alive decision for the response being built
    pub keep_alive: &'c mut bool,
    /// Deferred-logging metadata slot
    pub meta: &'c mut Option<RequestMeta>,
    /// Client IP in dotted form
    pub remote_ip: &'c str,
    /// Whether this connection terminates TLS (sendfile is bypassed)
    pub is_tls: bool,
}

/// One accepted client socket and its in-flight interaction.
pub struct Connection {
    /// Downstream socket
    pub stream: TcpStream,
    /// TLS session when terminating TLS on this connection
    pub tls: Option<Box<ServerConnection>>,
    /// Upstream socket while in Proxying or Tunnel
    pub upstream: Option<TcpStream>,
    /// File transmission state while in SendFile
    pub sendfile: Option<SendFile>,
    /// Downstream read buffer (request bytes)
    pub rbuf: Buffer,
    /// Downstream write buffer (response bytes)
    pub wbuf: Buffer,
    /// Bytes read from upstream, pending forward to the client
    pub upstream_rbuf: Buffer,
    /// Bytes pending forward to upstream
    pub upstream_wbuf: Buffer,
    /// Per-request arena; reset on every return to ReadingRequest
    pub arena: Arena,
    /// Current state
    pub state: ConnState,
    /// Peer address
    pub peer: SocketAddr,
    /// Peer IP rendered once at accept
    pub remote_ip: String,
    /// Keep-alive decision of the current request
    pub keep_alive: bool,
    /// Worker-clock seconds of the last event on this connection
    pub last_active: u64,
    /// Handle of this connection's single timeout-wheel entry
    pub timeout: Option<TimeoutHandle>,
    /// Borrowed backend index while proxying
    pub backend: Option<usize>,
    /// Upstream response framing state
    pub framer: ResponseFramer,
    /// Deferred-logging metadata for proxied requests
    pub meta: Option<RequestMeta>,
}

impl Connection {
    /// Wraps an accepted stream with a recycled shell.
    pub fn new(
        shell: ConnShell,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<Box<ServerConnection>>,
    ) -> Self {
        Connection {
            stream,
            tls,
            upstream: None,
            sendfile: None,
            rbuf: shell.rbuf,
            wbuf: shell.wbuf,
            upstream_rbuf: shell.upstream_rbuf,
            upstream_wbuf: shell.upstream_wbuf,
            arena: shell.arena,
            state: ConnState::ReadingRequest,
            peer,
            remote_ip: peer.ip().to_string(),
            keep_alive: false,
            last_active: 0,
            timeout: None,
            backend: None,
            framer: ResponseFramer::new(),
            meta: None,
        }
    }

    /// Tears the connection down to its reusable shell. Descriptors and the
    /// TLS session drop here; buffers and arena are reset, not freed.
    pub fn into_shell(mut self) -> ConnShell {
        self.rbuf.reset();
        self.wbuf.reset();
        self.upstream_rbuf.reset();
        self.upstream_wbuf.reset();
        self.arena.reset();
        ConnShell {
            rbuf: self.rbuf,
            wbuf: self.wbuf,
            upstream_rbuf: self.upstream_rbuf,
            upstream_wbuf: self.upstream_wbuf,
            arena: self.arena,
        }
    }

    /// Splits the connection into the parse view of the read buffer plus
    /// the mutable dispatch surface. Both borrows come from one `&mut self`,
    /// so the request can reference `rbuf` while dispatch writes the
    /// response into the other fields.
    pub fn begin_dispatch(&mut self) -> (&[u8], DispatchIo<'_>) {
        let head = self.rbuf.readable();
        let io = DispatchIo {
            wbuf: &mut self.wbuf,
            upstream_wbuf: &mut self.upstream_wbuf,
            arena: &self.arena,
            state: &mut self.state,
            upstream: &mut self.upstream,
            backend: &mut self.backend,
            sendfile: &mut self.sendfile,
            framer: &mut self.framer,
            keep_alive: &mut self.keep_alive,
            meta: &mut self.meta,
            remote_ip: &self.remote_ip,
            is_tls: self.tls.is_some(),
        };
        (head, io)
    }

    /// One read step from the client socket into `buf`, decrypting through
    /// the TLS session when present. Callers drain in a loop until
    /// `WouldBlock` because client sockets are edge-triggered.
    fn read_step(
        tls: &mut Option<Box<ServerConnection>>,
        stream: &mut TcpStream,
        buf: &mut Buffer,
    ) -> io::Result<FdIo> {
        let Some(tls) = tls.as_deref_mut() else {
            return buf.read_from(stream);
        };

        match tls.read_tls(stream) {
            Ok(0) => Ok(FdIo::Closed),
            Ok(_) => {
                tls.process_new_packets()
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

                let mut total = 0;
                loop {
                    match buf.read_from(&mut tls.reader())? {
                        FdIo::Transferred(0) => break, // buffer full
                        FdIo::Transferred(n) => total += n,
                        FdIo::WouldBlock => break, // no plaintext ready
                        FdIo::Closed => return Ok(FdIo::Closed),
                    }
                }
                // report progress even when only handshake records moved
                Ok(FdIo::Transferred(total.max(1)))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(FdIo::WouldBlock),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(FdIo::Transferred(0)),
            Err(e) => Err(e),
        }
    }

    /// One write step of `buf` to the client socket, encrypting through the
    /// TLS session when present.
    fn write_step(
        tls: &mut Option<Box<ServerConnection>>,
        stream: &mut TcpStream,
        buf: &mut Buffer,
    ) -> io::Result<FdIo> {
        let Some(tls) = tls.as_deref_mut() else {
            return buf.write_to(stream);
        };

        // stage plaintext into the TLS layer, then push records out
        while !buf.is_empty() {
            match tls.writer().write(buf.readable()) {
                Ok(0) => break,
                Ok(n) => buf.consume(n),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if tls.wants_write() {
            match tls.write_tls(stream) {
                Ok(n) => Ok(FdIo::Transferred(n)),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(FdIo::WouldBlock),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(FdIo::Transferred(0)),
                Err(e) => Err(e),
            }
        } else {
            Ok(FdIo::Transferred(0))
        }
    }

    /// One read step into the request buffer.
    pub fn read_downstream(&mut self) -> io::Result<FdIo> {
        Self::read_step(&mut self.tls, &mut self.stream, &mut self.rbuf)
    }

    /// One read step into the upstream-bound buffer (Proxying/Tunnel).
    pub fn read_downstream_proxy(&mut self) -> io::Result<FdIo> {
        Self::read_step(&mut self.tls, &mut self.stream, &mut self.upstream_wbuf)
    }

    /// Drains the response buffer to the client. Returns true when nothing
    /// remains pending, including buffered TLS records.
    pub fn flush_downstream(&mut self) -> io::Result<bool> {
        loop {
            match Self::write_step(&mut self.tls, &mut self.stream, &mut self.wbuf)? {
                FdIo::Transferred(0) => break,
                FdIo::Transferred(_) => continue,
                FdIo::WouldBlock => return Ok(false),
                FdIo::Closed => return Ok(false),
            }
        }
        Ok(self.wbuf.is_empty() && !self.tls_wants_write())
    }

    /// Drains the upstream-read buffer to the client (Proxying/Tunnel).
    /// Returns true when nothing remains pending.
    pub fn flush_downstream_proxy(&mut self) -> io::Result<bool> {
        loop {
            match Self::write_step(&mut self.tls, &mut self.stream, &mut self.upstream_rbuf)? {
                FdIo::Transferred(0) => break,
                FdIo::Transferred(_) => continue,
                FdIo::WouldBlock => return Ok(false),
                FdIo::Closed => return Ok(false),
            }
        }
        Ok(self.upstream_rbuf.is_empty() && !self.tls_wants_write())
    }

    /// Whether the TLS layer has records it still needs to push out.
    pub fn tls_wants_write(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.wants_write())
    }

    /// Whether any downstream write work is pending.
    pub fn has_pending_write(&self) -> bool {
        !self.wbuf.is_empty() || self.tls_wants_write()
    }
}

#[cfg(test)]
mod test {
    use super::{ConnShell, ShellPool};

    #[test]
    fn shell_pool_recycles_up_to_cap() {
        let mut pool = ShellPool::new(2);
        assert!(pool.is_empty());

        pool.put(ConnShell::new());
        pool.put(ConnShell::new());
        pool.put(ConnShell::new());
        assert_eq!(2, pool.len());

        let _shell = pool.get();
        assert_eq!(1, pool.len());
        let _shell = pool.get();
        let _fresh = pool.get(); // freelist empty, builds new
        assert!(pool.is_empty());
    }
}
