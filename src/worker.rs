//! Worker process: reactor loop and connection state machine
//!
//! One worker is one single-threaded event loop. It owns its connections
//! (a slab indexed by token), the timeout wheel, the upstream pool, rate
//! limiter, metrics, and access log; nothing is shared with sibling
//! workers except the inherited listener sockets, which the kernel
//! load-balances via SO_REUSEPORT. Handlers run to completion and treat
//! would-block as the signal to rearm readiness; the loop suspends only in
//! the reactor's wait.

use std::io::{ErrorKind, Read};
use std::net::TcpListener as StdTcpListener;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use nix::errno::Errno;
use nix::sys::sendfile::sendfile;
use nix::sys::signalfd::SignalFd;
use rustls::ServerConnection;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ConnState, Connection, RequestMeta, ShellPool};
use crate::error::Result;
use crate::handler::access_log::AccessLog;
use crate::handler::metrics::Metrics;
use crate::handler::rate_limit::RateLimiter;
use crate::handler::{self, HandlerCtx, RequestHandler};
use crate::net::buffer::FdIo;
use crate::parser::request::{parse, ParseStatus};
use crate::parser::response;
use crate::proxy::upstream::UpstreamPool;
use crate::reactor::Reactor;
use crate::signal;
use crate::timeout::TimeoutWheel;
use crate::tls;

const NEVENTS: usize = 1024;
const TIMEOUT_BUCKETS: usize = 512;
const MAX_LISTENERS: usize = 64;

/// Every worker fd maps onto a token space: the signalfd at the top,
/// listeners right below it, and two tokens per connection slot (client on
/// even, upstream on odd).
const SIGNAL_TOKEN: Token = Token(usize::MAX);
const LISTENER_BASE: usize = usize::MAX - 1;

pub(crate) fn client_token(key: usize) -> Token {
    Token(key << 1)
}

pub(crate) fn upstream_token(key: usize) -> Token {
    Token((key << 1) | 1)
}

fn listener_token(index: usize) -> Token {
    Token(LISTENER_BASE - index)
}

struct WorkerListener {
    inner: TcpListener,
    tls: bool,
}

enum ParseOutcome {
    /// Need more bytes.
    Wait,
    /// An error response was framed; drain and close.
    ErrorQueued,
    /// Dispatch ran; this many request bytes were consumed.
    Dispatched(usize),
}

enum SendFileStep {
    Continue,
    Done,
    Again,
    Failed,
}

enum UpstreamRead {
    Read,
    Backpressure,
    Drained,
    Eof,
    Failed,
}

/// A worker's entire state. Constructed after fork (or directly in
/// single-worker mode) and driven by [`Worker::run`].
pub struct Worker {
    id: usize,
    cfg: Arc<Config>,
    reactor: Reactor,
    conns: Slab<Connection>,
    shells: ShellPool,
    wheel: TimeoutWheel,
    ctx: HandlerCtx,
    listeners: Vec<WorkerListener>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    signal_fd: SignalFd,
    running: bool,
    epoch: Instant,
    now: u64,
    last_tick: u64,
    expired: Vec<usize>,
}

impl Worker {
    /// Builds a worker around inherited listener sockets. Each `(listener,
    /// tls)` pair came from the master's bind step; `id` is the worker slot
    /// for logs.
    pub fn new(cfg: Arc<Config>, inherited: Vec<(StdTcpListener, bool)>, id: usize) -> Result<Self> {
        let reactor = Reactor::new()?;

        let mut listeners = Vec::with_capacity(inherited.len());
        for (index, (std_listener, tls)) in inherited.into_iter().enumerate().take(MAX_LISTENERS) {
            let mut inner = TcpListener::from_std(std_listener);
            reactor.add(&mut inner, listener_token(index), Interest::READABLE)?;
            listeners.push(WorkerListener { inner, tls });
        }

        let tls_config = match cfg.servers.iter().find(|s| s.tls.enabled) {
            Some(server) => Some(tls::build_server_config(&server.tls)?),
            None => None,
        };

        let upstreams = match cfg.servers.iter().find(|s| s.proxy.enabled) {
            Some(server) => Some(UpstreamPool::new(&server.proxy)?),
            None => None,
        };

        let limiter = cfg
            .rate_limit
            .enabled
            .then(|| RateLimiter::new(cfg.rate_limit.requests_per_second, cfg.rate_limit.burst));

        let signal_fd = signal::worker_signalfd()?;
        let raw_signal_fd = signal_fd.as_raw_fd();
        reactor.add(&mut SourceFd(&raw_signal_fd), SIGNAL_TOKEN, Interest::READABLE)?;

        let ctx = HandlerCtx {
            cfg: cfg.clone(),
            upstreams,
            limiter,
            metrics: Metrics::new(),
            access_log: AccessLog::open(&cfg.log.access_log),
            modules: Vec::new(),
        };

        Ok(Worker {
            id,
            cfg,
            reactor,
            conns: Slab::new(),
            shells: ShellPool::new(1024),
            wheel: TimeoutWheel::new(TIMEOUT_BUCKETS),
            ctx,
            listeners,
            tls_config,
            signal_fd,
            running: false,
            epoch: Instant::now(),
            now: 0,
            last_tick: 0,
            expired: Vec::new(),
        })
    }

    /// Registers a request-handler module; modules are consulted in
    /// registration order before built-in routing.
    pub fn register_module(&mut self, module: Box<dyn RequestHandler>) {
        self.ctx.modules.push(module);
    }

    /// The worker main loop. Returns when a TERM/INT signal flips the
    /// running flag.
    pub fn run(&mut self) -> Result<()> {
        info!(worker = self.id, pid = std::process::id(), "worker starting");
        let mut events = Events::with_capacity(NEVENTS);
        self.running = true;

        while self.running {
            self.reactor.poll(&mut events, Duration::from_secs(1))?;
            self.now = self.epoch.elapsed().as_secs();

            for event in events.iter() {
                match event.token() {
                    SIGNAL_TOKEN => self.drain_signals(),
                    Token(t) if t > LISTENER_BASE - MAX_LISTENERS => {
                        self.accept(LISTENER_BASE - t);
                    }
                    Token(t) => {
                        let key = t >> 1;
                        if t & 1 == 1 {
                            self.upstream_event(key, event);
                        } else {
                            self.client_event(key, event);
                        }
                    }
                }
            }

            self.tick_timeouts();
        }

        info!(worker = self.id, "worker exiting");
        Ok(())
    }

    fn drain_signals(&mut self) {
        while let Ok(Some(info)) = self.signal_fd.read_signal() {
            let signo = info.ssi_signo as i32;
            if !signal::keep_running(signo) {
                info!(worker = self.id, signo, "shutdown signal received");
                self.running = false;
            }
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            let (stream, peer) = match self.listeners[index].inner.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            };

            if self.conns.len() >= self.cfg.max_connections {
                debug!("connection limit reached, dropping accept");
                continue;
            }

            let _ = stream.set_nodelay(true);

            let tls = if self.listeners[index].tls {
                let Some(config) = self.tls_config.as_ref() else {
                    continue;
                };
                match ServerConnection::new(config.clone()) {
                    Ok(session) => Some(Box::new(session)),
                    Err(e) => {
                        warn!("tls session init failed: {e}");
                        continue;
                    }
                }
            } else {
                None
            };

            let shell = self.shells.get();
            let mut conn = Connection::new(shell, stream, peer, tls);
            conn.last_active = self.now;

            let entry = self.conns.vacant_entry();
            let key = entry.key();
            if self
                .reactor
                .add(&mut conn.stream, client_token(key), Interest::READABLE)
                .is_err()
            {
                self.shells.put(conn.into_shell());
                continue;
            }

            conn.timeout = Some(self.wheel.add(self.now, self.cfg.read_timeout, key));
            entry.insert(conn);
            self.ctx.metrics.inc_active();
        }
    }

    fn client_event(&mut self, key: usize, event: &mio::event::Event) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        conn.last_active = self.now;
        let state = conn.state;

        if event.is_error() {
            self.close_conn(key);
            return;
        }

        match state {
            ConnState::ReadingRequest => {
                if event.is_readable() || event.is_read_closed() {
                    self.handle_read(key);
                } else if event.is_writable() {
                    // TLS handshake records waiting to go out
                    self.flush_pending(key);
                }
            }
            ConnState::WritingResponse | ConnState::SendFile => {
                if event.is_writable() && self.advance(key) {
                    self.process_requests(key);
                }
            }
            ConnState::Proxying | ConnState::Tunnel => {
                if event.is_readable() || event.is_read_closed() {
                    self.proxy_client_readable(key);
                }
                if self.conns.contains(key) && event.is_writable() {
                    self.proxy_client_writable(key);
                }
            }
            ConnState::Closing => {}
        }
    }

    /// Drains the client socket, then attempts to parse and dispatch as
    /// many pipelined requests as are buffered.
    fn handle_read(&mut self, key: usize) {
        loop {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            match conn.read_downstream() {
                Ok(FdIo::Transferred(0)) | Ok(FdIo::WouldBlock) => break,
                Ok(FdIo::Transferred(_)) => continue,
                Ok(FdIo::Closed) => {
                    self.close_conn(key);
                    return;
                }
                Err(e) => {
                    debug!("client read error: {e}");
                    self.close_conn(key);
                    return;
                }
            }
        }

        // the TLS layer may owe the peer handshake records
        if let Some(conn) = self.conns.get_mut(key) {
            if conn.tls_wants_write() && conn.flush_downstream().is_err() {
                self.close_conn(key);
                return;
            }
        }

        self.process_requests(key);
    }

    fn process_requests(&mut self, key: usize) {
        loop {
            let outcome = {
                let Self {
                    ref mut conns,
                    ref mut ctx,
                    ref reactor,
                    ..
                } = *self;
                let Some(conn) = conns.get_mut(key) else {
                    return;
                };
                if conn.state != ConnState::ReadingRequest {
                    return;
                }
                if conn.rbuf.is_empty() {
                    ParseOutcome::Wait
                } else {
                    conn.rbuf.compact();
                    let full = conn.rbuf.writable_len() == 0;
                    let (head, mut io) = conn.begin_dispatch();

                    match parse(head) {
                        Ok(ParseStatus::Incomplete) if full => {
                            response::write_error_page(io.wbuf, 431, false);
                            *io.keep_alive = false;
                            *io.state = ConnState::WritingResponse;
                            ctx.metrics.inc_requests(431);
                            ParseOutcome::ErrorQueued
                        }
                        Ok(ParseStatus::Incomplete) => ParseOutcome::Wait,
                        Err(e) => {
                            debug!("request parse error: {e}");
                            response::write_error_page(io.wbuf, 400, false);
                            *io.keep_alive = false;
                            *io.state = ConnState::WritingResponse;
                            ctx.metrics.inc_requests(400);
                            ParseOutcome::ErrorQueued
                        }
                        Ok(ParseStatus::Done(req)) => {
                            let parsed = req.parsed_bytes;
                            handler::dispatch(ctx, &mut io, &req, reactor.registry(), key);
                            ParseOutcome::Dispatched(parsed)
                        }
                    }
                }
            };

            match outcome {
                ParseOutcome::Wait => {
                    self.update_interest(key);
                    return;
                }
                ParseOutcome::ErrorQueued => {
                    self.advance(key);
                    return;
                }
                ParseOutcome::Dispatched(parsed) => {
                    if let Some(conn) = self.conns.get_mut(key) {
                        conn.rbuf.consume(parsed);
                    }
                    match self.conns.get(key).map(|c| c.state) {
                        Some(ConnState::Proxying) | Some(ConnState::Tunnel) => {
                            self.proxy_flush_upstream(key);
                            if self.conns.contains(key) {
                                self.update_interest(key);
                            }
                            return;
                        }
                        Some(_) => {
                            if self.advance(key) {
                                continue;
                            }
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Pushes the current state one step: drains the response or the file.
    /// Returns true when the response completed and the connection is back
    /// in ReadingRequest.
    fn advance(&mut self, key: usize) -> bool {
        let Some(conn) = self.conns.get_mut(key) else {
            return false;
        };
        match conn.state {
            ConnState::WritingResponse => match conn.flush_downstream() {
                Ok(true) => self.finish_response(key),
                Ok(false) => {
                    self.update_interest(key);
                    false
                }
                Err(_) => {
                    self.close_conn(key);
                    false
                }
            },
            ConnState::SendFile => self.continue_sendfile(key),
            ConnState::Closing => {
                self.close_conn(key);
                false
            }
            _ => false,
        }
    }

    /// Response fully flushed: either recycle for keep-alive (arena reset,
    /// timeout renewed, back to ReadingRequest) or close.
    fn finish_response(&mut self, key: usize) -> bool {
        let keep_alive = match self.conns.get(key) {
            Some(conn) => conn.keep_alive,
            None => return false,
        };
        if !keep_alive {
            self.close_conn(key);
            return false;
        }

        let now = self.now;
        let keepalive_timeout = self.cfg.keepalive_timeout;
        let Some(conn) = self.conns.get_mut(key) else {
            return false;
        };

        // request cycle boundary: every arena loan is dead from here
        conn.arena.reset();
        conn.meta = None;
        conn.state = ConnState::ReadingRequest;

        if let Some(handle) = conn.timeout.take() {
            self.wheel.remove(handle);
        }
        let handle = self.wheel.add(now, keepalive_timeout, key);
        if let Some(conn) = self.conns.get_mut(key) {
            conn.timeout = Some(handle);
        }

        self.update_interest(key);
        true
    }

    fn flush_pending(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.flush_downstream().is_err() {
            self.close_conn(key);
            return;
        }
        self.update_interest(key);
    }

    fn update_interest(&mut self, key: usize) {
        let Self {
            ref mut conns,
            ref reactor,
            ..
        } = *self;
        let Some(conn) = conns.get_mut(key) else {
            return;
        };

        let mut interest = match conn.state {
            ConnState::ReadingRequest => Interest::READABLE,
            ConnState::WritingResponse | ConnState::SendFile => Interest::WRITABLE,
            ConnState::Proxying | ConnState::Tunnel => {
                if conn.upstream_rbuf.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                }
            }
            ConnState::Closing => return,
        };
        if conn.has_pending_write() {
            interest = interest | Interest::WRITABLE;
        }

        let _ = reactor.modify(&mut conn.stream, client_token(key), interest);
    }

    fn continue_sendfile(&mut self, key: usize) -> bool {
        // response head goes out before any file bytes
        {
            let Some(conn) = self.conns.get_mut(key) else {
                return false;
            };
            match conn.flush_downstream() {
                Ok(true) => {}
                Ok(false) => {
                    self.update_interest(key);
                    return false;
                }
                Err(_) => {
                    self.close_conn(key);
                    return false;
                }
            }
        }

        let is_tls = self
            .conns
            .get(key)
            .map(|c| c.tls.is_some())
            .unwrap_or(false);
        if is_tls {
            self.sendfile_buffered(key)
        } else {
            self.sendfile_zero_copy(key)
        }
    }

    /// Zero-copy file transmission on plaintext connections.
    fn sendfile_zero_copy(&mut self, key: usize) -> bool {
        let step = {
            let Some(conn) = self.conns.get_mut(key) else {
                return false;
            };
            let stream = &conn.stream;
            match conn.sendfile.as_mut() {
                None => SendFileStep::Done,
                Some(sf) => loop {
                    if sf.remaining == 0 {
                        break SendFileStep::Done;
                    }
                    let count = sf.remaining.min(1 << 20) as usize;
                    let mut offset = sf.offset;
                    let stream_fd = unsafe {
                        std::os::fd::BorrowedFd::borrow_raw(stream.as_raw_fd())
                    };
                    match sendfile(stream_fd, &sf.file, Some(&mut offset), count) {
                        Ok(0) => break SendFileStep::Failed, // file truncated under us
                        Ok(n) => {
                            sf.offset = offset;
                            sf.remaining -= n as u64;
                        }
                        Err(Errno::EAGAIN) => break SendFileStep::Again,
                        Err(e) => {
                            warn!("sendfile failed: {e}");
                            break SendFileStep::Failed;
                        }
                    }
                },
            }
        };

        self.apply_sendfile_step(key, step)
    }

    /// Buffered file transmission for TLS connections, where the bytes
    /// must pass through the record layer.
    fn sendfile_buffered(&mut self, key: usize) -> bool {
        loop {
            let step = {
                let Some(conn) = self.conns.get_mut(key) else {
                    return false;
                };
                match conn.sendfile.as_mut() {
                    None => SendFileStep::Done,
                    Some(sf) if sf.remaining == 0 => SendFileStep::Done,
                    Some(sf) => {
                        let mut chunk = [0u8; 16384];
                        let want = sf.remaining.min(chunk.len() as u64) as usize;
                        match sf.file.read(&mut chunk[..want]) {
                            Ok(0) => SendFileStep::Failed, // file truncated under us
                            Ok(n) => {
                                sf.remaining -= n as u64;
                                conn.wbuf.put(&chunk[..n]);
                                match conn.flush_downstream() {
                                    Ok(true) => SendFileStep::Continue,
                                    Ok(false) => SendFileStep::Again,
                                    Err(_) => SendFileStep::Failed,
                                }
                            }
                            Err(e) => {
                                warn!("file read failed: {e}");
                                SendFileStep::Failed
                            }
                        }
                    }
                }
            };

            match step {
                SendFileStep::Continue => continue,
                step => return self.apply_sendfile_step(key, step),
            }
        }
    }

    fn apply_sendfile_step(&mut self, key: usize, step: SendFileStep) -> bool {
        match step {
            SendFileStep::Done => {
                if let Some(conn) = self.conns.get_mut(key) {
                    conn.sendfile = None;
                }
                self.finish_response(key)
            }
            SendFileStep::Again => {
                self.update_interest(key);
                false
            }
            SendFileStep::Failed | SendFileStep::Continue => {
                self.close_conn(key);
                false
            }
        }
    }

    // ---- proxy / tunnel plumbing ---------------------------------------

    /// Client bytes during Proxying/Tunnel flow opaquely to the upstream.
    fn proxy_client_readable(&mut self, key: usize) {
        loop {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            match conn.read_downstream_proxy() {
                Ok(FdIo::Transferred(0)) => {
                    // upstream-bound buffer is full; push it out and retry,
                    // or wait for the upstream's writable event
                    self.proxy_flush_upstream(key);
                    match self.conns.get(key) {
                        Some(conn) if conn.upstream_wbuf.writable_len() > 0 => continue,
                        _ => return,
                    }
                }
                Ok(FdIo::WouldBlock) => break,
                Ok(FdIo::Transferred(_)) => continue,
                Ok(FdIo::Closed) => {
                    // a tunnel or in-flight exchange dies with its client
                    self.close_conn(key);
                    return;
                }
                Err(_) => {
                    self.close_conn(key);
                    return;
                }
            }
        }
        self.proxy_flush_upstream(key);
    }

    /// Drains the upstream-bound buffer and rearms the upstream socket's
    /// write interest accordingly.
    fn proxy_flush_upstream(&mut self, key: usize) {
        let Self {
            ref mut conns,
            ref reactor,
            ..
        } = *self;
        let Some(conn) = conns.get_mut(key) else {
            return;
        };
        let Some(upstream) = conn.upstream.as_mut() else {
            return;
        };

        loop {
            match conn.upstream_wbuf.write_to(upstream) {
                Ok(FdIo::Transferred(0)) | Ok(FdIo::WouldBlock) => break,
                Ok(FdIo::Transferred(_)) => continue,
                Ok(FdIo::Closed) | Err(_) => {
                    self.upstream_failure(key);
                    return;
                }
            }
        }

        let interest = if conn.upstream_wbuf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        let _ = reactor.modify(upstream, upstream_token(key), interest);
    }

    fn upstream_event(&mut self, key: usize, event: &mio::event::Event) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if !matches!(conn.state, ConnState::Proxying | ConnState::Tunnel) {
            return;
        }
        conn.last_active = self.now;

        if event.is_error() {
            let detail = conn
                .upstream
                .as_ref()
                .and_then(|u| u.take_error().ok())
                .flatten();
            debug!(?detail, "upstream socket error");
            self.upstream_failure(key);
            return;
        }

        if event.is_writable() {
            self.proxy_flush_upstream(key);
            if !self.conns.contains(key) {
                return;
            }
            // a client read paused on a full upstream buffer resumes here;
            // its readable edge was already consumed
            self.proxy_client_readable(key);
            if !self.conns.contains(key) {
                return;
            }
        }
        if event.is_readable() || event.is_read_closed() {
            self.proxy_upstream_readable(key);
        }
    }

    fn proxy_upstream_readable(&mut self, key: usize) {
        loop {
            let outcome = {
                let Some(conn) = self.conns.get_mut(key) else {
                    return;
                };
                let Some(upstream) = conn.upstream.as_mut() else {
                    break;
                };
                match conn.upstream_rbuf.read_from(upstream) {
                    Ok(FdIo::Transferred(0)) => UpstreamRead::Backpressure,
                    Ok(FdIo::Transferred(n)) => {
                        if conn.state == ConnState::Proxying {
                            let readable = conn.upstream_rbuf.readable();
                            conn.framer.observe(&readable[readable.len() - n..]);
                        }
                        UpstreamRead::Read
                    }
                    Ok(FdIo::WouldBlock) => UpstreamRead::Drained,
                    Ok(FdIo::Closed) => UpstreamRead::Eof,
                    Err(_) => UpstreamRead::Failed,
                }
            };

            match outcome {
                UpstreamRead::Read => {
                    self.proxy_forward_to_client(key);
                    if !self.conns.contains(key) {
                        return;
                    }
                }
                UpstreamRead::Backpressure => {
                    self.proxy_forward_to_client(key);
                    match self.conns.get(key) {
                        // forwarding freed space: the paused read must be
                        // retried, the upstream edge was already consumed
                        Some(conn) if conn.upstream_rbuf.writable_len() > 0 => continue,
                        // client is genuinely slower; its writable events
                        // resume the splice
                        Some(_) => return,
                        None => return,
                    }
                }
                UpstreamRead::Drained => break,
                UpstreamRead::Eof => {
                    self.handle_upstream_eof(key);
                    return;
                }
                UpstreamRead::Failed => {
                    self.upstream_failure(key);
                    return;
                }
            }
        }

        self.proxy_forward_to_client(key);
        if self.conns.contains(key) {
            self.maybe_complete_proxy(key);
        }
    }

    fn proxy_forward_to_client(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.flush_downstream_proxy().is_err() {
            self.close_conn(key);
            return;
        }
        self.update_interest(key);
    }

    /// Client became writable while proxying: drain the pending response
    /// bytes, then either pull more from upstream or finish the exchange.
    fn proxy_client_writable(&mut self, key: usize) {
        self.proxy_forward_to_client(key);
        let Some(conn) = self.conns.get(key) else {
            return;
        };

        if !conn.upstream_rbuf.is_empty() {
            return;
        }
        if conn.upstream.is_some() {
            // edge-triggered upstream: re-attempt the read we paused
            self.proxy_upstream_readable(key);
        } else {
            self.proxy_tail_finished(key);
        }
    }

    /// The upstream was already released; the buffered response tail just
    /// finished draining to the client.
    fn proxy_tail_finished(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        match conn.state {
            ConnState::Proxying => {
                if self.finish_response(key) {
                    self.process_requests(key);
                }
            }
            ConnState::Tunnel => self.close_conn(key),
            _ => {}
        }
    }

    /// A framed upstream response has fully arrived: settle accounting,
    /// release or recycle the upstream socket, and finish the client side
    /// once the tail drains.
    fn maybe_complete_proxy(&mut self, key: usize) {
        let done = {
            let Some(conn) = self.conns.get(key) else {
                return;
            };
            conn.state == ConnState::Proxying
                && conn.upstream.is_some()
                && conn.framer.is_done()
                && conn.upstream_wbuf.is_empty()
        };
        if !done {
            return;
        }

        let Self {
            ref mut conns,
            ref mut ctx,
            ref reactor,
            ..
        } = *self;
        let Some(conn) = conns.get_mut(key) else {
            return;
        };

        if let Some(mut upstream) = conn.upstream.take() {
            let _ = reactor.delete(&mut upstream);
            if let Some(backend) = conn.backend.take() {
                if let Some(pool) = ctx.upstreams.as_mut() {
                    if conn.framer.is_reusable() {
                        pool.put_idle(backend, upstream);
                    }
                    pool.release(backend, false);
                }
            }
        }

        let status = conn.framer.status().unwrap_or(200);
        let bytes = conn.framer.total_bytes();
        if let Some(meta) = conn.meta.take() {
            Self::log_deferred(ctx, &conn.remote_ip, meta, status, bytes);
        }

        let drained = conn.upstream_rbuf.is_empty() && !conn.tls_wants_write();
        if drained {
            self.proxy_tail_finished(key);
        } else {
            self.update_interest(key);
        }
    }

    /// Upstream closed its side. Before any response bytes this is a 502;
    /// mid-response it is a truncated close; a close-delimited response
    /// simply ends here (and the client must be closed too, since it saw
    /// the same unframed headers).
    fn handle_upstream_eof(&mut self, key: usize) {
        let state = match self.conns.get(key) {
            Some(conn) => conn.state,
            None => return,
        };

        if state == ConnState::Tunnel {
            // best-effort flush of the final bytes, then drop both sides
            if let Some(conn) = self.conns.get_mut(key) {
                let _ = conn.flush_downstream_proxy();
            }
            self.close_conn(key);
            return;
        }

        let Self {
            ref mut conns,
            ref mut ctx,
            ref reactor,
            ..
        } = *self;
        let Some(conn) = conns.get_mut(key) else {
            return;
        };

        if !conn.framer.has_bytes() {
            // upstream died before producing anything
            self.upstream_failure(key);
            return;
        }

        conn.framer.mark_eof();
        let truncated = !conn.framer.is_done();
        if truncated || !conn.framer.is_reusable() {
            // close-delimited or cut short: the client cannot be kept alive
            conn.keep_alive = false;
        }

        if let Some(mut upstream) = conn.upstream.take() {
            let _ = reactor.delete(&mut upstream);
        }
        if let Some(backend) = conn.backend.take() {
            if let Some(pool) = ctx.upstreams.as_mut() {
                pool.release(backend, truncated);
            }
        }
        if truncated {
            ctx.metrics.inc_upstream_errors();
        }

        let status = conn.framer.status().unwrap_or(502);
        let bytes = conn.framer.total_bytes();
        if let Some(meta) = conn.meta.take() {
            Self::log_deferred(ctx, &conn.remote_ip, meta, status, bytes);
        }

        let drained = conn.upstream_rbuf.is_empty() && !conn.tls_wants_write();
        if drained {
            self.proxy_tail_finished(key);
        } else {
            self.update_interest(key);
        }
    }

    /// Upstream connect or I/O failure: release the backend with an error
    /// mark and answer 502 if the client has not seen any response bytes.
    fn upstream_failure(&mut self, key: usize) {
        let Self {
            ref mut conns,
            ref mut ctx,
            ref reactor,
            ..
        } = *self;
        let Some(conn) = conns.get_mut(key) else {
            return;
        };

        let had_bytes = conn.framer.has_bytes();
        if let Some(mut upstream) = conn.upstream.take() {
            let _ = reactor.delete(&mut upstream);
        }
        if let Some(backend) = conn.backend.take() {
            if let Some(pool) = ctx.upstreams.as_mut() {
                pool.release(backend, true);
            }
        }
        ctx.metrics.inc_upstream_errors();

        if !had_bytes && conn.state == ConnState::Proxying {
            response::write_error_page(&mut conn.wbuf, 502, false);
            conn.keep_alive = false;
            conn.state = ConnState::WritingResponse;
            if let Some(meta) = conn.meta.take() {
                Self::log_deferred(ctx, &conn.remote_ip, meta, 502, 0);
            }
            self.advance(key);
        } else {
            if let Some(meta) = conn.meta.take() {
                let status = conn.framer.status().unwrap_or(502);
                let bytes = conn.framer.total_bytes();
                Self::log_deferred(ctx, &conn.remote_ip, meta, status, bytes);
            }
            self.close_conn(key);
        }
    }

    fn log_deferred(
        ctx: &mut HandlerCtx,
        remote_ip: &str,
        meta: RequestMeta,
        status: u16,
        bytes: u64,
    ) {
        let latency_us = meta.start.elapsed().as_micros() as u64;
        ctx.metrics.inc_requests(status);
        ctx.metrics.observe_latency_us(latency_us);
        ctx.access_log
            .write(remote_ip, meta.method, &meta.path, meta.version, status, bytes, latency_us);
    }

    // ---- teardown ------------------------------------------------------

    /// Terminal transition: unregister descriptors, settle the upstream
    /// borrow, drop the timeout entry, and recycle the shell.
    fn close_conn(&mut self, key: usize) {
        let Some(mut conn) = self.conns.try_remove(key) else {
            return;
        };
        conn.state = ConnState::Closing;

        let _ = self.reactor.delete(&mut conn.stream);
        if let Some(mut upstream) = conn.upstream.take() {
            // mid-exchange descriptors are never cleanly idle; drop closes
            let _ = self.reactor.delete(&mut upstream);
        }
        if let Some(backend) = conn.backend.take() {
            if let Some(pool) = self.ctx.upstreams.as_mut() {
                pool.release(backend, false);
            }
        }
        if let Some(handle) = conn.timeout.take() {
            self.wheel.remove(handle);
        }

        self.ctx.metrics.dec_active();
        self.shells.put(conn.into_shell());
    }

    fn tick_timeouts(&mut self) {
        let read_timeout = self.cfg.read_timeout;
        while self.last_tick < self.now {
            self.last_tick += 1;
            let mut expired = std::mem::take(&mut self.expired);
            self.wheel.tick(self.last_tick, &mut expired);
            for key in expired.drain(..) {
                let Some(conn) = self.conns.get_mut(key) else {
                    continue;
                };
                // a fired entry whose connection saw traffic since it was
                // armed is deferred, not killed
                let idle_for = self.now.saturating_sub(conn.last_active);
                if idle_for < read_timeout {
                    conn.timeout = Some(self.wheel.add(self.now, read_timeout - idle_for, key));
                    continue;
                }
                debug!(key, "idle connection timed out");
                conn.timeout = None;
                self.close_conn(key);
            }
            self.expired = expired;
        }
    }
}
