//! Client↔upstream splicing
//!
//! Proxying forwards the rewritten request to a pooled backend and splices
//! the response back. Response bytes are opaque to the client path, but a
//! minimal framer watches them so the worker knows when the exchange is
//! over: that is what lets a finished upstream socket go back to the idle
//! stack (exactly one action per descriptor) and lets the client connection
//! return to keep-alive. Tunnel mode skips all framing and lives until
//! either peer closes.

use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::connection::{ConnState, DispatchIo};
use crate::handler::metrics::Metrics;
use crate::net::buffer::Buffer;
use crate::parser::request::Request;
use crate::parser::response;
use crate::worker::upstream_token;

pub mod upstream;

use upstream::UpstreamPool;

/// Upper bound on an upstream response head the framer will buffer.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Chunked bodies end with a zero-size chunk; with the preceding CRLF the
/// terminator is this exact byte sequence.
const CHUNK_TERMINATOR: [u8; 7] = *b"\r\n0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Head,
    FixedBody,
    Chunked,
    CloseDelimited,
    Done,
}

/// Watches the upstream byte stream for response completion.
///
/// Content-Length framing is exact; chunked bodies are ended by their
/// terminator; responses with neither are close-delimited, which makes the
/// upstream socket non-reusable and forces the client connection to close
/// (the client saw the same unframed headers).
#[derive(Debug)]
pub struct ResponseFramer {
    state: FramerState,
    head: Vec<u8>,
    status: Option<u16>,
    remaining: u64,
    window: [u8; 7],
    total_bytes: u64,
    reusable: bool,
    connection_close: bool,
    head_only: bool,
}

impl ResponseFramer {
    /// A framer in its initial (pre-response) state.
    pub fn new() -> Self {
        ResponseFramer {
            state: FramerState::Head,
            head: Vec::new(),
            status: None,
            remaining: 0,
            window: [0; 7],
            total_bytes: 0,
            reusable: false,
            connection_close: false,
            head_only: false,
        }
    }

    /// Rewinds for the next exchange on this connection.
    pub fn reset(&mut self) {
        let mut head = std::mem::take(&mut self.head);
        head.clear();
        *self = ResponseFramer {
            head,
            ..ResponseFramer::new()
        };
    }

    /// The response will have no body regardless of its headers (HEAD
    /// requests).
    pub fn expect_head_only(&mut self) {
        self.head_only = true;
    }

    /// Feeds bytes observed from the upstream socket.
    pub fn observe(&mut self, bytes: &[u8]) {
        self.total_bytes += bytes.len() as u64;

        if self.state == FramerState::Head {
            self.head.extend_from_slice(bytes);
            let Some(pos) = find_head_end(&self.head) else {
                if self.head.len() > MAX_RESPONSE_HEAD {
                    self.state = FramerState::CloseDelimited;
                }
                return;
            };
            let body = self.head.split_off(pos + 4);
            self.parse_head();
            self.advance_body(&body);
            return;
        }

        self.advance_body(bytes);
    }

    fn advance_body(&mut self, body: &[u8]) {
        match self.state {
            FramerState::FixedBody => {
                let n = (body.len() as u64).min(self.remaining);
                self.remaining -= n;
                if self.remaining == 0 {
                    self.finish();
                }
            }
            FramerState::Chunked => {
                for &b in body {
                    self.window.rotate_left(1);
                    self.window[6] = b;
                    if self.window == CHUNK_TERMINATOR {
                        self.finish();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    /// The upstream closed its side. Close-delimited responses complete
    /// here; anything else that is still mid-response stays incomplete.
    pub fn mark_eof(&mut self) {
        if self.state == FramerState::CloseDelimited {
            self.state = FramerState::Done;
            self.reusable = false;
        }
    }

    fn parse_head(&mut self) {
        let mut lines = self.head.split(|&b| b == b'\n');

        let mut http10 = false;
        if let Some(line) = lines.next() {
            let line = trim_cr(line);
            http10 = line.starts_with(b"HTTP/1.0");
            self.status = line
                .splitn(3, |&b| b == b' ')
                .nth(1)
                .and_then(|tok| std::str::from_utf8(tok).ok())
                .and_then(|tok| tok.parse::<u16>().ok());
        }

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        for line in lines {
            let line = trim_cr(line);
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = &line[..colon];
            let value = std::str::from_utf8(&line[colon + 1..])
                .unwrap_or("")
                .trim();

            if name.eq_ignore_ascii_case(b"Content-Length") {
                content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
                chunked = value.eq_ignore_ascii_case("chunked");
            } else if name.eq_ignore_ascii_case(b"Connection") {
                self.connection_close = value.eq_ignore_ascii_case("close");
            }
        }
        if http10 {
            self.connection_close = true;
        }

        let bodyless = self.head_only
            || matches!(self.status, Some(status) if status < 200 || status == 204 || status == 304);

        if bodyless || content_length == Some(0) {
            self.finish();
        } else if chunked {
            self.state = FramerState::Chunked;
            // the head terminator supplies the CRLF preceding a first-byte
            // zero chunk
            self.window = [0, 0, 0, 0, 0, b'\r', b'\n'];
        } else if let Some(len) = content_length {
            self.state = FramerState::FixedBody;
            self.remaining = len;
        } else {
            self.state = FramerState::CloseDelimited;
        }
    }

    fn finish(&mut self) {
        self.state = FramerState::Done;
        self.reusable = !self.connection_close;
    }

    /// Upstream response status, once the head was seen.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Whether the response has fully passed through.
    pub fn is_done(&self) -> bool {
        self.state == FramerState::Done
    }

    /// Whether the upstream socket may return to the idle stack.
    pub fn is_reusable(&self) -> bool {
        self.state == FramerState::Done && self.reusable
    }

    /// Whether any response bytes were observed (502 vs. truncation).
    pub fn has_bytes(&self) -> bool {
        self.total_bytes > 0
    }

    /// Total response bytes observed, head included.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl Default for ResponseFramer {
    fn default() -> Self {
        ResponseFramer::new()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Builds the upstream request: method and (rewritten) path verbatim, Host
/// carried over, X-Real-IP / X-Forwarded-For replaced with the client
/// address, Connection set for keep-alive or upgrade. Remaining client
/// headers flow through; hop-by-hop ones are suppressed.
pub fn build_upstream_request(
    req: &Request<'_>,
    path: &str,
    remote_ip: &str,
    host_fallback: &str,
    buf: &mut Buffer,
) {
    let host = req.header("Host").unwrap_or(host_fallback);
    let connection = if req.upgrade { "Upgrade" } else { "keep-alive" };

    if req.query.is_empty() {
        buf.put(format!("{} {} HTTP/1.1\r\n", req.method, path).as_bytes());
    } else {
        buf.put(format!("{} {}?{} HTTP/1.1\r\n", req.method, path, req.query).as_bytes());
    }
    buf.put(
        format!(
            "Host: {host}\r\nX-Real-IP: {remote_ip}\r\nX-Forwarded-For: {remote_ip}\r\nConnection: {connection}\r\n"
        )
        .as_bytes(),
    );

    for header in &req.headers {
        if header.name.eq_ignore_ascii_case("Host")
            || header.name.eq_ignore_ascii_case("Connection")
            || header.name.eq_ignore_ascii_case("X-Real-IP")
            || header.name.eq_ignore_ascii_case("X-Forwarded-For")
        {
            continue;
        }
        buf.put(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }
    buf.put(b"\r\n");

    if !req.body.is_empty() {
        buf.put(req.body);
    }
}

/// Routes a request upstream. Selects a backend, borrows or opens a
/// descriptor, frames the proxied request, and registers the upstream
/// socket with the reactor. Returns the response status for immediate
/// failures, or 0 when the exchange was started and completion is deferred.
pub fn handle(
    pool: &mut UpstreamPool,
    metrics: &Metrics,
    io: &mut DispatchIo<'_>,
    req: &Request<'_>,
    path: &str,
    registry: &Registry,
    key: usize,
) -> u16 {
    let Some(idx) = pool.select() else {
        response::write_error_page(io.wbuf, 503, *io.keep_alive);
        *io.state = ConnState::WritingResponse;
        metrics.inc_upstream_errors();
        return 503;
    };

    let mut stream = match pool.acquire(idx) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(backend = idx, "upstream connect failed: {e}");
            pool.release(idx, true);
            metrics.inc_upstream_errors();
            response::write_error_page(io.wbuf, 502, *io.keep_alive);
            *io.state = ConnState::WritingResponse;
            return 502;
        }
    };

    let token: Token = upstream_token(key);
    if let Err(e) = registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
        warn!(backend = idx, "upstream registration failed: {e}");
        pool.release(idx, true);
        metrics.inc_upstream_errors();
        response::write_error_page(io.wbuf, 502, *io.keep_alive);
        *io.state = ConnState::WritingResponse;
        return 502;
    }

    let backend = pool.backend(idx);
    let host_fallback = format!("{}:{}", backend.host, backend.port);
    build_upstream_request(req, path, io.remote_ip, &host_fallback, io.upstream_wbuf);

    io.framer.reset();
    if req.method == crate::parser::Method::Head {
        io.framer.expect_head_only();
    }

    *io.backend = Some(idx);
    *io.upstream = Some(stream);
    *io.state = if req.upgrade {
        ConnState::Tunnel
    } else {
        ConnState::Proxying
    };
    debug!(backend = idx, upgrade = req.upgrade, "proxy exchange started");
    0
}

#[cfg(test)]
mod test {
    use super::{build_upstream_request, ResponseFramer};
    use crate::net::buffer::Buffer;
    use crate::parser::request::{parse, ParseStatus};

    fn request(bytes: &[u8]) -> crate::parser::request::Request<'_> {
        match parse(bytes).unwrap() {
            ParseStatus::Done(req) => req,
            ParseStatus::Incomplete => panic!("incomplete fixture"),
        }
    }

    #[test]
    fn framer_completes_content_length_response() {
        let mut framer = ResponseFramer::new();
        framer.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel");
        assert!(!framer.is_done());
        framer.observe(b"lo");
        assert!(framer.is_done());
        assert!(framer.is_reusable());
        assert_eq!(Some(200), framer.status());
    }

    #[test]
    fn framer_handles_split_head() {
        let mut framer = ResponseFramer::new();
        framer.observe(b"HTTP/1.1 204 No");
        framer.observe(b" Content\r\nServer: x\r\n");
        assert!(!framer.is_done());
        framer.observe(b"\r\n");
        assert!(framer.is_done());
        assert_eq!(Some(204), framer.status());
    }

    #[test]
    fn framer_ends_chunked_response_at_terminator() {
        let mut framer = ResponseFramer::new();
        framer.observe(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        framer.observe(b"5\r\nhello\r\n");
        assert!(!framer.is_done());
        framer.observe(b"0\r\n\r\n");
        assert!(framer.is_done());
        assert!(framer.is_reusable());
    }

    #[test]
    fn framer_treats_unframed_response_as_close_delimited() {
        let mut framer = ResponseFramer::new();
        framer.observe(b"HTTP/1.1 200 OK\r\nServer: old\r\n\r\nsome bytes");
        assert!(!framer.is_done());
        framer.mark_eof();
        assert!(framer.is_done());
        assert!(!framer.is_reusable());
    }

    #[test]
    fn framer_respects_connection_close() {
        let mut framer = ResponseFramer::new();
        framer.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        assert!(framer.is_done());
        assert!(!framer.is_reusable());
    }

    #[test]
    fn upstream_request_rewrites_hop_by_hop_headers() {
        let req = request(
            b"GET /api?x=1 HTTP/1.1\r\nHost: front.example\r\nX-Forwarded-For: 9.9.9.9\r\nAccept: */*\r\n\r\n",
        );
        let mut buf = Buffer::with_capacity(1024);
        build_upstream_request(&req, "/api", "1.2.3.4", "b1:81", &mut buf);

        let text = std::str::from_utf8(buf.readable()).unwrap();
        assert!(text.starts_with("GET /api?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: front.example\r\n"));
        assert!(text.contains("X-Real-IP: 1.2.3.4\r\n"));
        assert!(text.contains("X-Forwarded-For: 1.2.3.4\r\n"));
        assert!(!text.contains("9.9.9.9"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
    }

    #[test]
    fn upstream_request_forwards_upgrade() {
        let req = request(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        );
        let mut buf = Buffer::with_capacity(1024);
        build_upstream_request(&req, "/ws", "1.2.3.4", "b1:81", &mut buf);

        let text = std::str::from_utf8(buf.readable()).unwrap();
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
    }

    #[test]
    fn upstream_request_carries_body() {
        let req = request(b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc");
        let mut buf = Buffer::with_capacity(1024);
        build_upstream_request(&req, "/p", "1.2.3.4", "b1:81", &mut buf);

        let text = std::str::from_utf8(buf.readable()).unwrap();
        assert!(text.ends_with("\r\n\r\nabc"));
    }
}
