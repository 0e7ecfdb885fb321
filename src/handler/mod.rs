//! Request routing
//!
//! Pure routing in a fixed order: virtual server resolution, module first
//! refusal, path rewrite, rate limiting, internal endpoints, proxy, static
//! files, 404. Each branch frames its response (or arms Proxying/SendFile)
//! and transitions the connection state; the worker does the actual I/O.

use std::sync::Arc;
use std::time::Instant;

use mio::Registry;
use tracing::debug;

use crate::arena::Arena;
use crate::config::{Config, RewriteRule, ServerConfig};
use crate::connection::{ConnState, DispatchIo, RequestMeta};
use crate::net::buffer::Buffer;
use crate::parser::request::Request;
use crate::parser::response;
use crate::proxy::{self, upstream::UpstreamPool};

pub mod access_log;
pub mod file_server;
pub mod metrics;
pub mod mime;
pub mod rate_limit;

use access_log::AccessLog;
use metrics::Metrics;
use rate_limit::RateLimiter;

/// Outcome of a module's look at a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The module wrote a response with this status; routing stops.
    Handled(u16),
    /// The module passed; routing continues.
    Declined,
}

/// A statically registered request handler, consulted before built-in
/// routing. Replaces the dynamic plugin loader of older builds.
pub trait RequestHandler {
    /// Stable name for logs.
    fn name(&self) -> &str;

    /// Inspects the request; a `Handled` outcome short-circuits routing and
    /// must have framed a complete response into `wbuf`.
    fn handle(&mut self, req: &Request<'_>, wbuf: &mut Buffer, keep_alive: bool) -> HandlerOutcome;
}

/// Everything dispatch needs besides the connection itself. Owned by the
/// worker and handed in by reference on every callback.
pub struct HandlerCtx {
    /// Shared configuration
    pub cfg: Arc<Config>,
    /// Upstream pool, when any server proxies
    pub upstreams: Option<UpstreamPool>,
    /// Rate limiter, when enabled
    pub limiter: Option<RateLimiter>,
    /// Per-worker metrics
    pub metrics: Metrics,
    /// Per-worker access log sink
    pub access_log: AccessLog,
    /// Registered modules, consulted in order
    pub modules: Vec<Box<dyn RequestHandler>>,
}

/// Picks the virtual server for a Host header (port already stripped).
/// Unmatched or absent hosts fall back to the first server.
pub fn resolve_server(servers: &[ServerConfig], host: Option<&str>) -> usize {
    if let Some(host) = host {
        for (idx, server) in servers.iter().enumerate() {
            if !server.server_name.is_empty() && server.server_name.eq_ignore_ascii_case(host) {
                return idx;
            }
        }
    }
    0
}

/// Applies the first matching rewrite rule. The replacement template has
/// `$N` capture references; the produced path is arena-allocated so it
/// lives exactly as long as the request cycle.
pub fn apply_rewrite<'a>(rules: &[RewriteRule], path: &'a str, arena: &'a Arena) -> &'a str {
    for rule in rules {
        if let Some(caps) = rule.pattern.captures(path) {
            let mut rewritten = String::new();
            caps.expand(&rule.replacement, &mut rewritten);
            debug!(from = path, to = %rewritten, "rewrite rule fired");
            return arena.alloc_str(&rewritten);
        }
    }
    path
}

fn log_done(
    ctx: &mut HandlerCtx,
    req: &Request<'_>,
    remote_ip: &str,
    status: u16,
    bytes: u64,
    start: Instant,
) {
    let latency_us = start.elapsed().as_micros() as u64;
    ctx.metrics.inc_requests(status);
    ctx.metrics.observe_latency_us(latency_us);
    ctx.access_log
        .write(remote_ip, req.method, req.path, req.version, status, bytes, latency_us);
}

/// Routes one parsed request. Immediate outcomes are framed, logged, and
/// counted here; a started proxy exchange stashes [`RequestMeta`] and is
/// logged when the upstream response completes.
pub fn dispatch(
    ctx: &mut HandlerCtx,
    io: &mut DispatchIo<'_>,
    req: &Request<'_>,
    registry: &Registry,
    key: usize,
) {
    let start = Instant::now();
    let cfg = ctx.cfg.clone();

    *io.keep_alive = req.keep_alive;

    // modules get first refusal
    let mut module_status = None;
    for module in ctx.modules.iter_mut() {
        if let HandlerOutcome::Handled(status) = module.handle(req, io.wbuf, req.keep_alive) {
            module_status = Some(status);
            break;
        }
    }
    if let Some(status) = module_status {
        *io.state = ConnState::WritingResponse;
        log_done(ctx, req, io.remote_ip, status, 0, start);
        return;
    }

    let server = &cfg.servers[resolve_server(&cfg.servers, req.host())];
    let path = apply_rewrite(&server.rewrites, req.path, io.arena);

    if let Some(limiter) = ctx.limiter.as_mut() {
        if !limiter.check(io.remote_ip) {
            response::write_simple(io.wbuf, 429, "text/plain", "rate limit exceeded\n", req.keep_alive);
            *io.state = ConnState::WritingResponse;
            log_done(ctx, req, io.remote_ip, 429, 0, start);
            return;
        }
    }

    if cfg.metrics.enabled && path.starts_with(cfg.metrics.path.as_str()) {
        let body = ctx.metrics.render();
        response::write_simple(io.wbuf, 200, "text/plain; version=0.0.4", &body, req.keep_alive);
        *io.state = ConnState::WritingResponse;
        log_done(ctx, req, io.remote_ip, 200, body.len() as u64, start);
        return;
    }

    if path.starts_with("/healthz") {
        response::write_simple(
            io.wbuf,
            200,
            "application/json",
            "{\"status\":\"ok\"}\n",
            req.keep_alive,
        );
        *io.state = ConnState::WritingResponse;
        log_done(ctx, req, io.remote_ip, 200, 0, start);
        return;
    }

    if server.proxy.enabled {
        if let Some(pool) = ctx.upstreams.as_mut() {
            let status = proxy::handle(pool, &ctx.metrics, io, req, path, registry, key);
            if status == 0 {
                // completion and logging are deferred to the upstream events
                *io.meta = Some(RequestMeta {
                    method: req.method,
                    path: req.path.to_string(),
                    version: req.version,
                    start,
                });
            } else {
                log_done(ctx, req, io.remote_ip, status, 0, start);
            }
            return;
        }
    }

    if let Some(root) = &server.static_root {
        let (status, bytes) = file_server::handle(io, req, path, root, &server.try_files);
        log_done(ctx, req, io.remote_ip, status, bytes, start);
        return;
    }

    response::write_simple(io.wbuf, 404, "text/plain", "not found\n", req.keep_alive);
    *io.state = ConnState::WritingResponse;
    log_done(ctx, req, io.remote_ip, 404, 0, start);
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;

    use super::{apply_rewrite, dispatch, resolve_server, HandlerCtx, HandlerOutcome, RequestHandler};
    use crate::arena::Arena;
    use crate::config::{Config, RewriteRule};
    use crate::connection::{ConnState, Connection, ShellPool};
    use crate::handler::access_log::AccessLog;
    use crate::handler::metrics::Metrics;
    use crate::handler::rate_limit::RateLimiter;
    use crate::net::buffer::Buffer;
    use crate::parser::request::{parse, ParseStatus, Request};
    use crate::parser::response;

    fn test_config(text: &str) -> Arc<Config> {
        Arc::new(Config::parse(text).unwrap())
    }

    fn test_ctx(cfg: Arc<Config>) -> HandlerCtx {
        let limiter = cfg
            .rate_limit
            .enabled
            .then(|| RateLimiter::new(cfg.rate_limit.requests_per_second, cfg.rate_limit.burst));
        HandlerCtx {
            cfg,
            upstreams: None,
            limiter,
            metrics: Metrics::new(),
            access_log: AccessLog::open(Path::new("")),
            modules: Vec::new(),
        }
    }

    fn test_connection() -> (Connection, std::net::TcpListener) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = mio::net::TcpStream::connect(addr).unwrap();
        let conn = Connection::new(ShellPool::new(1).get(), stream, addr, None);
        (conn, listener)
    }

    fn parsed(bytes: &[u8]) -> Request<'_> {
        match parse(bytes).unwrap() {
            ParseStatus::Done(req) => req,
            ParseStatus::Incomplete => panic!("incomplete fixture"),
        }
    }

    fn run_dispatch(ctx: &mut HandlerCtx, conn: &mut Connection, raw: &[u8]) {
        let poll = mio::Poll::new().unwrap();
        conn.rbuf.put(raw);
        let (head, mut io) = conn.begin_dispatch();
        let head = head.to_vec();
        let req = parsed(&head);
        dispatch(ctx, &mut io, &req, poll.registry(), 0);
    }

    #[test]
    fn resolve_server_matches_host_and_defaults_to_first() {
        let cfg = test_config(
            "[server]\nserver_name = a.example\n[server]\nserver_name = b.example\n",
        );
        assert_eq!(0, resolve_server(&cfg.servers, Some("a.example")));
        assert_eq!(1, resolve_server(&cfg.servers, Some("B.EXAMPLE")));
        assert_eq!(0, resolve_server(&cfg.servers, Some("unknown.example")));
        assert_eq!(0, resolve_server(&cfg.servers, None));
    }

    #[test]
    fn rewrite_substitutes_captures_and_only_first_rule_fires() {
        let arena = Arena::new(256);
        let rules = vec![
            RewriteRule {
                pattern: regex::Regex::new("^/old/(.*)$").unwrap(),
                replacement: "/new/$1".into(),
            },
            RewriteRule {
                pattern: regex::Regex::new("^/new/(.*)$").unwrap(),
                replacement: "/other/$1".into(),
            },
        ];
        assert_eq!("/new/page", apply_rewrite(&rules, "/old/page", &arena));
        assert_eq!("/untouched", apply_rewrite(&rules, "/untouched", &arena));
    }

    #[test]
    fn unrouted_request_gets_404() {
        let cfg = test_config("[server]\nstatic_root =\n");
        let mut ctx = test_ctx(cfg);
        let (mut conn, _listener) = test_connection();

        run_dispatch(&mut ctx, &mut conn, b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n");

        assert_eq!(ConnState::WritingResponse, conn.state);
        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn healthz_returns_json_ok() {
        let cfg = test_config("[server]\nstatic_root =\n");
        let mut ctx = test_ctx(cfg);
        let (mut conn, _listener) = test_connection();

        run_dispatch(&mut ctx, &mut conn, b"GET /healthz HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("{\"status\":\"ok\"}"));
    }

    #[test]
    fn metrics_path_serves_exposition() {
        let cfg = test_config("[server]\nstatic_root =\n[metrics]\nenabled = true\npath = /metrics\n");
        let mut ctx = test_ctx(cfg);
        let (mut conn, _listener) = test_connection();

        run_dispatch(&mut ctx, &mut conn, b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.contains("nproxy_requests_total"));
        assert!(text.contains("text/plain; version=0.0.4"));
    }

    #[test]
    fn rate_limited_request_gets_429_with_keep_alive() {
        let cfg = test_config(
            "[server]\nstatic_root =\n[rate_limit]\nenabled = true\nrequests_per_second = 1\nburst = 1\n",
        );
        let mut ctx = test_ctx(cfg);
        let (mut conn, _listener) = test_connection();

        run_dispatch(&mut ctx, &mut conn, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.wbuf.reset();
        run_dispatch(&mut ctx, &mut conn, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("Connection: keep-alive"));
    }

    struct Teapot;

    impl RequestHandler for Teapot {
        fn name(&self) -> &str {
            "teapot"
        }

        fn handle(
            &mut self,
            req: &Request<'_>,
            wbuf: &mut Buffer,
            keep_alive: bool,
        ) -> HandlerOutcome {
            if req.path == "/coffee" {
                response::write_simple(wbuf, 418, "text/plain", "teapot\n", keep_alive);
                HandlerOutcome::Handled(418)
            } else {
                HandlerOutcome::Declined
            }
        }
    }

    #[test]
    fn module_short_circuits_routing() {
        let cfg = test_config("[server]\nstatic_root =\n");
        let mut ctx = test_ctx(cfg);
        ctx.modules.push(Box::new(Teapot));
        let (mut conn, _listener) = test_connection();

        run_dispatch(&mut ctx, &mut conn, b"GET /coffee HTTP/1.1\r\nHost: x\r\n\r\n");

        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 418"));
    }
}
