//! Upstream backend pool
//!
//! Owned by a single worker, so selection and accounting need no locks.
//! Backends are demoted passively: releases that report an error bump the
//! error count, and past the threshold the backend stops being selected.
//! Successful releases decay the count back toward recovery.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::TcpStream;
use tracing::{info, warn};

use crate::config::{BalanceMode, ProxyConfig};
use crate::error::{Error, Result};

/// Upper bound on idle descriptors per backend, regardless of
/// `keepalive_conns`.
pub const IDLE_STACK_HARD_CAP: usize = 64;

/// Consecutive-ish error count past which a backend is demoted.
pub const ERROR_THRESHOLD: u32 = 5;

/// One configured backend and its runtime accounting.
#[derive(Debug)]
pub struct Backend {
    /// Configured host
    pub host: String,
    /// Configured port
    pub port: u16,
    /// Resolved address used for connects
    pub addr: SocketAddr,
    /// Whether this backend participates in selection
    pub healthy: bool,
    /// Connections currently borrowed from this backend
    pub active_conns: u32,
    /// Lifetime successful releases
    pub total_requests: u64,
    /// Error releases not yet decayed by successes
    pub error_count: u32,
    idle: Vec<TcpStream>,
}

impl Backend {
    /// Number of descriptors waiting on the idle stack.
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }
}

/// The pool: bounded backend list plus balancing state.
#[derive(Debug)]
pub struct UpstreamPool {
    backends: Vec<Backend>,
    mode: BalanceMode,
    rr_cursor: usize,
    idle_cap: usize,
}

impl UpstreamPool {
    /// Builds the pool, resolving each backend once at startup.
    pub fn new(cfg: &ProxyConfig) -> Result<Self> {
        let mut backends = Vec::with_capacity(cfg.backends.len());
        for entry in &cfg.backends {
            let addr = (entry.host.as_str(), entry.port)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!("cannot resolve backend {}:{}: {e}", entry.host, entry.port))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!("backend {}:{} has no address", entry.host, entry.port))
                })?;

            backends.push(Backend {
                host: entry.host.clone(),
                port: entry.port,
                addr,
                healthy: true,
                active_conns: 0,
                total_requests: 0,
                error_count: 0,
                idle: Vec::new(),
            });
        }

        info!(
            backends = backends.len(),
            mode = ?cfg.mode,
            "upstream pool ready"
        );

        Ok(UpstreamPool {
            backends,
            mode: cfg.mode,
            rr_cursor: 0,
            idle_cap: cfg.keepalive_conns.min(IDLE_STACK_HARD_CAP),
        })
    }

    /// Picks a healthy backend per the configured mode, bumping its active
    /// count. Returns `None` when every backend is demoted.
    pub fn select(&mut self) -> Option<usize> {
        let idx = match self.mode {
            BalanceMode::RoundRobin => self.select_round_robin(),
            BalanceMode::LeastConn => self.select_least_conn(),
        }?;
        self.backends[idx].active_conns += 1;
        Some(idx)
    }

    fn select_round_robin(&mut self) -> Option<usize> {
        let count = self.backends.len();
        for i in 0..count {
            let idx = (self.rr_cursor + i) % count;
            if self.backends[idx].healthy {
                self.rr_cursor = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }

    fn select_least_conn(&self) -> Option<usize> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .min_by_key(|(_, b)| b.active_conns)
            .map(|(idx, _)| idx)
    }

    /// Returns a borrowed backend, recording whether the exchange failed.
    /// Errors past [`ERROR_THRESHOLD`] demote the backend; successes decay
    /// the count and remark it healthy once the count reaches zero.
    pub fn release(&mut self, idx: usize, error: bool) {
        let Some(backend) = self.backends.get_mut(idx) else {
            return;
        };
        backend.active_conns = backend.active_conns.saturating_sub(1);

        if error {
            backend.error_count += 1;
            if backend.error_count > ERROR_THRESHOLD && backend.healthy {
                backend.healthy = false;
                warn!(
                    host = %backend.host,
                    port = backend.port,
                    errors = backend.error_count,
                    "upstream marked unhealthy"
                );
            }
        } else {
            backend.total_requests += 1;
            backend.error_count = backend.error_count.saturating_sub(1);
            if !backend.healthy && backend.error_count == 0 {
                backend.healthy = true;
                info!(host = %backend.host, port = backend.port, "upstream recovered");
            }
        }
    }

    /// Pops an idle descriptor or starts a fresh non-blocking connect.
    pub fn acquire(&mut self, idx: usize) -> io::Result<TcpStream> {
        let backend = &mut self.backends[idx];
        if let Some(stream) = backend.idle.pop() {
            return Ok(stream);
        }
        TcpStream::connect(backend.addr)
    }

    /// Pushes a reusable descriptor onto the idle stack, or drops (closes)
    /// it when the stack is at capacity. Exactly one of the two happens.
    pub fn put_idle(&mut self, idx: usize, stream: TcpStream) {
        let Some(backend) = self.backends.get_mut(idx) else {
            return;
        };
        if backend.idle.len() < self.idle_cap {
            backend.idle.push(stream);
        }
        // else: stream drops here, closing the descriptor
    }

    /// Read access for accounting assertions and the 502 path.
    pub fn backend(&self, idx: usize) -> &Backend {
        &self.backends[idx]
    }

    /// Number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// True when no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::config::{BackendEntry, BalanceMode, ProxyConfig};

    use super::{UpstreamPool, ERROR_THRESHOLD};

    fn pool(mode: BalanceMode, ports: &[u16], keepalive: usize) -> UpstreamPool {
        let cfg = ProxyConfig {
            enabled: true,
            mode,
            backends: ports
                .iter()
                .map(|&port| BackendEntry {
                    host: "127.0.0.1".into(),
                    port,
                })
                .collect(),
            keepalive_conns: keepalive,
            ..ProxyConfig::default()
        };
        UpstreamPool::new(&cfg).expect("pool build failed")
    }

    #[test]
    fn round_robin_cycles_and_counts_active() {
        let mut p = pool(BalanceMode::RoundRobin, &[81, 82], 4);
        assert_eq!(Some(0), p.select());
        assert_eq!(Some(1), p.select());
        assert_eq!(Some(0), p.select());
        assert_eq!(2, p.backend(0).active_conns);
        assert_eq!(1, p.backend(1).active_conns);

        p.release(0, false);
        assert_eq!(1, p.backend(0).active_conns);
        assert_eq!(1, p.backend(0).total_requests);
    }

    #[test]
    fn round_robin_skips_unhealthy() {
        let mut p = pool(BalanceMode::RoundRobin, &[81, 82, 83], 4);
        for _ in 0..=ERROR_THRESHOLD {
            let idx = 1;
            p.select();
            p.release(idx, true);
        }
        // selection pressure aside, backend 1 must now be skipped
        assert!(!p.backend(1).healthy);
        let picks: Vec<_> = (0..4).filter_map(|_| p.select()).collect();
        assert!(!picks.contains(&1));
    }

    #[test]
    fn least_conn_prefers_emptier_backend_with_order_ties() {
        let mut p = pool(BalanceMode::LeastConn, &[81, 82], 4);
        assert_eq!(Some(0), p.select()); // tie broken by order
        assert_eq!(Some(1), p.select());
        p.release(1, false);
        assert_eq!(Some(1), p.select());
    }

    #[test]
    fn errors_demote_then_successes_recover() {
        let mut p = pool(BalanceMode::RoundRobin, &[81], 2);
        for _ in 0..=ERROR_THRESHOLD {
            p.select();
            p.release(0, true);
        }
        assert!(!p.backend(0).healthy);
        assert_eq!(None, p.select());

        for _ in 0..=ERROR_THRESHOLD {
            p.release(0, false);
        }
        assert!(p.backend(0).healthy);
        assert_eq!(Some(0), p.select());
    }

    #[test]
    fn idle_stack_respects_cap() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut p = pool(BalanceMode::RoundRobin, &[port], 2);

        for _ in 0..4 {
            let stream = mio::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            p.put_idle(0, stream);
        }
        assert_eq!(2, p.backend(0).idle_len());
    }

    #[test]
    fn acquire_pops_idle_before_connecting() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut p = pool(BalanceMode::RoundRobin, &[port], 2);

        let stream = mio::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        p.put_idle(0, stream);
        assert_eq!(1, p.backend(0).idle_len());

        let _reused = p.acquire(0).unwrap();
        assert_eq!(0, p.backend(0).idle_len());
    }
}
