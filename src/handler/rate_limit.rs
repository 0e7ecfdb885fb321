//! Per-IP token bucket rate limiting
//!
//! A fixed, direct-mapped table: 4096 slots keyed by FNV-1a of the remote
//! IP. A colliding IP silently overwrites the slot, which trades perfect
//! fairness for a bounded, eviction-free table. Buckets refill continuously
//! at the configured rate up to `burst`.

use std::time::Instant;

const TABLE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
struct Bucket {
    ip: String,
    tokens: f64,
    last_refill: Instant,
    used: bool,
}

/// The limiter. One instance per worker; no sharing across processes.
#[derive(Debug)]
pub struct RateLimiter {
    table: Vec<Bucket>,
    rate: f64,
    burst: f64,
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 14695981039346656037;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

impl RateLimiter {
    /// Creates a limiter allowing `rate` requests per second with a burst
    /// capacity of `burst`.
    pub fn new(rate: u32, burst: u32) -> Self {
        let now = Instant::now();
        RateLimiter {
            table: vec![
                Bucket {
                    ip: String::new(),
                    tokens: 0.0,
                    last_refill: now,
                    used: false,
                };
                TABLE_SIZE
            ],
            rate: f64::from(rate),
            burst: f64::from(burst),
        }
    }

    /// Returns true when `ip` may proceed, deducting one token.
    pub fn check(&mut self, ip: &str) -> bool {
        self.check_at(ip, Instant::now())
    }

    /// Clock-injected variant of [`check`](Self::check).
    pub fn check_at(&mut self, ip: &str, now: Instant) -> bool {
        let idx = (fnv1a(ip.as_bytes()) % TABLE_SIZE as u64) as usize;
        let bucket = &mut self.table[idx];

        if !bucket.used || bucket.ip != ip {
            bucket.ip.clear();
            bucket.ip.push_str(ip);
            bucket.tokens = self.burst;
            bucket.last_refill = now;
            bucket.used = true;
        }

        let elapsed = now
            .saturating_duration_since(bucket.last_refill)
            .as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::RateLimiter;

    #[test]
    fn burst_is_honored_then_denied() {
        let mut rl = RateLimiter::new(10, 2);
        let t0 = Instant::now();
        assert!(rl.check_at("1.2.3.4", t0));
        assert!(rl.check_at("1.2.3.4", t0 + Duration::from_millis(20)));
        assert!(!rl.check_at("1.2.3.4", t0 + Duration::from_millis(40)));
    }

    #[test]
    fn bucket_refills_at_configured_rate() {
        let mut rl = RateLimiter::new(10, 2);
        let t0 = Instant::now();
        assert!(rl.check_at("1.2.3.4", t0));
        assert!(rl.check_at("1.2.3.4", t0));
        assert!(!rl.check_at("1.2.3.4", t0));
        // 100ms at 10 r/s refills one token
        assert!(rl.check_at("1.2.3.4", t0 + Duration::from_millis(100)));
        assert!(!rl.check_at("1.2.3.4", t0 + Duration::from_millis(100)));
    }

    #[test]
    fn rate_plus_burst_over_one_second() {
        let mut rl = RateLimiter::new(10, 5);
        let t0 = Instant::now();
        let mut allowed = 0;
        // 100 evenly spaced attempts over one second
        for i in 0..100 {
            if rl.check_at("9.9.9.9", t0 + Duration::from_millis(i * 10)) {
                allowed += 1;
            }
        }
        assert!((14..=16).contains(&allowed), "allowed {allowed}");
    }

    #[test]
    fn distinct_ips_do_not_share_buckets() {
        let mut rl = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        assert!(rl.check_at("10.0.0.1", t0));
        assert!(rl.check_at("10.0.0.2", t0));
    }

    #[test]
    fn colliding_ip_overwrites_slot() {
        let mut rl = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        assert!(rl.check_at("10.0.0.1", t0));
        assert!(!rl.check_at("10.0.0.1", t0));
        // force the same slot by direct reuse of the table entry
        let idx = (super::fnv1a(b"10.0.0.1") % super::TABLE_SIZE as u64) as usize;
        rl.table[idx].ip = "10.9.9.9".into();
        // original ip now initializes fresh with full burst
        assert!(rl.check_at("10.0.0.1", t0));
    }
}
