//! Process-local request metrics
//!
//! Counters are atomics so the exposition path can read them through `&self`
//! while handlers bump them; within a worker everything is single-threaded,
//! and workers are never aggregated at runtime (an external collector sums
//! across processes).

use std::sync::atomic::{AtomicU64, Ordering};

const HIST_BUCKETS: usize = 16;

/// Histogram upper bounds in microseconds; the last bucket is +Inf.
const HIST_BOUNDS: [u64; HIST_BUCKETS] = [
    100,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    1_000_000,
    2_000_000,
    5_000_000,
    10_000_000,
    u64::MAX,
];

const BUCKET_LABELS: [&str; HIST_BUCKETS] = [
    "0.0001", "0.0005", "0.001", "0.002", "0.005", "0.01", "0.02", "0.05", "0.1", "0.2", "0.5",
    "1.0", "2.0", "5.0", "10.0", "+Inf",
];

/// Monotone counters plus a fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    requests_2xx: AtomicU64,
    requests_4xx: AtomicU64,
    requests_5xx: AtomicU64,
    active_connections: AtomicU64,
    upstream_errors: AtomicU64,
    latency_hist: [AtomicU64; HIST_BUCKETS],
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
}

impl Metrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Counts one finished request by status class.
    pub fn inc_requests(&self, status: u16) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.requests_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// A connection was accepted.
    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection was closed.
    pub fn dec_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// An upstream selection or exchange failed.
    pub fn inc_upstream_errors(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one request latency. The observation lands in the first
    /// bucket whose bound is >= the latency.
    pub fn observe_latency_us(&self, latency_us: u64) {
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        for (i, bound) in HIST_BOUNDS.iter().enumerate() {
            if latency_us <= *bound {
                self.latency_hist[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Renders the Prometheus text exposition.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(2048);
        let _ = write!(
            out,
            "# HELP nproxy_requests_total Total HTTP requests\n\
             # TYPE nproxy_requests_total counter\n\
             nproxy_requests_total {}\n\
             nproxy_requests_2xx_total {}\n\
             nproxy_requests_4xx_total {}\n\
             nproxy_requests_5xx_total {}\n\
             # HELP nproxy_active_connections Active connections\n\
             # TYPE nproxy_active_connections gauge\n\
             nproxy_active_connections {}\n\
             # HELP nproxy_upstream_errors_total Upstream errors\n\
             # TYPE nproxy_upstream_errors_total counter\n\
             nproxy_upstream_errors_total {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.requests_2xx.load(Ordering::Relaxed),
            self.requests_4xx.load(Ordering::Relaxed),
            self.requests_5xx.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
            self.upstream_errors.load(Ordering::Relaxed),
        );

        let _ = write!(
            out,
            "# HELP nproxy_request_duration_seconds Request duration histogram\n\
             # TYPE nproxy_request_duration_seconds histogram\n"
        );

        // Prometheus buckets are cumulative.
        let mut cumulative = 0u64;
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            cumulative += self.latency_hist[i].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "nproxy_request_duration_seconds_bucket{{le=\"{label}\"}} {cumulative}"
            );
        }

        let count = self.latency_count.load(Ordering::Relaxed);
        let sum_us = self.latency_sum_us.load(Ordering::Relaxed);
        let _ = write!(
            out,
            "nproxy_request_duration_seconds_count {count}\n\
             nproxy_request_duration_seconds_sum {:.6}\n",
            sum_us as f64 / 1e6
        );

        out
    }
}

#[cfg(test)]
mod test {
    use super::Metrics;

    #[test]
    fn requests_count_by_status_class() {
        let m = Metrics::new();
        m.inc_requests(200);
        m.inc_requests(204);
        m.inc_requests(404);
        m.inc_requests(502);

        let text = m.render();
        assert!(text.contains("nproxy_requests_total 4\n"));
        assert!(text.contains("nproxy_requests_2xx_total 2\n"));
        assert!(text.contains("nproxy_requests_4xx_total 1\n"));
        assert!(text.contains("nproxy_requests_5xx_total 1\n"));
    }

    #[test]
    fn latency_lands_in_first_fitting_bucket() {
        let m = Metrics::new();
        m.observe_latency_us(90); // <= 100us
        m.observe_latency_us(1500); // <= 2ms
        m.observe_latency_us(60_000_000); // +Inf

        let text = m.render();
        assert!(text.contains("nproxy_request_duration_seconds_bucket{le=\"0.0001\"} 1\n"));
        // cumulative: the 2ms bucket includes the 100us observation
        assert!(text.contains("nproxy_request_duration_seconds_bucket{le=\"0.002\"} 2\n"));
        assert!(text.contains("nproxy_request_duration_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(text.contains("nproxy_request_duration_seconds_count 3\n"));
    }

    #[test]
    fn sum_is_exposed_in_seconds() {
        let m = Metrics::new();
        m.observe_latency_us(2_500_000);
        assert!(m.render().contains("nproxy_request_duration_seconds_sum 2.500000\n"));
    }

    #[test]
    fn active_connections_gauge_tracks_inc_dec() {
        let m = Metrics::new();
        m.inc_active();
        m.inc_active();
        m.dec_active();
        assert!(m.render().contains("nproxy_active_connections 1\n"));
    }
}
