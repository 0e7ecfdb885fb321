//! Configuration file loading
//!
//! Line-oriented INI-like format: `# comments`, `[section]` headers,
//! `key = value` pairs. Every `[server]` header opens a new virtual server;
//! the `[tls]`, `[proxy]`, `[upstream]`, `[cache]`, and `[gzip]` sections
//! that follow apply to the most recent one. `[rate_limit]`, `[log]`,
//! `[metrics]`, `[process]`, and `[global]` are process-wide.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, Result};

/// Load-balancing strategy for the upstream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// Cursor over healthy backends, advancing per selection.
    RoundRobin,
    /// Healthy backend with the fewest active connections; ties broken by
    /// configuration order.
    LeastConn,
}

/// Log verbosity, mapped onto `tracing` level filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// error only
    Error,
    /// error + warn
    Warn,
    /// error + warn + info (default)
    Info,
    /// everything
    Debug,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// One `backend = host:port` entry from `[upstream]`.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    /// Backend host (name or address)
    pub host: String,
    /// Backend port
    pub port: u16,
}

/// A compiled `rewrite = pattern replacement` rule. The first rule whose
/// pattern matches the request path fires; `$N` in the replacement refers to
/// capture groups.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    /// Compiled pattern
    pub pattern: Regex,
    /// Replacement template with `$N` captures
    pub replacement: String,
}

/// `[tls]` block of a server.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Whether this server terminates TLS
    pub enabled: bool,
    /// TLS listener port
    pub listen_port: u16,
    /// PEM certificate chain path
    pub cert_file: PathBuf,
    /// PEM private key path
    pub key_file: PathBuf,
}

/// `[proxy]` block of a server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Whether requests are forwarded upstream
    pub enabled: bool,
    /// Balancing strategy
    pub mode: BalanceMode,
    /// Seconds allowed for an upstream connect
    pub connect_timeout: u64,
    /// Seconds allowed for an upstream exchange
    pub upstream_timeout: u64,
    /// Idle descriptors kept per backend (hard-capped at 64)
    pub keepalive_conns: usize,
    /// Configured backends
    pub backends: Vec<BackendEntry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            enabled: false,
            mode: BalanceMode::RoundRobin,
            connect_timeout: 5,
            upstream_timeout: 30,
            keepalive_conns: 16,
            backends: Vec::new(),
        }
    }
}

/// `[cache]` block. Parsed for compatibility; the response cache subsystem
/// itself is not part of this build.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Whether caching was requested
    pub enabled: bool,
    /// Cache directory
    pub root: PathBuf,
    /// Default entry TTL in seconds
    pub default_ttl: u64,
    /// Maximum entry count
    pub max_entries: usize,
}

/// `[gzip]` block. Parsed for compatibility; compression is delegated to an
/// external collaborator.
#[derive(Debug, Clone, Default)]
pub struct GzipConfig {
    /// Whether compression was requested
    pub enabled: bool,
    /// Minimum body size worth compressing
    pub min_length: usize,
}

/// One virtual server: a `[server]` block plus the per-server sections that
/// follow it. Selected at dispatch time by the client's Host header.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plaintext listener port
    pub listen_port: u16,
    /// Name matched against the request's Host (without port); empty matches
    /// nothing and the first server acts as the default
    pub server_name: String,
    /// Document root for static file serving; `None` disables it
    pub static_root: Option<PathBuf>,
    /// `load_module` paths; handlers register statically in this build
    pub modules: Vec<String>,
    /// Path rewrite rules, first match wins
    pub rewrites: Vec<RewriteRule>,
    /// `try_files` templates with `$uri` placeholders
    pub try_files: Vec<String>,
    /// TLS termination settings
    pub tls: TlsConfig,
    /// Upstream proxying settings
    pub proxy: ProxyConfig,
    /// Cache settings (parsed, not acted upon)
    pub cache: CacheConfig,
    /// Gzip settings (parsed, not acted upon)
    pub gzip: GzipConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_port: 8080,
            server_name: String::new(),
            static_root: Some(PathBuf::from("./www")),
            modules: Vec::new(),
            rewrites: Vec::new(),
            try_files: Vec::new(),
            tls: TlsConfig {
                listen_port: 8443,
                ..TlsConfig::default()
            },
            proxy: ProxyConfig::default(),
            cache: CacheConfig::default(),
            gzip: GzipConfig::default(),
        }
    }
}

/// `[rate_limit]` block.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether per-IP limiting is active
    pub enabled: bool,
    /// Sustained tokens per second
    pub requests_per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: false,
            requests_per_second: 1000,
            burst: 200,
        }
    }
}

/// `[log]` block.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Error log verbosity
    pub level: LogLevel,
    /// Access log path; empty writes to stdout
    pub access_log: PathBuf,
    /// Error log path; empty writes to stderr
    pub error_log: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            access_log: PathBuf::from("./logs/access.log"),
            error_log: PathBuf::from("./logs/error.log"),
        }
    }
}

/// `[metrics]` block.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether the exposition endpoint is served
    pub enabled: bool,
    /// Path the exposition is served on
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            path: String::from("/metrics"),
        }
    }
}

/// `[process]` block.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Detach from the terminal on startup
    pub daemon: bool,
    /// Where the daemonized master records its pid
    pub pid_file: Option<PathBuf>,
}

/// The full parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address all listeners bind to
    pub listen_addr: String,
    /// Number of worker processes to fork
    pub worker_processes: usize,
    /// Listener backlog
    pub backlog: i32,
    /// Per-worker connection cap
    pub max_connections: usize,
    /// Idle seconds allowed between keep-alive requests
    pub keepalive_timeout: u64,
    /// Idle seconds allowed while reading a request
    pub read_timeout: u64,
    /// Idle seconds allowed while writing a response
    pub write_timeout: u64,
    /// Virtual servers in declaration order; the first is the default
    pub servers: Vec<ServerConfig>,
    /// Rate limiting
    pub rate_limit: RateLimitConfig,
    /// Logging
    pub log: LogConfig,
    /// Metrics exposition
    pub metrics: MetricsConfig,
    /// Daemon/pid-file behavior
    pub process: ProcessConfig,
    /// Seconds the master waits for workers on shutdown
    pub shutdown_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: String::from("0.0.0.0"),
            worker_processes: 4,
            backlog: 4096,
            max_connections: 100_000,
            keepalive_timeout: 75,
            read_timeout: 60,
            write_timeout: 60,
            servers: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
            process: ProcessConfig::default(),
            shutdown_timeout: 10,
        }
    }
}

impl Config {
    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parses configuration text. A configuration without any `[server]`
    /// block gets one default server.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Config::default();
        let mut section = String::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                if section == "server" {
                    cfg.servers.push(ServerConfig::default());
                }
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| {
                    Error::Config(format!("line {}: expected key = value", lineno + 1))
                })?;

            cfg.apply(&section, key, value, lineno + 1)?;
        }

        if cfg.servers.is_empty() {
            cfg.servers.push(ServerConfig::default());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn current_server(&mut self) -> &mut ServerConfig {
        if self.servers.is_empty() {
            self.servers.push(ServerConfig::default());
        }
        self.servers.last_mut().expect("servers is non-empty")
    }

    fn apply(&mut self, section: &str, key: &str, value: &str, lineno: usize) -> Result<()> {
        let bad = |what: &str| Error::Config(format!("line {lineno}: invalid {what}: {value}"));

        match section {
            "server" => match key {
                "listen_addr" => self.listen_addr = value.to_string(),
                "worker_processes" => {
                    self.worker_processes = value.parse().map_err(|_| bad("worker_processes"))?
                }
                "backlog" => self.backlog = value.parse().map_err(|_| bad("backlog"))?,
                "max_connections" => {
                    self.max_connections = value.parse().map_err(|_| bad("max_connections"))?
                }
                "keepalive_timeout" => {
                    self.keepalive_timeout = value.parse().map_err(|_| bad("keepalive_timeout"))?
                }
                "read_timeout" => {
                    self.read_timeout = value.parse().map_err(|_| bad("read_timeout"))?
                }
                "write_timeout" => {
                    self.write_timeout = value.parse().map_err(|_| bad("write_timeout"))?
                }
                "listen_port" => {
                    self.current_server().listen_port =
                        value.parse().map_err(|_| bad("listen_port"))?
                }
                "server_name" => self.current_server().server_name = value.to_string(),
                "static_root" => {
                    self.current_server().static_root = if value.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(value))
                    }
                }
                "load_module" => self.current_server().modules.push(value.to_string()),
                "rewrite" => {
                    let (pattern, replacement) = value
                        .split_once(char::is_whitespace)
                        .map(|(p, r)| (p.trim(), r.trim()))
                        .ok_or_else(|| bad("rewrite (want: pattern replacement)"))?;
                    let pattern = Regex::new(pattern).map_err(|e| {
                        Error::Config(format!("line {lineno}: bad rewrite pattern: {e}"))
                    })?;
                    self.current_server().rewrites.push(RewriteRule {
                        pattern,
                        replacement: replacement.to_string(),
                    });
                }
                "try_files" => {
                    self.current_server().try_files =
                        value.split_whitespace().map(str::to_string).collect()
                }
                _ => {}
            },
            "tls" => {
                let tls = &mut self.current_server().tls;
                match key {
                    "enabled" => tls.enabled = parse_bool(value),
                    "listen_port" => {
                        tls.listen_port = value.parse().map_err(|_| bad("tls listen_port"))?
                    }
                    "cert_file" => tls.cert_file = PathBuf::from(value),
                    "key_file" => tls.key_file = PathBuf::from(value),
                    _ => {}
                }
            }
            "proxy" => {
                let proxy = &mut self.current_server().proxy;
                match key {
                    "enabled" => proxy.enabled = parse_bool(value),
                    "mode" => {
                        proxy.mode = match value {
                            "least_conn" => BalanceMode::LeastConn,
                            "round_robin" => BalanceMode::RoundRobin,
                            _ => return Err(bad("proxy mode")),
                        }
                    }
                    "connect_timeout" => {
                        proxy.connect_timeout = value.parse().map_err(|_| bad("connect_timeout"))?
                    }
                    "upstream_timeout" => {
                        proxy.upstream_timeout =
                            value.parse().map_err(|_| bad("upstream_timeout"))?
                    }
                    "keepalive_conns" => {
                        proxy.keepalive_conns =
                            value.parse().map_err(|_| bad("keepalive_conns"))?
                    }
                    _ => {}
                }
            }
            "upstream" => {
                if key == "backend" {
                    let (host, port) = match value.rsplit_once(':') {
                        Some((h, p)) => (h, p.parse().map_err(|_| bad("backend port"))?),
                        None => (value, 80),
                    };
                    self.current_server().proxy.backends.push(BackendEntry {
                        host: host.to_string(),
                        port,
                    });
                }
            }
            "cache" => {
                let cache = &mut self.current_server().cache;
                match key {
                    "enabled" => cache.enabled = parse_bool(value),
                    "root" => cache.root = PathBuf::from(value),
                    "default_ttl" => {
                        cache.default_ttl = value.parse().map_err(|_| bad("default_ttl"))?
                    }
                    "max_entries" => {
                        cache.max_entries = value.parse().map_err(|_| bad("max_entries"))?
                    }
                    _ => {}
                }
            }
            "gzip" => {
                let gzip = &mut self.current_server().gzip;
                match key {
                    "enabled" => gzip.enabled = parse_bool(value),
                    "min_length" => {
                        gzip.min_length = value.parse().map_err(|_| bad("min_length"))?
                    }
                    _ => {}
                }
            }
            "rate_limit" => match key {
                "enabled" => self.rate_limit.enabled = parse_bool(value),
                "requests_per_second" => {
                    self.rate_limit.requests_per_second =
                        value.parse().map_err(|_| bad("requests_per_second"))?
                }
                "burst" => self.rate_limit.burst = value.parse().map_err(|_| bad("burst"))?,
                _ => {}
            },
            "log" => match key {
                "level" => {
                    self.log.level = match value {
                        "debug" => LogLevel::Debug,
                        "info" => LogLevel::Info,
                        "warn" => LogLevel::Warn,
                        "error" => LogLevel::Error,
                        _ => return Err(bad("log level")),
                    }
                }
                "access_log" => self.log.access_log = PathBuf::from(value),
                "error_log" => self.log.error_log = PathBuf::from(value),
                _ => {}
            },
            "metrics" => match key {
                "enabled" => self.metrics.enabled = parse_bool(value),
                "path" => self.metrics.path = value.to_string(),
                _ => {}
            },
            "process" => match key {
                "daemon" => self.process.daemon = parse_bool(value),
                "pid_file" => self.process.pid_file = Some(PathBuf::from(value)),
                _ => {}
            },
            "global" => {
                if key == "shutdown_timeout" {
                    self.shutdown_timeout = value.parse().map_err(|_| bad("shutdown_timeout"))?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.worker_processes == 0 {
            return Err(Error::Config("worker_processes must be at least 1".into()));
        }
        for server in &self.servers {
            if server.proxy.enabled && server.proxy.backends.is_empty() {
                return Err(Error::Config(format!(
                    "server '{}' enables proxying without any [upstream] backend",
                    server.server_name
                )));
            }
            if server.tls.enabled
                && (server.tls.cert_file.as_os_str().is_empty()
                    || server.tls.key_file.as_os_str().is_empty())
            {
                return Err(Error::Config(format!(
                    "server '{}' enables tls without cert_file/key_file",
                    server.server_name
                )));
            }
        }
        Ok(())
    }

    /// One-line summary used at startup and by `-t`.
    pub fn summary(&self) -> String {
        let (port, proxy_on, tls_on) = match self.servers.first() {
            Some(s) => (s.listen_port, s.proxy.enabled, s.tls.enabled),
            None => (0, false, false),
        };
        format!(
            "listen={}:{} servers={} workers={} max_conn={} proxy={} tls={}",
            self.listen_addr,
            port,
            self.servers.len(),
            self.worker_processes,
            self.max_connections,
            if proxy_on { "on" } else { "off" },
            if tls_on { "on" } else { "off" },
        )
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

#[cfg(test)]
mod test {
    use super::{BalanceMode, Config, LogLevel};

    const SAMPLE: &str = r#"
# front proxy
[server]
listen_port = 8080
server_name = example.org
static_root = /srv/www
worker_processes = 2
read_timeout = 30
rewrite = ^/old/(.*)$ /new/$1
try_files = $uri $uri/index.html

[proxy]
enabled = true
mode = least_conn
keepalive_conns = 8

[upstream]
backend = 10.0.0.1:9001
backend = 10.0.0.2:9002
backend = bare-host

[rate_limit]
enabled = yes
requests_per_second = 10
burst = 2

[log]
level = debug

[metrics]
enabled = true
path = /metrics

[server]
listen_port = 8081
server_name = other.example.org
"#;

    #[test]
    fn parses_servers_sections_and_globals() {
        let cfg = Config::parse(SAMPLE).expect("parse failed");
        assert_eq!(2, cfg.servers.len());
        assert_eq!(2, cfg.worker_processes);
        assert_eq!(30, cfg.read_timeout);
        assert_eq!(LogLevel::Debug, cfg.log.level);
        assert!(cfg.metrics.enabled);

        let first = &cfg.servers[0];
        assert_eq!(8080, first.listen_port);
        assert_eq!("example.org", first.server_name);
        assert!(first.proxy.enabled);
        assert_eq!(BalanceMode::LeastConn, first.proxy.mode);
        assert_eq!(8, first.proxy.keepalive_conns);
        assert_eq!(3, first.proxy.backends.len());
        assert_eq!(80, first.proxy.backends[2].port);
        assert_eq!(1, first.rewrites.len());
        assert_eq!(2, first.try_files.len());

        let second = &cfg.servers[1];
        assert_eq!(8081, second.listen_port);
        assert!(!second.proxy.enabled);
    }

    #[test]
    fn rate_limit_section_is_global() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert!(cfg.rate_limit.enabled);
        assert_eq!(10, cfg.rate_limit.requests_per_second);
        assert_eq!(2, cfg.rate_limit.burst);
    }

    #[test]
    fn empty_config_gets_a_default_server() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(1, cfg.servers.len());
        assert_eq!(8080, cfg.servers[0].listen_port);
        assert_eq!(4, cfg.worker_processes);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = Config::parse("# banner\n\n[server]\nlisten_port = 9090 # inline\n").unwrap();
        assert_eq!(9090, cfg.servers[0].listen_port);
    }

    #[test]
    fn proxy_without_backends_is_rejected() {
        let err = Config::parse("[proxy]\nenabled = true\n");
        assert!(err.is_err());
    }

    #[test]
    fn bad_rewrite_pattern_is_rejected() {
        let err = Config::parse("[server]\nrewrite = ^/(unclosed /x\n");
        assert!(err.is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = Config::parse("[server]\nworker_processes = 0\n");
        assert!(err.is_err());
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let err = Config::parse("[tls]\nenabled = true\n");
        assert!(err.is_err());
    }
}
