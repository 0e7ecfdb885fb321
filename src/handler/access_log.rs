//! NCSA-like access log
//!
//! One line per response, written by the owning worker only, with a
//! microsecond latency suffix:
//!
//! ```text
//! 1.2.3.4 - - [05/Mar/2026:11:02:33 +0000] "GET /index.html HTTP/1.1" 200 120 417us
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use tracing::warn;

use crate::parser::{Method, Version};

/// Append-only access log sink. An unconfigured or unopenable path degrades
/// to stdout.
#[derive(Debug)]
pub struct AccessLog {
    file: Option<File>,
}

impl AccessLog {
    /// Opens `path` for appending; empty path means stdout.
    pub fn open(path: &Path) -> Self {
        if path.as_os_str().is_empty() {
            return AccessLog { file: None };
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => AccessLog { file: Some(file) },
            Err(e) => {
                warn!("cannot open access log {}: {e}", path.display());
                AccessLog { file: None }
            }
        }
    }

    /// Writes one response line.
    pub fn write(
        &mut self,
        remote_ip: &str,
        method: Method,
        path: &str,
        version: Version,
        status: u16,
        bytes: u64,
        latency_us: u64,
    ) {
        let timestamp = Utc::now().format("%d/%b/%Y:%H:%M:%S +0000");
        let line = format!(
            "{remote_ip} - - [{timestamp}] \"{method} {path} {version}\" {status} {bytes} {latency_us}us\n"
        );

        match self.file {
            Some(ref mut file) => {
                let _ = file.write_all(line.as_bytes());
            }
            None => {
                let _ = std::io::stdout().write_all(line.as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::AccessLog;
    use crate::parser::{Method, Version};

    #[test]
    fn line_has_ncsa_shape_with_latency_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        let mut log = AccessLog::open(&path);
        log.write("1.2.3.4", Method::Get, "/index.html", Version::H1_1, 200, 120, 417);

        let mut text = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();

        assert!(text.starts_with("1.2.3.4 - - ["));
        assert!(text.contains("\"GET /index.html HTTP/1.1\" 200 120 417us\n"));
    }
}
