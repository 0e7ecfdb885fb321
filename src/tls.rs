//! TLS termination context
//!
//! Certificates and keys are PEM files loaded once per process; each TLS
//! connection gets a `rustls::ServerConnection` whose record I/O is driven
//! by the connection's read/write paths. Handshake progress is implicit in
//! `read_tls`/`write_tls`, so the state machine never sees a distinct
//! handshake state.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Builds the shared `rustls` server config from the `[tls]` block.
pub fn build_server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(&cfg.cert_file).map_err(
            |e| Error::TlsMaterial {
                path: cfg.cert_file.clone(),
                reason: e.to_string(),
            },
        )?))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::TlsMaterial {
            path: cfg.cert_file.clone(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(Error::TlsMaterial {
            path: cfg.cert_file.clone(),
            reason: "no certificates found".into(),
        });
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(&cfg.key_file).map_err(
            |e| Error::TlsMaterial {
                path: cfg.key_file.clone(),
                reason: e.to_string(),
            },
        )?))
        .map_err(|e| Error::TlsMaterial {
            path: cfg.key_file.clone(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::TlsMaterial {
            path: cfg.key_file.clone(),
            reason: "no private key found".into(),
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
