//! Static file serving
//!
//! Resolution appends `index.html` to directory paths, refuses traversal,
//! and honors `try_files` templates with `$uri` substituted. The traversal
//! check runs on the substituted candidate, not just the raw request path,
//! so a template cannot smuggle `..` past the guard. Responses carry an
//! `"mtime-size"` ETag (hex) and short-circuit to 304 on If-None-Match.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::connection::{ConnState, DispatchIo, SendFile};
use crate::handler::mime;
use crate::parser::request::Request;
use crate::parser::response::{self, Response};
use crate::parser::Method;

/// True when `path` tries to climb out of the root.
fn is_traversal(path: &str) -> bool {
    path.contains("..")
}

/// ETag from file identity: hex mtime, dash, hex size.
fn etag_from(mtime_secs: u64, size: u64) -> String {
    format!("\"{mtime_secs:x}-{size:x}\"")
}

/// Joins a request path onto the document root.
fn root_join(root: &Path, request_path: &str) -> PathBuf {
    root.join(request_path.trim_start_matches('/'))
}

/// Outcome of path resolution.
#[derive(Debug)]
enum Resolution {
    /// An existing regular file to serve
    Found(PathBuf),
    /// The path tries to climb out of the root
    Forbidden,
    /// Nothing matched
    NotFound,
}

/// Resolves a request path to a filesystem path. Without `try_files`,
/// directory paths get `index.html` appended and a traversal path is
/// refused outright. With `try_files`, the first template whose `$uri`
/// substitution names an existing regular file wins; the traversal check
/// runs on each substituted candidate, and a traversal-shaped candidate is
/// skipped rather than fatal, so a later literal fallback can still match.
fn resolve(root: &Path, request_path: &str, try_files: &[String]) -> Resolution {
    if try_files.is_empty() {
        if is_traversal(request_path) {
            return Resolution::Forbidden;
        }
        let mut path = request_path.to_string();
        if path.ends_with('/') {
            path.push_str("index.html");
        }
        let full = root_join(root, &path);
        return match full.metadata() {
            Ok(meta) if meta.is_file() => Resolution::Found(full),
            _ => Resolution::NotFound,
        };
    }

    for template in try_files {
        let candidate = template.replace("$uri", request_path);
        if is_traversal(&candidate) {
            continue;
        }
        let full = root_join(root, &candidate);
        if full.metadata().map(|m| m.is_file()).unwrap_or(false) {
            return Resolution::Found(full);
        }
    }
    Resolution::NotFound
}

/// Serves `path` from `root`, writing the response head into the dispatch
/// surface and arming SendFile for the body. Returns the response status.
pub fn handle(
    io: &mut DispatchIo<'_>,
    req: &Request<'_>,
    path: &str,
    root: &Path,
    try_files: &[String],
) -> (u16, u64) {
    let keep_alive = *io.keep_alive;

    let full = match resolve(root, path, try_files) {
        Resolution::Found(full) => full,
        Resolution::Forbidden => {
            response::write_simple(io.wbuf, 403, "text/plain", "forbidden\n", keep_alive);
            *io.state = ConnState::WritingResponse;
            return (403, 0);
        }
        Resolution::NotFound => {
            response::write_simple(io.wbuf, 404, "text/plain", "not found\n", keep_alive);
            *io.state = ConnState::WritingResponse;
            return (404, 0);
        }
    };

    let file = match File::open(&full) {
        Ok(file) => file,
        Err(_) => {
            response::write_simple(io.wbuf, 404, "text/plain", "not found\n", keep_alive);
            *io.state = ConnState::WritingResponse;
            return (404, 0);
        }
    };

    let meta = match file.metadata() {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            response::write_simple(io.wbuf, 404, "text/plain", "not found\n", keep_alive);
            *io.state = ConnState::WritingResponse;
            return (404, 0);
        }
    };

    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let etag = etag_from(mtime, size);

    if req.header("If-None-Match") == Some(etag.as_str()) {
        Response::new(304, keep_alive)
            .header("ETag", &etag)
            .serialize(io.wbuf);
        *io.state = ConnState::WritingResponse;
        return (304, 0);
    }

    let content_type = mime::by_extension(full.extension().and_then(|e| e.to_str()));
    let length = size.to_string();

    Response::new(200, keep_alive)
        .header("Content-Type", content_type)
        .header("Content-Length", &length)
        .header("ETag", &etag)
        .serialize(io.wbuf);

    if req.method == Method::Head {
        *io.state = ConnState::WritingResponse;
        return (200, 0);
    }

    debug!(path = %full.display(), size, "serving file");
    *io.sendfile = Some(SendFile {
        file,
        offset: 0,
        remaining: size,
    });
    *io.state = ConnState::SendFile;
    (200, size)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use super::{etag_from, handle, is_traversal, resolve, Resolution};
    use crate::connection::{ConnState, Connection, ShellPool};
    use crate::parser::request::{parse, ParseStatus, Request};

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/guide.html"), b"guide").unwrap();
        fs::write(dir.path().join("app.html"), b"app shell").unwrap();
        dir
    }

    fn found(resolution: Resolution) -> std::path::PathBuf {
        match resolution {
            Resolution::Found(path) => path,
            other => panic!("expected a file, got {other:?}"),
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

    #[test]
    fn directory_path_gets_index_html() {
        let dir = fixture();
        let resolved = found(resolve(dir.path(), "/", &[]));
        assert!(resolved.ends_with("index.html"));
    }

    #[test]
    fn plain_file_resolves() {
        let dir = fixture();
        let resolved = found(resolve(dir.path(), "/docs/guide.html", &[]));
        assert!(resolved.ends_with(Path::new("docs/guide.html")));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = fixture();
        assert!(matches!(
            resolve(dir.path(), "/nope.html", &[]),
            Resolution::NotFound
        ));
    }

    #[test]
    fn traversal_without_try_files_is_forbidden() {
        let dir = fixture();
        assert!(matches!(
            resolve(dir.path(), "/../etc/passwd", &[]),
            Resolution::Forbidden
        ));
    }

    #[test]
    fn try_files_first_match_wins() {
        let dir = fixture();
        let templates = vec!["$uri".to_string(), "/app.html".to_string()];
        // /missing doesn't exist, falls to app shell
        let resolved = found(resolve(dir.path(), "/missing", &templates));
        assert!(resolved.ends_with("app.html"));
        // a real file short-circuits before the fallback
        let resolved = found(resolve(dir.path(), "/docs/guide.html", &templates));
        assert!(resolved.ends_with(Path::new("docs/guide.html")));
    }

    #[test]
    fn try_files_substitution_cannot_traverse() {
        let dir = fixture();
        let templates = vec!["/static/$uri".to_string()];
        // substituted candidate contains the traversal, the raw path may not
        assert!(matches!(
            resolve(dir.path(), "/../../etc/passwd", &templates),
            Resolution::NotFound
        ));
    }

    #[test]
    fn handle_serves_try_files_fallback_for_traversal_path() {
        let dir = fixture();
        let templates = vec!["$uri".to_string(), "/app.html".to_string()];
        let (mut conn, _listener) = test_connection();

        let raw: &[u8] = b"GET /../secret HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = parsed(raw);
        let (_, mut io) = conn.begin_dispatch();
        // the $uri candidate is skipped after substitution, the literal
        // fallback still matches
        let (status, bytes) = handle(&mut io, &req, "/../secret", dir.path(), &templates);

        assert_eq!(200, status);
        assert_eq!(b"app shell".len() as u64, bytes);
        assert_eq!(ConnState::SendFile, conn.state);
        assert!(conn.sendfile.is_some());
    }

    #[test]
    fn handle_rejects_traversal_without_try_files() {
        let dir = fixture();
        let (mut conn, _listener) = test_connection();

        let raw: &[u8] = b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = parsed(raw);
        let (_, mut io) = conn.begin_dispatch();
        let (status, _) = handle(&mut io, &req, "/../etc/passwd", dir.path(), &[]);

        assert_eq!(403, status);
        assert_eq!(ConnState::WritingResponse, conn.state);
        let text = std::str::from_utf8(conn.wbuf.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn traversal_paths_are_rejected() {
        assert!(is_traversal("/../etc/passwd"));
        assert!(is_traversal("/a/../../b"));
        assert!(!is_traversal("/normal/path.html"));
    }

    #[test]
    fn etag_is_hex_mtime_dash_size() {
        assert_eq!("\"65539b00-78\"", etag_from(1_700_000_000, 120));
    }
}
