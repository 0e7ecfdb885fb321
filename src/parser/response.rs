// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 response serialization
//!
//! Responses are framed straight into the connection's write buffer; the
//! state machine drains that buffer to the socket. Header order is status
//! line, explicit headers, Content-Length, Connection, blank line, body.

use crate::net::buffer::Buffer;

/// Reason phrase for a status code.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// A response under construction: status, headers, body, and the keep-alive
/// decision that becomes the Connection header.
#[derive(Debug)]
pub struct Response<'a> {
    /// Status code for the status line
    pub status: u16,
    /// Explicit reason phrase; defaults per [`reason_phrase`]
    pub reason: Option<&'a str>,
    /// Headers serialized in insertion order
    pub headers: Vec<(&'a str, &'a str)>,
    /// Response body bytes; may be empty
    pub body: &'a [u8],
    /// Whether the connection persists after this response
    pub keep_alive: bool,
}

impl<'a> Response<'a> {
    /// Creates an empty response with the given status.
    pub fn new(status: u16, keep_alive: bool) -> Self {
        Response {
            status,
            reason: None,
            headers: Vec::new(),
            body: &[],
            keep_alive,
        }
    }

    /// Appends a header field.
    pub fn header(mut self, name: &'a str, value: &'a str) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: &'a [u8]) -> Self {
        self.body = body;
        self
    }

    fn has_content_length(&self) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
    }

    /// Serializes status line, headers, Connection header, and body into
    /// `buf`. Content-Length is added unless the caller supplied one or the
    /// status forbids a body (1xx, 204, 304).
    pub fn serialize(&self, buf: &mut Buffer) {
        let reason = self.reason.unwrap_or_else(|| reason_phrase(self.status));
        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());

        for (name, value) in &self.headers {
            buf.put(name.as_bytes());
            buf.put(b": ");
            buf.put(value.as_bytes());
            buf.put(b"\r\n");
        }

        let bodyless = self.status < 200 || self.status == 204 || self.status == 304;
        if !bodyless && !self.has_content_length() {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        buf.put(if self.keep_alive {
            b"Connection: keep-alive\r\n\r\n" as &[u8]
        } else {
            b"Connection: close\r\n\r\n"
        });

        if !bodyless {
            buf.put(self.body);
        }
    }
}

/// One-shot writer for small fixed responses.
pub fn write_simple(buf: &mut Buffer, status: u16, content_type: &str, body: &str, keep_alive: bool) {
    Response::new(status, keep_alive)
        .header("Content-Type", content_type)
        .body(body.as_bytes())
        .serialize(buf);
}

/// Writes an HTML error page for `status`.
pub fn write_error_page(buf: &mut Buffer, status: u16, keep_alive: bool) {
    let reason = reason_phrase(status);
    let body = format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><center><h1>{status} {reason}</h1></center><hr>\
         <center>nproxy</center></body></html>\n"
    );
    Response::new(status, keep_alive)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(body.as_bytes())
        .serialize(buf);
}

#[cfg(test)]
mod test {
    use super::{write_error_page, write_simple, Response};
    use crate::net::buffer::Buffer;

    fn as_str(buf: &Buffer) -> &str {
        std::str::from_utf8(buf.readable()).expect("response must be utf8")
    }

    #[test]
    fn serializes_status_line_headers_and_body() {
        let mut buf = Buffer::with_capacity(256);
        Response::new(200, true)
            .header("Content-Type", "text/plain")
            .body(b"hi")
            .serialize(&mut buf);

        let text = as_str(&buf);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n\r\n"));
        assert!(text.ends_with("\r\nhi"));
    }

    #[test]
    fn connection_header_follows_keep_alive_flag() {
        let mut buf = Buffer::with_capacity(256);
        write_simple(&mut buf, 200, "text/plain", "x", false);
        assert!(as_str(&buf).contains("Connection: close\r\n\r\n"));
    }

    #[test]
    fn explicit_content_length_is_not_duplicated() {
        let mut buf = Buffer::with_capacity(256);
        Response::new(200, true)
            .header("Content-Length", "120")
            .serialize(&mut buf);
        assert_eq!(1, as_str(&buf).matches("Content-Length").count());
    }

    #[test]
    fn not_modified_has_no_body_or_length() {
        let mut buf = Buffer::with_capacity(256);
        Response::new(304, true).body(b"ignored").serialize(&mut buf);
        let text = as_str(&buf);
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_page_carries_status_in_html() {
        let mut buf = Buffer::with_capacity(512);
        write_error_page(&mut buf, 502, false);
        let text = as_str(&buf);
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("<h1>502 Bad Gateway</h1>"));
        assert!(text.contains("Connection: close"));
    }
}
