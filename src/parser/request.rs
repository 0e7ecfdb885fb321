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

//! HTTP/1.x request parsing
//!
//! A pure function over a byte slice: it either needs more bytes, yields a
//! complete request, or rejects the stream. Requests split across arbitrary
//! TCP segment boundaries parse identically to whole requests because the
//! caller re-presents the accumulated buffer on every readable event.

use std::str::from_utf8;

use super::{Header, Method, ParseError, ParseResult, Version};

/// Upper bound on header count per request.
pub const MAX_HEADERS: usize = 64;

/// Upper bound on a single request-line or header line, in bytes.
pub const MAX_FIELD_LEN: usize = 8192;

/// A parsed request. All string slices borrow from the input buffer; they
/// are only valid while the bytes stay put, i.e. until the caller consumes
/// `parsed_bytes` from its read buffer.
#[derive(Debug)]
pub struct Request<'a> {
    /// Request method
    pub method: Method,
    /// Path component of the target, before any `?`
    pub path: &'a str,
    /// Query component of the target, without the `?`; empty if absent
    pub query: &'a str,
    /// Protocol version
    pub version: Version,
    /// Header fields in received order
    pub headers: Vec<Header<'a>>,
    /// Value of Content-Length, `-1` when absent
    pub content_length: i64,
    /// Transfer-Encoding: chunked was present
    pub chunked: bool,
    /// Whether the connection should persist after the response
    pub keep_alive: bool,
    /// An Upgrade header was present
    pub upgrade: bool,
    /// Request body; empty unless a positive Content-Length was satisfied
    pub body: &'a [u8],
    /// Head length plus consumed body length
    pub parsed_bytes: usize,
}

impl<'a> Request<'a> {
    /// Case-insensitive header lookup; returns the first match.
    /// Field name comparison is case-insensitive per
    /// [RFC 9110 Section 5.1](https://www.rfc-editor.org/rfc/rfc9110#section-5.1).
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }

    /// Host header without a trailing `:port`, used for virtual server
    /// selection.
    pub fn host(&self) -> Option<&'a str> {
        self.header("Host")
            .map(|h| h.split(':').next().unwrap_or(h))
    }
}

/// Result of an incremental parse attempt.
#[derive(Debug)]
pub enum ParseStatus<'a> {
    /// More bytes are required; present a longer buffer next time.
    Incomplete,
    /// A full request (head and body) was parsed.
    Done(Request<'a>),
}

/// Finds the offset of the first CRLF pair, if any.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `target` must be printable ASCII per the request-target grammar of
/// [RFC 9112 Section 3.2](https://www.rfc-editor.org/rfc/rfc9112#section-3.2).
#[inline]
fn is_target_token(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

fn parse_request_line(line: &[u8]) -> ParseResult<(Method, &str, Version)> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let method_tok = parts.next().ok_or(ParseError::Method)?;
    let method = Method::from_token(method_tok).ok_or(ParseError::Method)?;

    let target_tok = parts.next().ok_or(ParseError::Target)?;
    if target_tok.is_empty() || !target_tok.iter().all(|&b| is_target_token(b)) {
        return Err(ParseError::Target);
    }
    let target = from_utf8(target_tok).map_err(|_| ParseError::Target)?;

    let version = match parts.next() {
        Some(b"HTTP/1.1") => Version::H1_1,
        Some(b"HTTP/1.0") => Version::H1_0,
        _ => return Err(ParseError::Version),
    };

    Ok((method, target, version))
}

fn parse_header_line(line: &[u8]) -> ParseResult<Header<'_>> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::Header)?;

    let name = from_utf8(&line[..colon])
        .map_err(|_| ParseError::Header)?
        .trim();
    let value = from_utf8(&line[colon + 1..])
        .map_err(|_| ParseError::Header)?
        .trim();

    if name.is_empty() {
        return Err(ParseError::Header);
    }

    Ok(Header { name, value })
}

/// Parses one request from the front of `buf`.
///
/// Returns [`ParseStatus::Incomplete`] until the head and, when
/// Content-Length is positive, the full body are available. On success,
/// `parsed_bytes` tells the caller exactly how much of `buf` the request
/// occupied, which is what makes pipelined requests work: the next request
/// begins right behind it.
pub fn parse(buf: &[u8]) -> ParseResult<ParseStatus<'_>> {
    let line_end = match find_crlf(buf) {
        Some(n) => n,
        None if buf.len() > MAX_FIELD_LEN => return Err(ParseError::FieldTooLong),
        None => return Ok(ParseStatus::Incomplete),
    };
    if line_end > MAX_FIELD_LEN {
        return Err(ParseError::FieldTooLong);
    }

    let (method, target, version) = parse_request_line(&buf[..line_end])?;

    let (path, query) = match target.find('?') {
        Some(q) => (&target[..q], &target[q + 1..]),
        None => (target, ""),
    };

    let mut headers = Vec::new();
    let mut content_length: i64 = -1;
    let mut chunked = false;
    let mut upgrade = false;
    let mut keep_alive = false;
    let mut has_connection_header = false;

    let mut cur = line_end + 2;
    loop {
        let rest = &buf[cur..];
        let line_end = match find_crlf(rest) {
            Some(n) => n,
            None if rest.len() > MAX_FIELD_LEN => return Err(ParseError::FieldTooLong),
            None => return Ok(ParseStatus::Incomplete),
        };

        if line_end == 0 {
            cur += 2;
            break;
        }
        if line_end > MAX_FIELD_LEN {
            return Err(ParseError::FieldTooLong);
        }
        if headers.len() == MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }

        let header = parse_header_line(&rest[..line_end])?;

        if header.name.eq_ignore_ascii_case("Content-Length") {
            content_length = header
                .value
                .parse::<i64>()
                .map_err(|_| ParseError::ContentLength)?;
            if content_length < 0 {
                return Err(ParseError::ContentLength);
            }
        } else if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            if header.value.eq_ignore_ascii_case("chunked") {
                chunked = true;
            }
        } else if header.name.eq_ignore_ascii_case("Connection") {
            // An explicit Connection header overrides the version default.
            has_connection_header = true;
            keep_alive = !header.value.eq_ignore_ascii_case("close");
        } else if header.name.eq_ignore_ascii_case("Upgrade") {
            upgrade = true;
        }

        headers.push(header);
        cur += line_end + 2;
    }

    // RFC 9112 Section 9.3: HTTP/1.1 connections persist by default.
    if !has_connection_header {
        keep_alive = version == Version::H1_1;
    }

    if version == Version::H1_1 && !chunked && content_length < 0 {
        content_length = 0;
    }

    let body_offset = cur;
    let mut parsed_bytes = body_offset;
    let mut body: &[u8] = &[];

    if content_length > 0 {
        let need = content_length as usize;
        if buf.len() - body_offset < need {
            return Ok(ParseStatus::Incomplete);
        }
        body = &buf[body_offset..body_offset + need];
        parsed_bytes += need;
    }

    Ok(ParseStatus::Done(Request {
        method,
        path,
        query,
        version,
        headers,
        content_length,
        chunked,
        keep_alive,
        upgrade,
        body,
        parsed_bytes,
    }))
}

#[cfg(test)]
mod test {
    use super::{parse, ParseStatus};
    use crate::parser::{Method, ParseError, Version};

    fn done(buf: &[u8]) -> super::Request<'_> {
        match parse(buf).expect("parse failed") {
            ParseStatus::Done(req) => req,
            ParseStatus::Incomplete => panic!("unexpectedly incomplete"),
        }
    }

    #[test]
    fn parses_minimal_request() {
        let req = done(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n");
        assert_eq!(Method::Get, req.method);
        assert_eq!("/", req.path);
        assert_eq!("", req.query);
        assert_eq!(Version::H1_1, req.version);
        assert_eq!(Some("example.org"), req.header("host"));
        assert_eq!(0, req.content_length);
        assert!(req.keep_alive);
        assert_eq!(37, req.parsed_bytes);
    }

    #[test]
    fn splits_query_from_path() {
        let req = done(b"GET /search?q=rust&n=10 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!("/search", req.path);
        assert_eq!("q=rust&n=10", req.query);
    }

    #[test]
    fn request_split_at_every_boundary_parses_identically() {
        let whole: &[u8] = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd";
        for cut in 1..whole.len() {
            match parse(&whole[..cut]).expect("prefix must not error") {
                ParseStatus::Incomplete => {}
                ParseStatus::Done(_) => panic!("prefix of {cut} bytes parsed as complete"),
            }
        }
        let req = done(whole);
        assert_eq!(b"abcd", req.body);
        assert_eq!(whole.len(), req.parsed_bytes);
    }

    #[test]
    fn pipelined_requests_parse_in_order() {
        let buf: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let first = done(buf);
        assert_eq!("/a", first.path);
        let second = done(&buf[first.parsed_bytes..]);
        assert_eq!("/b", second.path);
        assert_eq!(buf.len(), first.parsed_bytes + second.parsed_bytes);
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        assert!(done(b"GET / HTTP/1.1\r\n\r\n").keep_alive);
        assert!(!done(b"GET / HTTP/1.0\r\n\r\n").keep_alive);
        assert!(!done(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive);
        assert!(done(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").keep_alive);
    }

    #[test]
    fn header_names_compare_case_insensitively_and_values_trim() {
        let req = done(b"GET / HTTP/1.1\r\nX-Thing:   padded value  \r\n\r\n");
        assert_eq!(Some("padded value"), req.header("x-thing"));
        assert_eq!(Some("padded value"), req.header("X-THING"));
    }

    #[test]
    fn body_requires_content_length_bytes() {
        let head: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            parse(head).unwrap(),
            ParseStatus::Incomplete
        ));
    }

    #[test]
    fn chunked_flag_is_recognized() {
        let req = done(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(req.chunked);
        assert_eq!(-1, req.content_length);
    }

    #[test]
    fn upgrade_flag_is_recognized() {
        let req = done(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
        assert!(req.upgrade);
        assert!(req.keep_alive);
    }

    #[test]
    fn host_strips_port() {
        let req = done(b"GET / HTTP/1.1\r\nHost: example.org:8080\r\n\r\n");
        assert_eq!(Some("example.org"), req.host());
    }

    #[test]
    fn rejects_unknown_method() {
        assert_eq!(
            Err(ParseError::Method),
            parse(b"BREW /pot HTTP/1.1\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        assert_eq!(
            Err(ParseError::Version),
            parse(b"GET / HTTP/2.0\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn rejects_negative_content_length() {
        assert_eq!(
            Err(ParseError::ContentLength),
            parse(b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn rejects_header_line_without_colon() {
        assert_eq!(
            Err(ParseError::Header),
            parse(b"GET / HTTP/1.1\r\nbogus header line\r\n\r\n").map(|_| ())
        );
    }
}
