// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Parsing is tolerant where RFC 3261 allows it: LF-only line endings are
//! accepted, folded header continuations are unfolded, compact header names
//! expand to their long forms, and comma-joined multi-value headers (Via,
//! Route, Record-Route, Contact, Allow, Supported) split into one entry per
//! value. Serialization is canonical: CRLF line endings, long header names,
//! one header field per line, and a `Content-Length` that always matches the
//! body byte count.
//!
//! # Example
//! ```
//! use larynx_parse::{parse_request, serialize_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:example.com SIP/2.0\r\nVia: SIP/2.0/UDP host;branch=z9hG4bKx\r\nMax-Forwards: 70\r\nTo: <sip:bob@example.com>\r\nFrom: <sip:alice@example.com>;tag=1\r\nCall-ID: a@host\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let wire = serialize_request(&request);
//! ```

use std::fmt;

use bytes::{Bytes, BytesMut};
use larynx_core::{
    headers::{is_multi_value, split_multi_value},
    Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, StatusLine,
};

pub mod stream;

pub use stream::StreamBuffer;

/// Upper bound on a single message accepted from the wire (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Parse failures. Malformed datagrams are dropped at the transport
/// boundary; the variants mainly feed log lines and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unparseable start-line, header block, or framing.
    MalformedMessage(&'static str),
    /// Start-line names a SIP version other than 2.0.
    UnsupportedVersion,
    /// Response status code outside 100-699.
    InvalidStatusCode(u16),
    /// Message exceeds the size limit.
    TooLarge { max: usize, actual: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedMessage(reason) => write!(f, "malformed message: {}", reason),
            ParseError::UnsupportedVersion => write!(f, "unsupported SIP version"),
            ParseError::InvalidStatusCode(code) => {
                write!(f, "status code {} outside 100-699", code)
            }
            ParseError::TooLarge { max, actual } => {
                write!(f, "message too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses a datagram into a request or response based on the start line.
pub fn parse_message(datagram: &Bytes) -> Result<SipMessage, ParseError> {
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = HeaderLines::new(head);
    let first = lines
        .next()
        .ok_or(ParseError::MalformedMessage("empty message"))?;

    if first.trim_start().starts_with("SIP/") {
        let status = parse_status_line(&first)?;
        let headers = parse_headers(lines)?;
        let body = extract_body(body_bytes, &headers)?;
        Ok(SipMessage::Response(Response::new(status, headers, body)))
    } else {
        let start = parse_request_line(&first)?;
        let headers = parse_headers(lines)?;
        let body = extract_body(body_bytes, &headers)?;
        Ok(SipMessage::Request(Request::new(start, headers, body)))
    }
}

/// Parses a SIP request from raw bytes.
pub fn parse_request(datagram: &Bytes) -> Result<Request, ParseError> {
    match parse_message(datagram)? {
        SipMessage::Request(req) => Ok(req),
        SipMessage::Response(_) => Err(ParseError::MalformedMessage("expected a request")),
    }
}

/// Parses a SIP response from raw bytes.
pub fn parse_response(datagram: &Bytes) -> Result<Response, ParseError> {
    match parse_message(datagram)? {
        SipMessage::Response(res) => Ok(res),
        SipMessage::Request(_) => Err(ParseError::MalformedMessage("expected a response")),
    }
}

/// Serializes a request with canonical header order and a recomputed
/// `Content-Length`. A missing `Max-Forwards` is inserted as 70.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;

    let mut buf = String::new();
    let _ = write!(
        buf,
        "{} {} SIP/2.0\r\n",
        req.start.method.as_str(),
        req.start.uri
    );
    write_headers(&mut buf, &req.headers, req.body.len(), true);
    finish(buf, &req.body)
}

/// Serializes a response with canonical header order and a recomputed
/// `Content-Length`.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;

    let mut buf = String::new();
    let _ = write!(buf, "SIP/2.0 {} {}\r\n", res.start.code, res.start.reason);
    write_headers(&mut buf, &res.headers, res.body.len(), false);
    finish(buf, &res.body)
}

/// Serializes either message kind.
pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

/// Canonical emission order for routing-critical headers; everything else
/// follows in insertion order, with `Content-Length` always last.
const HEADER_ORDER: &[&str] = &[
    "Via",
    "Max-Forwards",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Contact",
    "Route",
    "Record-Route",
    "Allow",
    "Supported",
    "Content-Type",
];

fn write_headers(buf: &mut String, headers: &Headers, body_len: usize, is_request: bool) {
    use std::fmt::Write;

    for name in HEADER_ORDER {
        if *name == "Max-Forwards" && is_request && !headers.contains("Max-Forwards") {
            let _ = write!(buf, "Max-Forwards: 70\r\n");
            continue;
        }
        for value in headers.get_all(name) {
            let _ = write!(buf, "{}: {}\r\n", name, value.trim());
        }
    }

    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length")
            || HEADER_ORDER
                .iter()
                .any(|n| header.name.eq_ignore_ascii_case(n))
        {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    let _ = write!(buf, "Content-Length: {}\r\n", body_len);
}

fn finish(head: String, body: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(head.len() + 2 + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

/// Splits raw bytes into the header section and the body slice. Accepts
/// CRLF or bare LF separators.
fn split_head_body(datagram: &Bytes) -> Result<(&str, &[u8]), ParseError> {
    let data = datagram.as_ref();
    if data.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge {
            max: DEFAULT_MAX_MESSAGE_SIZE,
            actual: data.len(),
        });
    }

    let crlf = find_subslice(data, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find_subslice(data, b"\n\n").map(|pos| (pos, 2));
    let (head, body) = match (crlf, lf) {
        (Some((cp, cl)), Some((lp, ll))) => {
            if cp <= lp {
                (&data[..cp], &data[cp + cl..])
            } else {
                (&data[..lp], &data[lp + ll..])
            }
        }
        (Some((pos, len)), None) | (None, Some((pos, len))) => (&data[..pos], &data[pos + len..]),
        (None, None) => (data, &[][..]),
    };

    let head = std::str::from_utf8(head)
        .map_err(|_| ParseError::MalformedMessage("header block is not UTF-8"))?;
    Ok((head, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Iterates logical header lines, unfolding continuations (RFC 3261 §7.3.1).
struct HeaderLines<'a> {
    lines: std::iter::Peekable<std::str::Lines<'a>>,
}

impl<'a> HeaderLines<'a> {
    fn new(head: &'a str) -> Self {
        Self {
            lines: head.lines().peekable(),
        }
    }
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut line = loop {
            let candidate = self.lines.next()?;
            if !candidate.trim().is_empty() {
                break candidate.trim_end_matches('\r').to_owned();
            }
        };
        while let Some(next) = self.lines.peek() {
            if next.starts_with(' ') || next.starts_with('\t') {
                line.push(' ');
                line.push_str(next.trim());
                self.lines.next();
            } else {
                break;
            }
        }
        Some(line)
    }
}

fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim())
        .map_err(|_| ParseError::MalformedMessage("bad request line"))?;

    if !version_token.eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::UnsupportedVersion);
    }
    let method = Method::from_token(method_token);
    let uri =
        SipUri::parse(uri_token).map_err(|_| ParseError::MalformedMessage("bad request URI"))?;
    Ok(RequestLine::new(method, uri))
}

fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1,
        character::complete::u16 as nom_u16, combinator::rest, sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (version, _, code, _, reason)) =
        parser(line.trim()).map_err(|_| ParseError::MalformedMessage("bad status line"))?;

    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::UnsupportedVersion);
    }
    if !(100..=699).contains(&code) {
        return Err(ParseError::InvalidStatusCode(code));
    }
    Ok(StatusLine::new(code, reason.trim()))
}

fn parse_headers(lines: HeaderLines<'_>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::MalformedMessage("header line without colon"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(ParseError::MalformedMessage("empty header name"));
        }
        if value.is_empty() {
            return Err(ParseError::MalformedMessage("empty header value"));
        }
        if is_multi_value(larynx_core::expand_compact(name)) {
            for part in split_multi_value(value) {
                headers.append(name, part);
            }
        } else {
            headers.append(name, value);
        }
    }
    Ok(headers)
}

/// Body length is `Content-Length` when present, otherwise zero; datagram
/// padding past the declared length is ignored.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Result<Bytes, ParseError> {
    let declared = match headers.get_first("Content-Length") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::MalformedMessage("invalid Content-Length"))?,
        None => 0,
    };
    if declared > body_bytes.len() {
        return Err(ParseError::MalformedMessage(
            "body shorter than Content-Length",
        ));
    }
    Ok(Bytes::copy_from_slice(&body_bytes[..declared]))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
