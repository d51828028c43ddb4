// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Content-Length` framing for stream transports.
//!
//! TCP delivers a byte stream, so message boundaries must be recovered by
//! buffering up to the end of the header block and then reading exactly
//! `Content-Length` body bytes. The transport feeds raw reads into
//! [`StreamBuffer::extend`] and drains complete messages with
//! [`StreamBuffer::next_message`].

use bytes::{Bytes, BytesMut};

use crate::ParseError;

/// Maximum bytes buffered before the header terminator must appear.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Incremental framer for `Content-Length`-delimited SIP streams.
///
/// # Example
/// ```
/// use larynx_parse::StreamBuffer;
///
/// let mut buf = StreamBuffer::new();
/// buf.extend(b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 2\r\n\r\nhi");
/// let msg = buf.next_message().unwrap().unwrap();
/// assert!(msg.ends_with(b"hi"));
/// assert!(buf.next_message().unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: BytesMut,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extracts the next complete message, or `None` if more bytes are
    /// needed. Errors poison the connection; the caller should close it.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, ParseError> {
        let data = self.buf.as_ref();
        let head_end = match find_header_end(data) {
            Some(end) => end,
            None => {
                if data.len() > MAX_HEADER_SIZE {
                    return Err(ParseError::TooLarge {
                        max: MAX_HEADER_SIZE,
                        actual: data.len(),
                    });
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| ParseError::MalformedMessage("header block is not UTF-8"))?;
        let body_len = declared_content_length(head)?;
        let total = head_end + body_len;
        if total > crate::DEFAULT_MAX_MESSAGE_SIZE {
            return Err(ParseError::TooLarge {
                max: crate::DEFAULT_MAX_MESSAGE_SIZE,
                actual: total,
            });
        }
        if data.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }
}

/// Index one past the header terminator, CRLF or bare LF form.
fn find_header_end(data: &[u8]) -> Option<usize> {
    let crlf = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4);
    let lf = data
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| pos + 2);
    match (crlf, lf) {
        (Some(c), Some(l)) => Some(c.min(l)),
        (c, l) => c.or(l),
    }
}

/// Scans header lines for `Content-Length` (or compact `l`).
fn declared_content_length(head: &str) -> Result<usize, ParseError> {
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse()
                .map_err(|_| ParseError::MalformedMessage("invalid Content-Length"));
        }
    }
    Ok(0)
}
