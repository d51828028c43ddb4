// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Header field store and structured accessors.
//!
//! Headers are kept as an ordered list of raw `name: value` pairs with
//! case-insensitive lookup. Typed views (Via, From/To, Contact, CSeq, ...)
//! are derived on demand from the raw store; mutations go through the raw
//! store so there is a single source of truth.

use std::slice::Iter;

use smol_str::SmolStr;

use crate::cseq::CSeq;
use crate::name_addr::NameAddr;
use crate::via::ViaHeader;

/// A single raw header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Ordered, case-insensitive collection of SIP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, canonicalizing the name (compact forms expand,
    /// known headers get their RFC capitalization).
    pub fn append(&mut self, name: &str, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: canonical_name(name),
            value: value.into(),
        });
    }

    /// Replaces every occurrence of `name` with a single value. The new
    /// value takes the position of the first match, or is appended.
    pub fn set_single(&mut self, name: &str, value: impl Into<SmolStr>) {
        let canonical = canonical_name(name);
        let first = self
            .0
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&canonical));
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(&canonical));
        let header = Header {
            name: canonical,
            value: value.into(),
        };
        match first {
            Some(idx) if idx <= self.0.len() => self.0.insert(idx, header),
            _ => self.0.push(header),
        }
    }

    /// Removes all values for a header.
    pub fn remove(&mut self, name: &str) {
        let canonical = canonical_name(name);
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(&canonical));
    }

    /// First value for a header (case-insensitive), if any.
    pub fn get_first(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// All values for a header in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Whether any value exists for the header.
    pub fn contains(&self, name: &str) -> bool {
        self.get_first(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    // --- Typed views ------------------------------------------------------
    //
    // All return `None` (or skip the entry) when the header is absent or
    // unparseable; callers that require the header respond 400.

    /// All Via values parsed, malformed entries skipped.
    pub fn vias(&self) -> Vec<ViaHeader> {
        self.get_all("Via")
            .filter_map(|v| ViaHeader::parse(v).ok())
            .collect()
    }

    /// The topmost Via, if present and well-formed.
    pub fn top_via(&self) -> Option<ViaHeader> {
        self.get_first("Via").and_then(|v| ViaHeader::parse(v).ok())
    }

    /// The From header as a name-addr.
    pub fn from_addr(&self) -> Option<NameAddr> {
        self.get_first("From").and_then(|v| NameAddr::parse(v).ok())
    }

    /// The To header as a name-addr.
    pub fn to_addr(&self) -> Option<NameAddr> {
        self.get_first("To").and_then(|v| NameAddr::parse(v).ok())
    }

    /// All Contact values as name-addrs.
    pub fn contacts(&self) -> Vec<NameAddr> {
        self.get_all("Contact")
            .filter_map(|v| NameAddr::parse(v).ok())
            .collect()
    }

    /// The CSeq header, parsed.
    pub fn cseq(&self) -> Option<CSeq> {
        self.get_first("CSeq").and_then(|v| CSeq::parse(v).ok())
    }

    /// The Call-ID value.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.get_first("Call-ID")
    }

    /// The Max-Forwards value, parsed.
    pub fn max_forwards(&self) -> Option<u32> {
        self.get_first("Max-Forwards").and_then(|v| v.trim().parse().ok())
    }

    /// The Content-Length value, parsed.
    pub fn content_length(&self) -> Option<usize> {
        self.get_first("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// The Content-Type value.
    pub fn content_type(&self) -> Option<&SmolStr> {
        self.get_first("Content-Type")
    }

    /// Route entries in order.
    pub fn routes(&self) -> Vec<NameAddr> {
        self.get_all("Route")
            .filter_map(|v| NameAddr::parse(v).ok())
            .collect()
    }

    /// Record-Route entries in order.
    pub fn record_routes(&self) -> Vec<NameAddr> {
        self.get_all("Record-Route")
            .filter_map(|v| NameAddr::parse(v).ok())
            .collect()
    }

    /// Allow tokens, split across lines and commas.
    pub fn allow(&self) -> Vec<SmolStr> {
        self.token_list("Allow")
    }

    /// Supported tokens, split across lines and commas.
    pub fn supported(&self) -> Vec<SmolStr> {
        self.token_list("Supported")
    }

    fn token_list(&self, name: &str) -> Vec<SmolStr> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| SmolStr::new(t.trim()))
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Expands a compact header name (RFC 3261 §7.3.3), or returns the input.
pub fn expand_compact(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.chars().next().unwrap_or(' ').to_ascii_lowercase() {
        'v' => "Via",
        'f' => "From",
        't' => "To",
        'm' => "Contact",
        'i' => "Call-ID",
        'l' => "Content-Length",
        'c' => "Content-Type",
        's' => "Subject",
        'k' => "Supported",
        'e' => "Content-Encoding",
        'x' => "Session-Expires",
        _ => name,
    }
}

/// Canonical display form for a header name: compact forms expand, known
/// headers get RFC capitalization, unknown names are title-cased per word.
pub fn canonical_name(name: &str) -> SmolStr {
    let expanded = expand_compact(name.trim());
    let known = match expanded.to_ascii_lowercase().as_str() {
        "accept" => "Accept",
        "allow" => "Allow",
        "call-id" => "Call-ID",
        "contact" => "Contact",
        "content-encoding" => "Content-Encoding",
        "content-length" => "Content-Length",
        "content-type" => "Content-Type",
        "cseq" => "CSeq",
        "expires" => "Expires",
        "from" => "From",
        "max-forwards" => "Max-Forwards",
        "mime-version" => "MIME-Version",
        "min-expires" => "Min-Expires",
        "record-route" => "Record-Route",
        "require" => "Require",
        "route" => "Route",
        "server" => "Server",
        "session-expires" => "Session-Expires",
        "subject" => "Subject",
        "supported" => "Supported",
        "to" => "To",
        "unsupported" => "Unsupported",
        "user-agent" => "User-Agent",
        "via" => "Via",
        "www-authenticate" => "WWW-Authenticate",
        _ => {
            return SmolStr::new(title_case(expanded));
        }
    };
    SmolStr::new(known)
}

/// Whether values of this header may be comma-joined on the wire and must
/// be split into separate entries on parse.
pub fn is_multi_value(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "via" | "route" | "record-route" | "contact" | "allow" | "supported"
    )
}

/// Splits a header value on commas outside double quotes and `<...>`.
pub fn split_multi_value(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0usize;

    for (idx, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                let part = value[start..idx].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

fn title_case(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
