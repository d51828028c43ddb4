use std::fmt;

use smol_str::SmolStr;

use crate::uri::{SipUri, UriError};

/// A SIP name-addr or addr-spec (RFC 3261 §20.10): optional display name,
/// URI, and header parameters such as `tag`.
///
/// Used by From, To, Contact, Route, and Record-Route accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    /// Header parameters in insertion order (`tag`, `expires`, ...).
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl NameAddr {
    /// Wraps a bare URI with no display name or parameters.
    pub fn from_uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    /// Parses a name-addr (`"Name" <uri>;params`) or addr-spec (`uri;params`).
    ///
    /// In addr-spec form, only the `tag` parameter is treated as a header
    /// parameter; everything else belongs to the URI (RFC 3261 §20.10).
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();

        if let Some(lt) = find_unquoted(input, '<') {
            let gt = input[lt..]
                .find('>')
                .map(|i| lt + i)
                .ok_or(UriError::Malformed("unterminated angle bracket"))?;

            let display_raw = input[..lt].trim();
            let display_name = if display_raw.is_empty() {
                None
            } else {
                Some(unquote_display(display_raw)?)
            };

            let uri = SipUri::parse(&input[lt + 1..gt])?;

            let mut params = Vec::new();
            let after = input[gt + 1..].trim();
            if let Some(rest) = after.strip_prefix(';') {
                parse_params_into(rest, &mut params);
            } else if !after.is_empty() {
                return Err(UriError::Malformed("trailing bytes after angle bracket"));
            }

            return Ok(Self {
                display_name,
                uri,
                params,
            });
        }

        // addr-spec: URI and address params share ';', so peel off the tag.
        let mut uri_parts: Vec<&str> = Vec::new();
        let mut params = Vec::new();
        for (idx, part) in input.split(';').enumerate() {
            let trimmed = part.trim();
            let key = trimmed.split('=').next().unwrap_or("").trim();
            if idx > 0 && key.eq_ignore_ascii_case("tag") {
                parse_params_into(trimmed, &mut params);
            } else {
                uri_parts.push(part);
            }
        }
        let uri = SipUri::parse(&uri_parts.join(";"))?;
        Ok(Self {
            display_name: None,
            uri,
            params,
        })
    }

    /// Looks up an address parameter (case-insensitive).
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// The `tag` parameter, if present.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag").flatten()
    }

    /// Sets or replaces the `tag` parameter.
    pub fn set_tag(&mut self, tag: &str) {
        if let Some(slot) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case("tag"))
        {
            slot.1 = Some(SmolStr::new(tag));
        } else {
            self.params
                .push((SmolStr::new("tag"), Some(SmolStr::new(tag))));
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display_name {
            write!(f, "\"{}\" ", escape_display(display))?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Finds a character outside of double quotes.
fn find_unquoted(input: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Unescapes a quoted display name, or passes an unquoted token through.
fn unquote_display(raw: &str) -> Result<SmolStr, UriError> {
    if !raw.starts_with('"') {
        return Ok(SmolStr::new(raw));
    }
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or(UriError::Malformed("unterminated quoted display name"))?;

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    if escaped {
        return Err(UriError::Malformed("dangling escape in display name"));
    }
    Ok(SmolStr::new(out))
}

/// Re-escapes `"` and `\` for serialization.
fn escape_display(display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    for ch in display.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn parse_params_into(raw: &str, params: &mut Vec<(SmolStr, Option<SmolStr>)>) {
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => params.push((
                SmolStr::new(k.trim().to_ascii_lowercase()),
                Some(SmolStr::new(v.trim())),
            )),
            None => params.push((SmolStr::new(part.to_ascii_lowercase()), None)),
        }
    }
}
