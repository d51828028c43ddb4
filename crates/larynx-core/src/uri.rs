// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Errors produced while parsing a SIP URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// Missing or unrecognised scheme, empty host, unbalanced brackets, or
    /// an otherwise unparseable URI.
    Malformed(&'static str),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriError::Malformed(reason) => write!(f, "malformed SIP URI: {}", reason),
        }
    }
}

impl std::error::Error for UriError {}

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19.1).
///
/// Parameters and URI headers preserve their insertion order, so a
/// parse → serialize round trip reproduces the original ordering.
///
/// # Examples
///
/// ```
/// use larynx_core::SipUri;
///
/// let uri = SipUri::parse("sip:alice@example.com:5070;transport=tcp").unwrap();
/// assert_eq!(uri.user.as_deref(), Some("alice"));
/// assert_eq!(uri.host.as_str(), "example.com");
/// assert_eq!(uri.port, Some(5070));
/// assert_eq!(uri.transport(), Some("tcp"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub password: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    /// URI parameters in insertion order; `None` values are valueless flags.
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
    /// URI headers (`?name=value&...`) in insertion order.
    pub headers: Vec<(SmolStr, SmolStr)>,
}

impl SipUri {
    /// Constructs a plain `sip:` URI with the given host.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Constructs a `sip:host:port` URI, the usual shape for Via/Contact
    /// values built from a local socket address.
    pub fn with_host_port(host: impl Into<SmolStr>, port: u16) -> Self {
        let mut uri = Self::new(host);
        uri.port = Some(port);
        uri
    }

    /// Parses a SIP or SIPS URI.
    ///
    /// Accepts `scheme:[user[:password]@]host[:port][;param[=value]]*[?hdr=value&...]`.
    /// IPv6 hosts must be bracketed.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let (scheme, rest) = input
            .split_once(':')
            .ok_or(UriError::Malformed("missing scheme"))?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return Err(UriError::Malformed("scheme is not sip or sips"));
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut params = Vec::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter
            .next()
            .ok_or(UriError::Malformed("empty URI body"))?
            .trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.push((
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                )),
                None => params.push((SmolStr::new(param.to_ascii_lowercase()), None)),
            }
        }

        let (userinfo, host_port) = match base.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo.trim()), host.trim()),
            None => (None, base),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (Some(decode_user(user)?), Some(SmolStr::new(password))),
                None => (Some(decode_user(info)?), None),
            },
            None => (None, None),
        };

        if host_port.is_empty() {
            return Err(UriError::Malformed("empty host"));
        }

        let (host, port) = split_host_port(host_port)?;

        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                if let Some((k, v)) = pair.split_once('=') {
                    headers.push((SmolStr::new(k.trim()), SmolStr::new(v.trim())));
                }
            }
        }

        Ok(Self {
            sips,
            user,
            password,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
            headers,
        })
    }

    /// Returns the scheme string (`sip` or `sips`).
    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    /// Looks up a URI parameter by name (case-insensitive).
    ///
    /// Returns `Some(None)` for a valueless flag parameter such as `;lr`.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// The `transport` parameter, lowercased at parse time.
    pub fn transport(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    /// Whether the URI carries the loose-routing flag (`;lr`).
    pub fn is_loose_router(&self) -> bool {
        self.param("lr").is_some()
    }

    /// Appends or replaces a parameter, preserving the position of an
    /// existing entry with the same name.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let name_lower = SmolStr::new(name.to_ascii_lowercase());
        let value = value.map(SmolStr::new);
        if let Some(slot) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.params.push((name_lower, value));
        }
    }

    /// The default port for this scheme when none is present.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if !self.headers.is_empty() {
            write!(f, "?")?;
            for (idx, (name, value)) in self.headers.iter().enumerate() {
                if idx > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{}={}", name, value)?;
            }
        }
        Ok(())
    }
}

fn decode_user(raw: &str) -> Result<SmolStr, UriError> {
    percent_decode_str(raw.trim())
        .decode_utf8()
        .map(|s| SmolStr::new(s.as_ref()))
        .map_err(|_| UriError::Malformed("user part is not valid UTF-8"))
}

/// Splits `host[:port]`, handling bracketed IPv6 literals.
fn split_host_port(input: &str) -> Result<(&str, Option<u16>), UriError> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or(UriError::Malformed("unbalanced IPv6 brackets"))?;
        let host = &stripped[..end];
        if host.is_empty() {
            return Err(UriError::Malformed("empty host"));
        }
        let remainder = &stripped[end + 1..];
        if remainder.is_empty() {
            return Ok((host, None));
        }
        let port_str = remainder
            .strip_prefix(':')
            .ok_or(UriError::Malformed("trailing bytes after IPv6 literal"))?;
        let port = port_str
            .parse()
            .map_err(|_| UriError::Malformed("invalid port"))?;
        return Ok((host, Some(port)));
    }

    if input.contains(']') {
        return Err(UriError::Malformed("unbalanced IPv6 brackets"));
    }
    if input.matches(':').count() > 1 {
        return Err(UriError::Malformed("IPv6 host must be bracketed"));
    }

    match input.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(UriError::Malformed("empty host"));
            }
            let port = port_str
                .parse()
                .map_err(|_| UriError::Malformed("invalid port"))?;
            Ok((host, Some(port)))
        }
        None => Ok((input, None)),
    }
}
