// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via header (RFC 3261 §20.42).
//!
//! ```text
//! Via: SIP/2.0/UDP host:port;branch=z9hG4bK776asdhds;rport
//! ```

use std::fmt;

use smol_str::SmolStr;

use crate::uri::UriError;

/// The RFC 3261 magic cookie marking a compliant branch parameter.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed representation of a single Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    /// Protocol name and version, normally `SIP/2.0`.
    pub protocol: SmolStr,
    /// Transport token (`UDP`, `TCP`, ...), uppercased at parse time.
    pub transport: SmolStr,
    /// Sent-by host (unbracketed even for IPv6).
    pub host: SmolStr,
    /// Sent-by port, when present.
    pub port: Option<u16>,
    /// Parameters in insertion order (`branch`, `rport`, `received`, `maddr`, `ttl`).
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl ViaHeader {
    /// Builds a Via value for an outgoing request.
    pub fn new(transport: &str, host: impl Into<SmolStr>, port: u16, branch: &str) -> Self {
        Self {
            protocol: SmolStr::new("SIP/2.0"),
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: host.into(),
            port: Some(port),
            params: vec![(SmolStr::new("branch"), Some(SmolStr::new(branch)))],
        }
    }

    /// Parses a Via header value: `SIP/2.0/UDP host[:port][;param[=value]]*`.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let trimmed = input.trim();
        let mut parts = trimmed.splitn(2, ';');
        let value_part = parts.next().unwrap_or("").trim();
        let param_part = parts.next();

        let mut tokens = value_part.split_whitespace();
        let proto = tokens
            .next()
            .ok_or(UriError::Malformed("empty Via value"))?;
        let sent_by = tokens
            .next()
            .ok_or(UriError::Malformed("Via missing sent-by"))?;
        if tokens.next().is_some() {
            return Err(UriError::Malformed("unexpected tokens after sent-by"));
        }

        let mut proto_parts = proto.split('/');
        let name = proto_parts.next().unwrap_or("");
        let version = proto_parts.next().unwrap_or("");
        let transport = proto_parts
            .next()
            .ok_or(UriError::Malformed("Via protocol must be SIP/2.0/<transport>"))?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || proto_parts.next().is_some() {
            return Err(UriError::Malformed("Via protocol must be SIP/2.0/<transport>"));
        }
        if transport.is_empty() {
            return Err(UriError::Malformed("empty Via transport"));
        }

        let (host, port) = split_sent_by(sent_by)?;

        let mut params = Vec::new();
        if let Some(raw) = param_part {
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

        Ok(Self {
            protocol: SmolStr::new("SIP/2.0"),
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Looks up a parameter (case-insensitive).
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Sets or replaces a parameter.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(SmolStr::new);
        if let Some(slot) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.params
                .push((SmolStr::new(name.to_ascii_lowercase()), value));
        }
    }

    /// The `branch` parameter, if present.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    /// The `received` parameter, if present.
    pub fn received(&self) -> Option<&str> {
        self.param("received").flatten()
    }

    /// The `rport` parameter value, if present with a value.
    pub fn rport(&self) -> Option<&str> {
        self.param("rport").flatten()
    }

    /// Sent-by rendered as `host` or `host:port` (IPv6 bracketed).
    pub fn sent_by(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    /// Whether the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch().is_some_and(is_rfc3261_branch)
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}",
            self.protocol,
            self.transport,
            self.sent_by()
        )?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Returns `true` when a branch token starts with the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.starts_with(BRANCH_MAGIC_COOKIE) && branch.len() > BRANCH_MAGIC_COOKIE.len()
}

fn split_sent_by(sent_by: &str) -> Result<(&str, Option<u16>), UriError> {
    if let Some(stripped) = sent_by.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or(UriError::Malformed("unbalanced IPv6 brackets in sent-by"))?;
        let host = &stripped[..end];
        if host.is_empty() {
            return Err(UriError::Malformed("empty sent-by host"));
        }
        let rest = &stripped[end + 1..];
        if rest.is_empty() {
            return Ok((host, None));
        }
        let port = rest
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or(UriError::Malformed("invalid sent-by port"))?;
        return Ok((host, Some(port)));
    }

    if sent_by.matches(':').count() > 1 {
        return Err(UriError::Malformed("IPv6 sent-by must be bracketed"));
    }

    match sent_by.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(UriError::Malformed("empty sent-by host"));
            }
            let port = port_str
                .parse()
                .map_err(|_| UriError::Malformed("invalid sent-by port"))?;
            Ok((host, Some(port)))
        }
        None => {
            if sent_by.is_empty() {
                Err(UriError::Malformed("empty sent-by host"))
            } else {
                Ok((sent_by, None))
            }
        }
    }
}
