// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SDP (Session Description Protocol) per RFC 4566, with the RFC 3264
//! answerer-side negotiation used when accepting a call.
//!
//! Only one audio stream is negotiated; other media in an offer are
//! carried through the model untouched so the answer can reject them.
//!
//! # Example
//! ```
//! use larynx_sdp::{negotiate_answer, parse_sdp, AnswerOptions};
//!
//! let offer = parse_sdp(
//!     "v=0\r\no=- 1 1 IN IP4 203.0.113.10\r\ns=-\r\nc=IN IP4 203.0.113.10\r\n\
//!      t=0 0\r\nm=audio 18000 RTP/AVP 0 8 101\r\na=rtpmap:0 PCMU/8000\r\n\
//!      a=rtpmap:101 telephone-event/8000\r\na=sendrecv\r\n",
//! )
//! .unwrap();
//! let (answer, chosen) =
//!     negotiate_answer(&offer, "10.0.0.5", 20002, &AnswerOptions::default()).unwrap();
//! assert_eq!(chosen, 0);
//! assert_eq!(answer.audio().unwrap().port, 20002);
//! ```

use std::fmt;

use smol_str::SmolStr;

mod negotiate;
mod parse;
mod serialize;

pub use negotiate::{negotiate_answer, AnswerOptions};
pub use parse::parse_sdp;
pub use serialize::serialize_sdp;

/// SDP-level failures surfaced to the INVITE handler; the usual response
/// is 488 Not Acceptable Here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    /// Structurally invalid session description.
    Malformed(&'static str),
    /// Offer and local capabilities share no payload type.
    NoCommonCodec,
    /// The offer contains no audio media section.
    NoAudio,
}

impl fmt::Display for SdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpError::Malformed(reason) => write!(f, "malformed SDP: {}", reason),
            SdpError::NoCommonCodec => write!(f, "no codec in common with the offer"),
            SdpError::NoAudio => write!(f, "offer has no audio media"),
        }
    }
}

impl std::error::Error for SdpError {}

/// Address family of a connection or origin line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Ip4,
    Ip6,
}

impl AddrType {
    /// Picks the family from the textual address.
    pub fn of(address: &str) -> Self {
        if address.contains(':') {
            AddrType::Ip6
        } else {
            AddrType::Ip4
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddrType::Ip4 => "IP4",
            AddrType::Ip6 => "IP6",
        }
    }
}

impl fmt::Display for AddrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin line (`o=`), RFC 4566 §5.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: SmolStr,
    pub session_id: SmolStr,
    pub session_version: SmolStr,
    pub net_type: SmolStr,
    pub addr_type: AddrType,
    pub address: SmolStr,
}

impl Origin {
    pub fn new(session_id: &str, address: &str) -> Self {
        Self {
            username: SmolStr::new("-"),
            session_id: SmolStr::new(session_id),
            session_version: SmolStr::new("0"),
            net_type: SmolStr::new("IN"),
            addr_type: AddrType::of(address),
            address: SmolStr::new(address),
        }
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new("0", "0.0.0.0")
    }
}

/// Connection line (`c=`), RFC 4566 §5.7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: SmolStr,
    pub addr_type: AddrType,
    pub address: SmolStr,
}

impl Connection {
    pub fn new(address: &str) -> Self {
        Self {
            net_type: SmolStr::new("IN"),
            addr_type: AddrType::of(address),
            address: SmolStr::new(address),
        }
    }
}

/// Bandwidth line (`b=`), RFC 4566 §5.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bandwidth {
    pub bw_type: SmolStr,
    pub kilobits: u32,
}

/// Timing line (`t=`), RFC 4566 §5.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub start: u64,
    pub stop: u64,
}

/// An uninterpreted attribute, preserved verbatim on its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// `a=<flag>`
    Flag(SmolStr),
    /// `a=<name>:<value>`
    Value { name: SmolStr, value: SmolStr },
}

/// Media stream direction, RFC 3264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// The answerer-side direction: sendonly and recvonly swap,
    /// sendrecv and inactive are symmetric.
    pub fn invert(&self) -> Self {
        match self {
            Direction::SendRecv => Direction::SendRecv,
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            Direction::Inactive => Direction::Inactive,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media kind of an `m=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Other(SmolStr),
}

impl MediaType {
    pub fn from_token(token: &str) -> Self {
        match token {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            other => MediaType::Other(SmolStr::new(other)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Other(token) => token.as_str(),
        }
    }
}

/// Transport profile of an `m=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    RtpAvp,
    RtpSavp,
    Other(SmolStr),
}

impl Protocol {
    pub fn from_token(token: &str) -> Self {
        match token {
            "RTP/AVP" => Protocol::RtpAvp,
            "RTP/SAVP" => Protocol::RtpSavp,
            other => Protocol::Other(SmolStr::new(other)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Protocol::RtpAvp => "RTP/AVP",
            Protocol::RtpSavp => "RTP/SAVP",
            Protocol::Other(token) => token.as_str(),
        }
    }
}

/// A codec resolved from `rtpmap`/`fmtp` attributes or the static table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    pub payload_type: u8,
    pub encoding_name: SmolStr,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: Option<SmolStr>,
}

impl Codec {
    /// Whether this codec is the RFC 4733 DTMF event payload.
    pub fn is_dtmf(&self) -> bool {
        self.encoding_name.eq_ignore_ascii_case("telephone-event")
    }
}

/// Static payload types recognized without an `rtpmap` (RFC 3551 Table 4).
pub fn well_known_codec(payload_type: u8) -> Option<Codec> {
    let (name, clock_rate, channels) = match payload_type {
        0 => ("PCMU", 8000, Some(1)),
        3 => ("GSM", 8000, Some(1)),
        4 => ("G723", 8000, Some(1)),
        8 => ("PCMA", 8000, Some(1)),
        9 => ("G722", 8000, Some(1)),
        18 => ("G729", 8000, Some(1)),
        _ => return None,
    };
    Some(Codec {
        payload_type,
        encoding_name: SmolStr::new(name),
        clock_rate,
        channels,
        fmtp: None,
    })
}

/// One `m=` section with its interpreted and passthrough fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub port: u16,
    pub protocol: Protocol,
    /// Payload types (or opaque format tokens) in offered order.
    pub formats: Vec<SmolStr>,
    /// Codecs resolved per format, in offered order.
    pub codecs: Vec<Codec>,
    /// Direction attribute; `None` means the RFC 3264 default (sendrecv).
    pub direction: Option<Direction>,
    pub ptime: Option<u32>,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<Bandwidth>,
    /// Attributes not interpreted above (`fingerprint`, `rtcp`, ...).
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(media_type: MediaType, port: u16, protocol: Protocol) -> Self {
        Self {
            media_type,
            port,
            protocol,
            formats: Vec::new(),
            codecs: Vec::new(),
            direction: None,
            ptime: None,
            connection: None,
            bandwidth: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Effective direction (RFC 3264 default applies when absent).
    pub fn direction_or_default(&self) -> Direction {
        self.direction.unwrap_or_default()
    }

    /// Finds the codec entry for a payload type.
    pub fn codec(&self, payload_type: u8) -> Option<&Codec> {
        self.codecs.iter().find(|c| c.payload_type == payload_type)
    }

    /// Numeric payload types in offered order.
    pub fn payload_types(&self) -> Vec<u8> {
        self.formats
            .iter()
            .filter_map(|f| f.parse::<u16>().ok())
            .filter(|&pt| pt <= 127)
            .map(|pt| pt as u8)
            .collect()
    }

    /// Appends a codec and its format entry.
    pub fn push_codec(&mut self, codec: Codec) {
        self.formats
            .push(SmolStr::new(codec.payload_type.to_string()));
        self.codecs.push(codec);
    }
}

/// A complete session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: u8,
    pub origin: Origin,
    pub session_name: SmolStr,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<Bandwidth>,
    pub timing: Vec<Timing>,
    /// Session-level attributes in original order.
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl Default for SessionDescription {
    fn default() -> Self {
        Self {
            version: 0,
            origin: Origin::default(),
            session_name: SmolStr::new("-"),
            connection: None,
            bandwidth: Vec::new(),
            timing: vec![Timing::default()],
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }
}

impl SessionDescription {
    /// The first audio media section, if any.
    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media
            .iter()
            .find(|m| m.media_type == MediaType::Audio)
    }

    /// The `(address, port)` pair RTP for the audio stream should target:
    /// media-level connection wins over the session-level one.
    pub fn rtp_address(&self) -> Option<(SmolStr, u16)> {
        let audio = self.audio()?;
        let conn = audio.connection.as_ref().or(self.connection.as_ref())?;
        Some((conn.address.clone(), audio.port))
    }
}

/// Builds a one-codec audio description suitable for a simple offer.
pub fn build_offer(
    local_ip: &str,
    rtp_port: u16,
    payload_types: &[u8],
    direction: Direction,
) -> SessionDescription {
    let mut media = MediaDescription::new(MediaType::Audio, rtp_port, Protocol::RtpAvp);
    for &pt in payload_types {
        if let Some(codec) = well_known_codec(pt) {
            media.push_codec(codec);
        } else {
            media.formats.push(SmolStr::new(pt.to_string()));
        }
    }
    media.direction = Some(direction);

    SessionDescription {
        connection: Some(Connection::new(local_ip)),
        origin: Origin::new("0", local_ip),
        media: vec![media],
        ..SessionDescription::default()
    }
}
