// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Line-oriented SDP parser.
//!
//! Accepts CRLF or LF terminated `<type>=<value>` records. Interpreted
//! attributes (`rtpmap`, `fmtp`, `ptime`, the direction flags) are folded
//! into the model; everything else is preserved verbatim on the scope
//! where it appeared.

use smol_str::SmolStr;

use crate::{
    well_known_codec, Attribute, Bandwidth, Codec, Connection, Direction, MediaDescription,
    MediaType, Origin, Protocol, SdpError, SessionDescription, Timing,
};

/// Parses an SDP body.
pub fn parse_sdp(input: &str) -> Result<SessionDescription, SdpError> {
    let mut sdp = SessionDescription {
        timing: Vec::new(),
        ..SessionDescription::default()
    };
    let mut current: Option<PendingMedia> = None;
    let mut saw_version = false;

    for raw_line in input.lines() {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let (field, value) = split_record(line)?;

        if field == 'm' {
            if let Some(done) = current.take() {
                sdp.media.push(done.finish());
            }
            current = Some(PendingMedia::parse(value)?);
            continue;
        }

        match &mut current {
            Some(media) => media.apply(field, value)?,
            None => apply_session_field(&mut sdp, &mut saw_version, field, value)?,
        }
    }

    if let Some(done) = current.take() {
        sdp.media.push(done.finish());
    }
    if sdp.timing.is_empty() {
        sdp.timing.push(Timing::default());
    }
    Ok(sdp)
}

fn split_record(line: &str) -> Result<(char, &str), SdpError> {
    let mut chars = line.chars();
    let field = chars
        .next()
        .ok_or(SdpError::Malformed("empty record"))?;
    if chars.next() != Some('=') {
        return Err(SdpError::Malformed("record is not <type>=<value>"));
    }
    Ok((field, &line[2..]))
}

fn apply_session_field(
    sdp: &mut SessionDescription,
    saw_version: &mut bool,
    field: char,
    value: &str,
) -> Result<(), SdpError> {
    match field {
        'v' => {
            sdp.version = value
                .trim()
                .parse()
                .map_err(|_| SdpError::Malformed("bad protocol version"))?;
            *saw_version = true;
        }
        'o' => sdp.origin = parse_origin(value)?,
        's' => sdp.session_name = SmolStr::new(value),
        'c' => sdp.connection = Some(parse_connection(value)?),
        'b' => sdp.bandwidth.push(parse_bandwidth(value)?),
        't' => sdp.timing.push(parse_timing(value)?),
        'a' => sdp.attributes.push(parse_attribute(value)),
        // i=, u=, e=, p=, z=, k=, r= carry no routing information here.
        _ => {}
    }
    Ok(())
}

fn parse_origin(value: &str) -> Result<Origin, SdpError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 6 {
        return Err(SdpError::Malformed("origin needs six fields"));
    }
    Ok(Origin {
        username: SmolStr::new(parts[0]),
        session_id: SmolStr::new(parts[1]),
        session_version: SmolStr::new(parts[2]),
        net_type: SmolStr::new(parts[3]),
        addr_type: crate::AddrType::of(parts[5]),
        address: SmolStr::new(parts[5]),
    })
}

fn parse_connection(value: &str) -> Result<Connection, SdpError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(SdpError::Malformed("connection needs three fields"));
    }
    Ok(Connection {
        net_type: SmolStr::new(parts[0]),
        addr_type: crate::AddrType::of(parts[2]),
        address: SmolStr::new(parts[2]),
    })
}

fn parse_bandwidth(value: &str) -> Result<Bandwidth, SdpError> {
    let (bw_type, rate) = value
        .split_once(':')
        .ok_or(SdpError::Malformed("bandwidth is not <type>:<kbps>"))?;
    Ok(Bandwidth {
        bw_type: SmolStr::new(bw_type.trim()),
        kilobits: rate
            .trim()
            .parse()
            .map_err(|_| SdpError::Malformed("bad bandwidth value"))?,
    })
}

fn parse_timing(value: &str) -> Result<Timing, SdpError> {
    let mut parts = value.split_whitespace();
    let start = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(SdpError::Malformed("bad timing start"))?;
    let stop = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(SdpError::Malformed("bad timing stop"))?;
    Ok(Timing { start, stop })
}

fn parse_attribute(value: &str) -> Attribute {
    match value.split_once(':') {
        Some((name, val)) => Attribute::Value {
            name: SmolStr::new(name),
            value: SmolStr::new(val),
        },
        None => Attribute::Flag(SmolStr::new(value)),
    }
}

/// Media section being assembled; rtpmap/fmtp arrive in any order so the
/// codec list is resolved at the end.
struct PendingMedia {
    media: MediaDescription,
    rtpmaps: Vec<Codec>,
    fmtps: Vec<(u8, SmolStr)>,
}

impl PendingMedia {
    fn parse(value: &str) -> Result<Self, SdpError> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(SdpError::Malformed("media line needs type, port, proto"));
        }
        let port = parts[1]
            .parse()
            .map_err(|_| SdpError::Malformed("bad media port"))?;
        let mut media = MediaDescription::new(
            MediaType::from_token(parts[0]),
            port,
            Protocol::from_token(parts[2]),
        );
        media.formats = parts[3..].iter().map(|f| SmolStr::new(*f)).collect();
        Ok(Self {
            media,
            rtpmaps: Vec::new(),
            fmtps: Vec::new(),
        })
    }

    fn apply(&mut self, field: char, value: &str) -> Result<(), SdpError> {
        match field {
            'c' => self.media.connection = Some(parse_connection(value)?),
            'b' => self.media.bandwidth.push(parse_bandwidth(value)?),
            'a' => self.apply_attribute(value),
            _ => {}
        }
        Ok(())
    }

    fn apply_attribute(&mut self, value: &str) {
        match parse_attribute(value) {
            Attribute::Value { name, value } if name.eq_ignore_ascii_case("rtpmap") => {
                if let Some(codec) = parse_rtpmap(&value) {
                    self.rtpmaps.push(codec);
                } else {
                    self.media.attributes.push(Attribute::Value {
                        name: SmolStr::new("rtpmap"),
                        value,
                    });
                }
            }
            Attribute::Value { name, value } if name.eq_ignore_ascii_case("fmtp") => {
                match parse_fmtp(&value) {
                    Some(entry) => self.fmtps.push(entry),
                    None => self.media.attributes.push(Attribute::Value {
                        name: SmolStr::new("fmtp"),
                        value,
                    }),
                }
            }
            Attribute::Value { name, value } if name.eq_ignore_ascii_case("ptime") => {
                self.media.ptime = value.trim().parse().ok();
            }
            Attribute::Flag(flag) => match Direction::from_token(&flag) {
                Some(direction) => self.media.direction = Some(direction),
                None => self.media.attributes.push(Attribute::Flag(flag)),
            },
            other => self.media.attributes.push(other),
        }
    }

    /// Resolves the codec list in format order: rtpmap first, then the
    /// static table, then a bare payload-type entry.
    fn finish(mut self) -> MediaDescription {
        for (pt, fmtp) in &self.fmtps {
            if let Some(codec) = self.rtpmaps.iter_mut().find(|c| c.payload_type == *pt) {
                codec.fmtp = Some(fmtp.clone());
            }
        }

        let mut codecs = Vec::with_capacity(self.media.formats.len());
        for format in &self.media.formats {
            let Ok(pt) = format.parse::<u8>() else {
                continue;
            };
            if let Some(codec) = self.rtpmaps.iter().find(|c| c.payload_type == pt) {
                codecs.push(codec.clone());
            } else if let Some(mut codec) = well_known_codec(pt) {
                if let Some((_, fmtp)) = self.fmtps.iter().find(|(fpt, _)| *fpt == pt) {
                    codec.fmtp = Some(fmtp.clone());
                }
                codecs.push(codec);
            } else {
                codecs.push(Codec {
                    payload_type: pt,
                    encoding_name: SmolStr::new(""),
                    clock_rate: 0,
                    channels: None,
                    fmtp: self
                        .fmtps
                        .iter()
                        .find(|(fpt, _)| *fpt == pt)
                        .map(|(_, f)| f.clone()),
                });
            }
        }
        self.media.codecs = codecs;
        self.media
    }
}

/// `"96 opus/48000/2"` or `"0 PCMU/8000"`.
fn parse_rtpmap(value: &str) -> Option<Codec> {
    let (pt_str, encoding) = value.trim().split_once(' ')?;
    let payload_type = pt_str.trim().parse().ok()?;
    let mut parts = encoding.trim().split('/');
    let encoding_name = SmolStr::new(parts.next()?);
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());
    Some(Codec {
        payload_type,
        encoding_name,
        clock_rate,
        channels,
        fmtp: None,
    })
}

/// `"101 0-16"`.
fn parse_fmtp(value: &str) -> Option<(u8, SmolStr)> {
    let (pt_str, rest) = value.trim().split_once(' ')?;
    let pt = pt_str.trim().parse().ok()?;
    Some((pt, SmolStr::new(rest.trim())))
}
