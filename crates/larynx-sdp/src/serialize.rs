// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Canonical SDP emission (RFC 4566 §5 field order).

use std::fmt::Write;

use crate::{Attribute, MediaDescription, SessionDescription};

/// Serializes a session description with CRLF line endings, fields in
/// canonical order: `v o s c b t` and session attributes, then each media
/// section with `m c b` followed by `rtpmap`, `fmtp`, `ptime`, direction,
/// and passthrough attributes.
pub fn serialize_sdp(sdp: &SessionDescription) -> String {
    let mut out = String::new();

    let _ = writeln_crlf(&mut out, format_args!("v={}", sdp.version));
    let o = &sdp.origin;
    let _ = writeln_crlf(
        &mut out,
        format_args!(
            "o={} {} {} {} {} {}",
            o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.address
        ),
    );
    let _ = writeln_crlf(&mut out, format_args!("s={}", sdp.session_name));
    if let Some(conn) = &sdp.connection {
        let _ = writeln_crlf(
            &mut out,
            format_args!("c={} {} {}", conn.net_type, conn.addr_type, conn.address),
        );
    }
    for bw in &sdp.bandwidth {
        let _ = writeln_crlf(&mut out, format_args!("b={}:{}", bw.bw_type, bw.kilobits));
    }
    for timing in &sdp.timing {
        let _ = writeln_crlf(&mut out, format_args!("t={} {}", timing.start, timing.stop));
    }
    for attr in &sdp.attributes {
        write_attribute(&mut out, attr);
    }
    for media in &sdp.media {
        write_media(&mut out, media);
    }
    out
}

fn write_media(out: &mut String, media: &MediaDescription) {
    let formats = media
        .formats
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln_crlf(
        out,
        format_args!(
            "m={} {} {}{}{}",
            media.media_type.as_str(),
            media.port,
            media.protocol.as_str(),
            if formats.is_empty() { "" } else { " " },
            formats
        ),
    );
    if let Some(conn) = &media.connection {
        let _ = writeln_crlf(
            out,
            format_args!("c={} {} {}", conn.net_type, conn.addr_type, conn.address),
        );
    }
    for bw in &media.bandwidth {
        let _ = writeln_crlf(out, format_args!("b={}:{}", bw.bw_type, bw.kilobits));
    }
    for codec in &media.codecs {
        if codec.encoding_name.is_empty() {
            continue;
        }
        match codec.channels {
            Some(channels) if channels > 1 => {
                let _ = writeln_crlf(
                    out,
                    format_args!(
                        "a=rtpmap:{} {}/{}/{}",
                        codec.payload_type, codec.encoding_name, codec.clock_rate, channels
                    ),
                );
            }
            _ => {
                let _ = writeln_crlf(
                    out,
                    format_args!(
                        "a=rtpmap:{} {}/{}",
                        codec.payload_type, codec.encoding_name, codec.clock_rate
                    ),
                );
            }
        }
    }
    for codec in &media.codecs {
        if let Some(fmtp) = &codec.fmtp {
            let _ = writeln_crlf(
                out,
                format_args!("a=fmtp:{} {}", codec.payload_type, fmtp),
            );
        }
    }
    if let Some(ptime) = media.ptime {
        let _ = writeln_crlf(out, format_args!("a=ptime:{}", ptime));
    }
    if let Some(direction) = media.direction {
        let _ = writeln_crlf(out, format_args!("a={}", direction));
    }
    for attr in &media.attributes {
        write_attribute(out, attr);
    }
}

fn write_attribute(out: &mut String, attr: &Attribute) {
    match attr {
        Attribute::Flag(flag) => {
            let _ = writeln_crlf(out, format_args!("a={}", flag));
        }
        Attribute::Value { name, value } => {
            let _ = writeln_crlf(out, format_args!("a={}:{}", name, value));
        }
    }
}

fn writeln_crlf(out: &mut String, args: std::fmt::Arguments<'_>) -> std::fmt::Result {
    out.write_fmt(args)?;
    out.push_str("\r\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_sdp;

    #[test]
    fn emits_canonical_field_order() {
        let sdp = parse_sdp(
            "v=0\r\no=- 7 7 IN IP4 10.0.0.1\r\ns=call\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
m=audio 4000 RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\na=fmtp:101 0-16\r\na=ptime:20\r\na=sendrecv\r\n",
        )
        .unwrap();
        let text = serialize_sdp(&sdp);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "v=0");
        assert!(lines[1].starts_with("o=- 7 7 IN IP4"));
        assert_eq!(lines[2], "s=call");
        assert_eq!(lines[3], "c=IN IP4 10.0.0.1");
        assert_eq!(lines[4], "t=0 0");
        assert_eq!(lines[5], "m=audio 4000 RTP/AVP 0 101");
        assert!(text.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(text.contains("a=fmtp:101 0-16\r\n"));
        assert!(text.contains("a=ptime:20\r\n"));
        assert!(text.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn roundtrip_is_stable() {
        let text = "v=0\r\no=- 1 2 IN IP4 192.0.2.5\r\ns=-\r\nc=IN IP4 192.0.2.5\r\nt=0 0\r\n\
b=AS:128\r\nm=audio 9000 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000\r\na=sendonly\r\n";
        let parsed = parse_sdp(text).unwrap();
        let emitted = serialize_sdp(&parsed);
        let reparsed = parse_sdp(&emitted).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn preserved_attributes_follow_interpreted_ones() {
        let sdp = parse_sdp(
            "v=0\r\nm=audio 4000 RTP/AVP 0\r\na=fingerprint:sha-256 AA\r\na=sendrecv\r\n",
        )
        .unwrap();
        let text = serialize_sdp(&sdp);
        let dir = text.find("a=sendrecv").unwrap();
        let fp = text.find("a=fingerprint").unwrap();
        assert!(dir < fp);
    }

    #[test]
    fn ipv6_connection_uses_ip6() {
        let sdp = parse_sdp("v=0\r\nc=IN IP6 2001:db8::1\r\nm=audio 4000 RTP/AVP 0\r\n").unwrap();
        assert!(serialize_sdp(&sdp).contains("c=IN IP6 2001:db8::1\r\n"));
    }
}
