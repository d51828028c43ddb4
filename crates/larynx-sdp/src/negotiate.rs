// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3264 answerer-side negotiation for a single audio stream.

use smol_str::SmolStr;

use crate::{
    Codec, Connection, MediaDescription, MediaType, Origin, SdpError, SessionDescription,
};

/// Knobs for building an answer.
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    /// Supported payload types in local preference order.
    pub supported: Vec<u8>,
    /// Answer `telephone-event` when the offer carries it.
    pub dtmf: bool,
    /// Packetization time for the answer; the offer's value wins when set.
    pub ptime: Option<u32>,
    /// Origin session id; a caller-provided id keeps answers reproducible.
    pub session_id: Option<SmolStr>,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            supported: vec![0, 8],
            dtmf: true,
            ptime: None,
            session_id: None,
        }
    }
}

impl AnswerOptions {
    pub fn with_supported(supported: &[u8]) -> Self {
        Self {
            supported: supported.to_vec(),
            ..Self::default()
        }
    }
}

/// Negotiates an answer to `offer` for the first audio stream.
///
/// The chosen codec is the first entry of the local supported list that
/// appears anywhere in the offered payload types (local preference wins).
/// The answer's direction is the inverse of the offered one, and
/// `telephone-event` is echoed with the offered payload type when DTMF is
/// enabled.
///
/// Returns the answer and the chosen payload type.
pub fn negotiate_answer(
    offer: &SessionDescription,
    local_ip: &str,
    rtp_port: u16,
    opts: &AnswerOptions,
) -> Result<(SessionDescription, u8), SdpError> {
    let offer_audio = offer.audio().ok_or(SdpError::NoAudio)?;
    let offered = offer_audio.payload_types();

    let chosen = opts
        .supported
        .iter()
        .copied()
        .find(|pt| offered.contains(pt))
        .ok_or(SdpError::NoCommonCodec)?;

    let mut audio = MediaDescription::new(
        MediaType::Audio,
        rtp_port,
        offer_audio.protocol.clone(),
    );

    audio.push_codec(resolve_codec(offer_audio, chosen));

    if opts.dtmf {
        if let Some(dtmf) = offer_audio.codecs.iter().find(|c| c.is_dtmf()) {
            let mut dtmf = dtmf.clone();
            if dtmf.fmtp.is_none() {
                dtmf.fmtp = Some(SmolStr::new("0-16"));
            }
            audio.push_codec(dtmf);
        }
    }

    audio.direction = Some(offer_audio.direction_or_default().invert());
    audio.ptime = offer_audio.ptime.or(opts.ptime);

    let session_id = opts
        .session_id
        .clone()
        .unwrap_or_else(|| offer.origin.session_id.clone());

    let answer = SessionDescription {
        origin: Origin::new(&session_id, local_ip),
        connection: Some(Connection::new(local_ip)),
        media: vec![audio],
        ..SessionDescription::default()
    };

    Ok((answer, chosen))
}

/// The offer's codec entry for the chosen payload type, falling back to a
/// bare entry when the offer had neither an rtpmap nor a static mapping.
fn resolve_codec(offer_audio: &MediaDescription, payload_type: u8) -> Codec {
    offer_audio
        .codec(payload_type)
        .cloned()
        .unwrap_or(Codec {
            payload_type,
            encoding_name: SmolStr::new(""),
            clock_rate: 0,
            channels: None,
            fmtp: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_sdp, serialize_sdp, AddrType, Direction};

    const CARRIER_OFFER: &str = "v=0\r\n\
o=FreeSWITCH 1234567890 1234567891 IN IP4 203.0.113.10\r\n\
s=FreeSWITCH\r\nc=IN IP4 203.0.113.10\r\nt=0 0\r\n\
m=audio 18000 RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\na=fmtp:101 0-16\r\n\
a=ptime:20\r\na=sendrecv\r\n";

    const PCMA_FIRST_OFFER: &str = "v=0\r\no=- 5000 5000 IN IP4 198.51.100.5\r\ns=-\r\n\
c=IN IP4 198.51.100.5\r\nt=0 0\r\nm=audio 20000 RTP/AVP 8 0\r\n\
a=rtpmap:8 PCMA/8000\r\na=rtpmap:0 PCMU/8000\r\na=sendrecv\r\n";

    const G722_ONLY_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\n\
c=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 20000 RTP/AVP 9\r\na=rtpmap:9 G722/8000\r\n";

    const VIDEO_ONLY_OFFER: &str = "v=0\r\no=- 4000 4000 IN IP4 10.0.0.4\r\ns=-\r\n\
c=IN IP4 10.0.0.4\r\nt=0 0\r\nm=video 18000 RTP/AVP 97\r\na=rtpmap:97 H264/90000\r\n";

    #[test]
    fn chooses_first_local_preference() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let (answer, chosen) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        assert_eq!(chosen, 0);
        let audio = answer.audio().unwrap();
        assert_eq!(audio.port, 30000);
        assert_eq!(audio.formats[0].as_str(), "0");
    }

    #[test]
    fn local_preference_beats_offer_order() {
        // Offer lists PCMA first; local list [0, 8] still picks PCMU.
        let offer = parse_sdp(PCMA_FIRST_OFFER).unwrap();
        let (_, chosen) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        assert_eq!(chosen, 0);
    }

    #[test]
    fn restricted_supported_list() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let (_, chosen) = negotiate_answer(
            &offer,
            "10.0.0.5",
            30000,
            &AnswerOptions::with_supported(&[8]),
        )
        .unwrap();
        assert_eq!(chosen, 8);
    }

    #[test]
    fn selected_pt_is_in_offer_and_supported() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let opts = AnswerOptions::with_supported(&[9, 8, 0]);
        let (_, chosen) = negotiate_answer(&offer, "10.0.0.5", 30000, &opts).unwrap();
        let offered = offer.audio().unwrap().payload_types();
        assert!(offered.contains(&chosen));
        assert!(opts.supported.contains(&chosen));
        assert_eq!(chosen, 8); // 9 not offered, 8 preferred over 0 locally
    }

    #[test]
    fn no_common_codec() {
        let offer = parse_sdp(G722_ONLY_OFFER).unwrap();
        let err = negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default())
            .unwrap_err();
        assert_eq!(err, SdpError::NoCommonCodec);
    }

    #[test]
    fn no_audio_media() {
        let offer = parse_sdp(VIDEO_ONLY_OFFER).unwrap();
        let err = negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default())
            .unwrap_err();
        assert_eq!(err, SdpError::NoAudio);
    }

    #[test]
    fn dtmf_echoed_with_offered_payload_type() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let (answer, _) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        let audio = answer.audio().unwrap();
        assert_eq!(audio.payload_types(), vec![0, 101]);
        let dtmf = audio.codec(101).unwrap();
        assert!(dtmf.is_dtmf());
        assert_eq!(dtmf.fmtp.as_deref(), Some("0-16"));
    }

    #[test]
    fn dtmf_omitted_when_disabled_or_absent() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let opts = AnswerOptions {
            dtmf: false,
            ..AnswerOptions::default()
        };
        let (answer, _) = negotiate_answer(&offer, "10.0.0.5", 30000, &opts).unwrap();
        assert_eq!(answer.audio().unwrap().payload_types(), vec![0]);

        let offer = parse_sdp(PCMA_FIRST_OFFER).unwrap();
        let (answer, _) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        assert!(answer.audio().unwrap().codecs.iter().all(|c| !c.is_dtmf()));
    }

    #[test]
    fn direction_is_inverted() {
        let offer = parse_sdp(
            "v=0\r\nc=IN IP4 10.0.0.2\r\nm=audio 16000 RTP/AVP 0\r\na=sendonly\r\n",
        )
        .unwrap();
        let (answer, _) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        assert_eq!(answer.audio().unwrap().direction, Some(Direction::RecvOnly));
    }

    #[test]
    fn answer_addressing() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let opts = AnswerOptions {
            session_id: Some(SmolStr::new("99999")),
            ..AnswerOptions::default()
        };
        let (answer, _) = negotiate_answer(&offer, "10.0.0.5", 30000, &opts).unwrap();
        assert_eq!(answer.origin.address.as_str(), "10.0.0.5");
        assert_eq!(answer.origin.session_id.as_str(), "99999");
        assert_eq!(answer.rtp_address().unwrap(), (SmolStr::new("10.0.0.5"), 30000));

        let text = serialize_sdp(&answer);
        assert!(text.contains("c=IN IP4 10.0.0.5\r\n"));
        assert!(text.contains("m=audio 30000 RTP/AVP 0 101\r\n"));
    }

    #[test]
    fn ipv6_answer_uses_ip6() {
        let offer = parse_sdp(CARRIER_OFFER).unwrap();
        let (answer, _) =
            negotiate_answer(&offer, "2001:db8::5", 30000, &AnswerOptions::default()).unwrap();
        assert_eq!(answer.connection.as_ref().unwrap().addr_type, AddrType::Ip6);
        assert!(serialize_sdp(&answer).contains("c=IN IP6 2001:db8::5\r\n"));
    }

    #[test]
    fn static_only_offer_negotiates() {
        let offer = parse_sdp("v=0\r\nc=IN IP4 10.0.0.3\r\nm=audio 17000 RTP/AVP 0 8\r\n").unwrap();
        let (answer, chosen) =
            negotiate_answer(&offer, "10.0.0.5", 30000, &AnswerOptions::default()).unwrap();
        assert_eq!(chosen, 0);
        // Static PT still gets an rtpmap from the well-known table.
        assert!(serialize_sdp(&answer).contains("a=rtpmap:0 PCMU/8000\r\n"));
    }
}
