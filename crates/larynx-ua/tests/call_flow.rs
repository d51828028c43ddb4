// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end call flows through the UAS facade with a loopback transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use larynx_core::SipUri;
use larynx_parse::{parse_message, parse_response};
use larynx_sdp::{negotiate_answer, parse_sdp, AnswerOptions, Direction};
use larynx_transaction::{TimerDefaults, TransportContext, TransportDispatcher};
use larynx_ua::{IncomingCall, Request, UserAgentConfig, UserAgentEvents, UserAgentServer};
use tokio::sync::Mutex;
use tokio::time;

#[derive(Default)]
struct LoopbackDispatcher {
    sent: Mutex<Vec<Bytes>>,
}

impl LoopbackDispatcher {
    async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }

    async fn text(&self, idx: usize) -> String {
        String::from_utf8(self.sent.lock().await[idx].to_vec()).unwrap()
    }

    async fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }
}

#[async_trait]
impl TransportDispatcher for LoopbackDispatcher {
    async fn dispatch(&self, _ctx: &TransportContext, payload: Bytes) -> Result<()> {
        self.sent.lock().await.push(payload);
        Ok(())
    }

    fn local_contact(&self) -> (String, u16) {
        ("10.0.0.1".to_owned(), 5060)
    }
}

/// Answers calls by negotiating against a fixed codec list; rejects with
/// 488 when negotiation fails. Records everything else.
struct EchoAgent {
    supported: Vec<u8>,
    ring_first: bool,
    auto_answer: bool,
    invites: Mutex<Vec<IncomingCall>>,
    byes: Mutex<Vec<(IncomingCall, Request)>>,
    cancels: Mutex<Vec<IncomingCall>>,
    infos: Mutex<Vec<Request>>,
    reinvites: Mutex<usize>,
}

impl EchoAgent {
    fn new(supported: &[u8]) -> Self {
        Self {
            supported: supported.to_vec(),
            ring_first: false,
            auto_answer: true,
            invites: Mutex::new(Vec::new()),
            byes: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            infos: Mutex::new(Vec::new()),
            reinvites: Mutex::new(0),
        }
    }

    fn silent(supported: &[u8]) -> Self {
        Self {
            auto_answer: false,
            ..Self::new(supported)
        }
    }

    fn ringing(supported: &[u8]) -> Self {
        Self {
            ring_first: true,
            ..Self::new(supported)
        }
    }
}

#[async_trait]
impl UserAgentEvents for EchoAgent {
    async fn on_invite(&self, call: IncomingCall) {
        self.invites.lock().await.push(call.clone());
        if !self.auto_answer {
            return;
        }

        let Some(offer) = call.sdp_offer() else {
            let _ = call.reject(488, "").await;
            return;
        };
        let opts = AnswerOptions::with_supported(&self.supported);
        match negotiate_answer(&offer, "10.0.0.1", 30000, &opts) {
            Ok((answer, _pt)) => {
                if self.ring_first {
                    call.ringing(None).await;
                }
                call.accept(&answer).await.unwrap();
            }
            Err(_) => {
                let _ = call.reject(488, "").await;
            }
        }
    }

    async fn on_bye(&self, call: IncomingCall, request: Request) {
        self.byes.lock().await.push((call, request));
    }

    async fn on_cancel(&self, call: IncomingCall) {
        self.cancels.lock().await.push(call);
    }

    async fn on_info(&self, _call: IncomingCall, request: Request) {
        self.infos.lock().await.push(request);
    }

    async fn on_reinvite(&self, call: IncomingCall) {
        *self.reinvites.lock().await += 1;
        let _ = call.reject(488, "").await;
    }
}

fn server(agent: Arc<EchoAgent>) -> (UserAgentServer, Arc<LoopbackDispatcher>) {
    let dispatcher = Arc::new(LoopbackDispatcher::default());
    let config = UserAgentConfig::new(SipUri::parse("sip:agent@voice.example.com").unwrap());
    let uas = UserAgentServer::new(dispatcher.clone(), config, agent);
    (uas, dispatcher)
}

fn ctx() -> TransportContext {
    TransportContext::udp("203.0.113.10:5060".parse().unwrap())
}

const OFFER_PCMU_PCMA: &str = "v=0\r\n\
o=gw 1 1 IN IP4 203.0.113.10\r\n\
s=-\r\n\
c=IN IP4 203.0.113.10\r\n\
t=0 0\r\n\
m=audio 20000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=sendrecv\r\n";

const OFFER_G722_ONLY: &str = "v=0\r\n\
o=gw 2 2 IN IP4 203.0.113.10\r\n\
s=-\r\n\
c=IN IP4 203.0.113.10\r\n\
t=0 0\r\n\
m=audio 20000 RTP/AVP 9\r\n\
a=rtpmap:9 G722/8000\r\n";

fn invite_bytes(call_id: &str, branch: &str, offer: &str) -> Bytes {
    let msg = format!(
        "INVITE sip:agent@voice.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 203.0.113.10:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: \"Gateway\" <sip:gw@example.com>;tag=gw-tag-1\r\n\
To: <sip:agent@voice.example.com>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 100 INVITE\r\n\
Contact: <sip:gw@203.0.113.10:5060>\r\n\
X-Room-ID: room-7\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {len}\r\n\r\n{offer}",
        len = offer.len(),
    );
    Bytes::from(msg)
}

fn in_dialog_bytes(
    method: &str,
    call_id: &str,
    branch: &str,
    to_tag: &str,
    cseq: u32,
) -> Bytes {
    let msg = format!(
        "{method} sip:agent@voice.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 203.0.113.10:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:gw@example.com>;tag=gw-tag-1\r\n\
To: <sip:agent@voice.example.com>;tag={to_tag}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} {method}\r\n\
Content-Length: 0\r\n\r\n",
    );
    Bytes::from(msg)
}

/// The To tag the server answered with, from the last response sent.
async fn answered_to_tag(dispatcher: &LoopbackDispatcher) -> String {
    for text in dispatcher.texts().await.iter().rev() {
        if text.starts_with("SIP/2.0 200") || text.starts_with("SIP/2.0 180") {
            let response = parse_response(&Bytes::from(text.clone())).unwrap();
            if let Some(tag) = response.headers.to_addr().unwrap().tag() {
                return tag.to_owned();
            }
        }
    }
    panic!("no tagged response sent yet");
}

#[tokio::test]
async fn invite_with_common_codec_gets_200_with_answer() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-1", "z9hG4bKe2e1", OFFER_PCMU_PCMA), ctx())
        .await;

    let texts = dispatcher.texts().await;
    let ok = texts
        .iter()
        .find(|t| t.starts_with("SIP/2.0 200 OK"))
        .expect("no 200 OK sent");
    assert!(ok.contains("Content-Type: application/sdp"));
    assert!(ok.contains("Contact: <sip:10.0.0.1:5060>"));

    let response = parse_response(&Bytes::from(ok.clone())).unwrap();
    let answer = parse_sdp(std::str::from_utf8(&response.body).unwrap()).unwrap();
    let audio = answer.audio().unwrap();
    assert_eq!(audio.port, 30000);
    assert_eq!(audio.payload_types(), vec![0]);
    assert_eq!(audio.direction_or_default(), Direction::SendRecv);
}

#[tokio::test]
async fn invite_without_common_codec_gets_488() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-2", "z9hG4bKe2e2", OFFER_G722_ONLY), ctx())
        .await;

    let texts = dispatcher.texts().await;
    assert!(texts
        .iter()
        .any(|t| t.starts_with("SIP/2.0 488 Not Acceptable Here")));
    // The rejected call leaves no dialog behind.
    assert!(uas.dialogs().is_empty());
}

#[tokio::test]
async fn cancel_before_final_yields_487_and_200() {
    let agent = Arc::new(EchoAgent::silent(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-3", "z9hG4bKe2e3", OFFER_PCMU_PCMA), ctx())
        .await;
    assert_eq!(uas.active_calls(), 1);

    // CANCEL reuses the INVITE's branch and CSeq number.
    let cancel = Bytes::from(format!(
        "CANCEL sip:agent@voice.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 203.0.113.10:5060;branch=z9hG4bKe2e3\r\n\
From: <sip:gw@example.com>;tag=gw-tag-1\r\n\
To: <sip:agent@voice.example.com>\r\n\
Call-ID: call-3\r\n\
CSeq: 100 CANCEL\r\n\
Content-Length: 0\r\n\r\n"
    ));
    uas.handle_datagram(cancel, ctx()).await;

    let texts = dispatcher.texts().await;
    let cancel_ok = texts.iter().find(|t| {
        t.starts_with("SIP/2.0 200 OK") && t.contains("CSeq: 100 CANCEL")
    });
    assert!(cancel_ok.is_some(), "no 200 for the CANCEL");
    assert!(texts
        .iter()
        .any(|t| t.starts_with("SIP/2.0 487 Request Terminated")));

    // No dialog or call survives.
    assert!(uas.dialogs().is_empty());
    assert_eq!(uas.active_calls(), 0);
    assert_eq!(agent.cancels.lock().await.len(), 1);
}

#[tokio::test]
async fn accepted_call_confirms_on_ack_and_hangs_up_via_bye() {
    let agent = Arc::new(EchoAgent::ringing(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-4", "z9hG4bKe2e4", OFFER_PCMU_PCMA), ctx())
        .await;

    // 180 then 200, both carrying the same To tag.
    let texts = dispatcher.texts().await;
    assert!(texts.iter().any(|t| t.starts_with("SIP/2.0 180 Ringing")));
    assert!(texts.iter().any(|t| t.starts_with("SIP/2.0 200 OK")));
    drop(texts);
    let tag = answered_to_tag(&dispatcher).await;

    // ACK confirms the dialog (ACK to 2xx carries the INVITE's CSeq).
    uas.handle_datagram(
        in_dialog_bytes("ACK", "call-4", "z9hG4bKe2e4ack", &tag, 100),
        ctx(),
    )
    .await;

    let call = uas.call("call-4").expect("call still tracked");
    let dialog = uas.dialogs().get(call.dialog_id()).expect("dialog");
    assert_eq!(dialog.state, larynx_ua::DialogState::Confirmed);

    // Hang up from our side: in-dialog BYE to the remote Contact.
    let sent_before = dispatcher.count().await;
    let _handle = call.hangup().await.unwrap();
    let bye = dispatcher.text(sent_before).await;
    assert!(bye.starts_with("BYE sip:gw@203.0.113.10:5060 SIP/2.0"));
    assert!(bye.contains("CSeq: "));
    assert!(bye.contains(" BYE\r\n"));
    assert!(bye.contains(&format!("From: <sip:agent@voice.example.com>;tag={tag}")));
    assert!(bye.contains("To: <sip:gw@example.com>;tag=gw-tag-1"));
}

#[tokio::test]
async fn bye_from_peer_is_answered_and_dispatched() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-5", "z9hG4bKe2e5", OFFER_PCMU_PCMA), ctx())
        .await;
    let tag = answered_to_tag(&dispatcher).await;
    uas.handle_datagram(
        in_dialog_bytes("ACK", "call-5", "z9hG4bKe2e5ack", &tag, 100),
        ctx(),
    )
    .await;

    uas.handle_datagram(
        in_dialog_bytes("BYE", "call-5", "z9hG4bKe2e5bye", &tag, 101),
        ctx(),
    )
    .await;

    let texts = dispatcher.texts().await;
    assert!(texts
        .iter()
        .any(|t| t.starts_with("SIP/2.0 200 OK") && t.contains("CSeq: 101 BYE")));
    assert_eq!(agent.byes.lock().await.len(), 1);
    assert!(uas.dialogs().is_empty());
    assert_eq!(uas.active_calls(), 0);
}

#[tokio::test]
async fn bye_without_dialog_gets_481() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent);

    uas.handle_datagram(
        in_dialog_bytes("BYE", "nosuch", "z9hG4bKlost", "zz", 1),
        ctx(),
    )
    .await;
    assert!(dispatcher
        .text(0)
        .await
        .starts_with("SIP/2.0 481 Call/Transaction Does Not Exist"));
}

#[tokio::test]
async fn options_answered_with_allow() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent);

    let options = Bytes::from(
        "OPTIONS sip:agent@voice.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 203.0.113.10:5060;branch=z9hG4bKopt\r\n\
From: <sip:gw@example.com>;tag=o1\r\n\
To: <sip:agent@voice.example.com>\r\n\
Call-ID: opt-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
            .to_owned(),
    );
    uas.handle_datagram(options, ctx()).await;

    let text = dispatcher.text(0).await;
    assert!(text.starts_with("SIP/2.0 200 OK"));
    assert!(text.contains("Allow: INVITE, ACK, BYE, CANCEL, OPTIONS, INFO"));
}

#[tokio::test]
async fn info_in_dialog_is_acknowledged_and_surfaced() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-6", "z9hG4bKe2e6", OFFER_PCMU_PCMA), ctx())
        .await;
    let tag = answered_to_tag(&dispatcher).await;
    uas.handle_datagram(
        in_dialog_bytes("ACK", "call-6", "z9hG4bKe2e6ack", &tag, 100),
        ctx(),
    )
    .await;

    uas.handle_datagram(
        in_dialog_bytes("INFO", "call-6", "z9hG4bKe2e6info", &tag, 101),
        ctx(),
    )
    .await;

    let texts = dispatcher.texts().await;
    assert!(texts
        .iter()
        .any(|t| t.starts_with("SIP/2.0 200 OK") && t.contains("CSeq: 101 INFO")));
    assert_eq!(agent.infos.lock().await.len(), 1);
}

#[tokio::test]
async fn x_headers_surface_on_the_call() {
    let agent = Arc::new(EchoAgent::silent(&[0, 8]));
    let (uas, _dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-7", "z9hG4bKe2e7", OFFER_PCMU_PCMA), ctx())
        .await;

    let invites = agent.invites.lock().await;
    let call = &invites[0];
    assert_eq!(call.x_headers().len(), 1);
    assert_eq!(call.x_headers()[0].0.as_str(), "X-Room-Id");
    assert_eq!(call.x_headers()[0].1.as_str(), "room-7");
    assert_eq!(
        call.caller().unwrap().display_name.as_deref(),
        Some("Gateway")
    );
    assert_eq!(
        call.callee().unwrap().uri.to_string(),
        "sip:agent@voice.example.com"
    );
}

#[tokio::test]
async fn silent_application_triggers_automatic_trying() {
    let agent = Arc::new(EchoAgent::silent(&[0, 8]));
    let dispatcher = Arc::new(LoopbackDispatcher::default());
    let mut config = UserAgentConfig::new(SipUri::parse("sip:agent@voice.example.com").unwrap());
    config.trying_delay = Duration::from_millis(20);
    let uas = UserAgentServer::new(dispatcher.clone(), config, agent);

    uas.handle_datagram(invite_bytes("call-8", "z9hG4bKe2e8", OFFER_PCMU_PCMA), ctx())
        .await;
    assert_eq!(dispatcher.count().await, 0);

    time::sleep(Duration::from_millis(80)).await;
    let text = dispatcher.text(0).await;
    assert!(text.starts_with("SIP/2.0 100 Trying"));
    // 100 Trying never invents a To tag.
    let response = parse_response(&Bytes::from(text)).unwrap();
    assert!(response.headers.to_addr().unwrap().tag().is_none());
}

#[tokio::test]
async fn reinvite_is_dispatched_and_488_keeps_the_session() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent.clone());

    uas.handle_datagram(invite_bytes("call-9", "z9hG4bKe2e9", OFFER_PCMU_PCMA), ctx())
        .await;
    let tag = answered_to_tag(&dispatcher).await;
    uas.handle_datagram(
        in_dialog_bytes("ACK", "call-9", "z9hG4bKe2e9ack", &tag, 100),
        ctx(),
    )
    .await;

    // A re-INVITE on the confirmed dialog.
    let reinvite = Bytes::from(format!(
        "INVITE sip:agent@voice.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 203.0.113.10:5060;branch=z9hG4bKe2e9re\r\n\
From: <sip:gw@example.com>;tag=gw-tag-1\r\n\
To: <sip:agent@voice.example.com>;tag={tag}\r\n\
Call-ID: call-9\r\n\
CSeq: 101 INVITE\r\n\
Contact: <sip:gw@203.0.113.10:5060>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {len}\r\n\r\n{offer}",
        offer = OFFER_G722_ONLY,
        len = OFFER_G722_ONLY.len(),
    ));
    uas.handle_datagram(reinvite, ctx()).await;

    assert_eq!(*agent.reinvites.lock().await, 1);
    let texts = dispatcher.texts().await;
    assert!(texts
        .iter()
        .any(|t| t.starts_with("SIP/2.0 488") && t.contains("CSeq: 101 INVITE")));

    // The session itself survives the refused refresh.
    let call = uas.call("call-9").expect("call kept");
    let dialog = uas.dialogs().get(call.dialog_id()).unwrap();
    assert_eq!(dialog.state, larynx_ua::DialogState::Confirmed);
}

#[tokio::test]
async fn malformed_datagram_is_dropped_silently() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent);

    uas.handle_datagram(Bytes::from_static(b"not sip at all\r\n\r\n"), ctx())
        .await;
    uas.handle_datagram(Bytes::from_static(b"INVITE sip:x SIP/9.9\r\n\r\n"), ctx())
        .await;
    assert_eq!(dispatcher.count().await, 0);
}

#[tokio::test]
async fn accepted_call_without_ack_retransmits_200() {
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let dispatcher = Arc::new(LoopbackDispatcher::default());
    let config = UserAgentConfig::new(SipUri::parse("sip:agent@voice.example.com").unwrap());
    let uas = UserAgentServer::with_timers(
        dispatcher.clone(),
        config,
        agent,
        TimerDefaults {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(50),
        },
    );

    uas.handle_datagram(invite_bytes("call-10", "z9hG4bKe2e10", OFFER_PCMU_PCMA), ctx())
        .await;
    let initial = dispatcher.count().await;

    // No ACK: the 200 goes out again on the T1-doubling schedule, and the
    // dialog is torn down after 64*T1.
    time::sleep(Duration::from_millis(100)).await;
    assert!(dispatcher.count().await > initial, "200 was not retransmitted");

    time::sleep(Duration::from_millis(900)).await;
    assert!(uas.dialogs().is_empty(), "dialog not torn down without ACK");
    assert_eq!(uas.active_calls(), 0);
}

#[tokio::test]
async fn retransmitted_invite_does_not_create_a_second_call() {
    let agent = Arc::new(EchoAgent::silent(&[0, 8]));
    let (uas, _dispatcher) = server(agent.clone());

    let invite = invite_bytes("call-11", "z9hG4bKe2e11", OFFER_PCMU_PCMA);
    uas.handle_datagram(invite.clone(), ctx()).await;
    uas.handle_datagram(invite, ctx()).await;

    assert_eq!(agent.invites.lock().await.len(), 1);
    assert_eq!(uas.active_calls(), 1);
}

#[tokio::test]
async fn responses_route_through_to_the_client_side() {
    // A response with no matching client transaction is absorbed without
    // any reply on the wire.
    let agent = Arc::new(EchoAgent::new(&[0, 8]));
    let (uas, dispatcher) = server(agent);
    let stray = Bytes::from_static(
        b"SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKnope\r\n\
From: <sip:agent@voice.example.com>;tag=a\r\n\
To: <sip:gw@example.com>;tag=b\r\n\
Call-ID: stray\r\n\
CSeq: 1 BYE\r\n\
Content-Length: 0\r\n\r\n",
    );
    let msg = parse_message(&stray).unwrap();
    uas.handle_message(msg, ctx()).await;
    assert_eq!(dispatcher.count().await, 0);
}
