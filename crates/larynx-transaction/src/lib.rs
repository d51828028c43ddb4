// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! Each transaction is a pure state machine ([`fsm`]) that turns events
//! into action lists; the [`TransactionManager`] owns the machines, keys
//! inbound messages to them, runs the retransmission/timeout timers, and
//! pushes outbound bytes through the embedder's [`TransportDispatcher`].

use larynx_core::{Headers, Method, Request, RequestLine, Response};
use smol_str::SmolStr;

pub mod fsm;
pub mod manager;
pub mod timers;
pub mod transport;

pub use fsm::{
    ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
    ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
};
pub use manager::{
    ClientTransactionUser, ReceiveOutcome, ServerTransactionHandle, TransactionManager,
};
pub use timers::{TimerDefaults, TimerTable};
pub use transport::{response_destination, TransportContext, TransportDispatcher, TransportKind};

/// Why a transaction terminated, as reported to the transaction user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// Ordinary completion (final response handled, wait timers drained).
    Normal,
    /// No final response (or no ACK) within 64·T1.
    Timeout,
    /// The dispatcher failed to send.
    TransportError,
}

/// Timers of the §17 state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction identifier.
///
/// Compliant peers are matched on `(branch, top-Via sent-by, method)` for
/// server transactions and `(branch, method)` for client transactions;
/// the sent-by field is simply empty where it does not participate.
/// Requests from pre-RFC 3261 peers carry no usable branch, so a
/// substitute key is derived from Call-ID and CSeq instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub sent_by: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Server-side key for an inbound request.
    pub fn server(request: &Request) -> Self {
        let (branch, sent_by) = branch_and_sent_by(&request.headers);
        Self {
            branch: branch.unwrap_or_else(|| legacy_branch(&request.headers)),
            sent_by,
            method: request.start.method.clone(),
            is_server: true,
        }
    }

    /// Client-side key for an outbound request.
    pub fn client(request: &Request) -> Option<Self> {
        let (branch, _) = branch_and_sent_by(&request.headers);
        Some(Self {
            branch: branch?,
            sent_by: SmolStr::default(),
            method: request.start.method.clone(),
            is_server: false,
        })
    }

    /// Client-side key matching an inbound response (top Via branch plus
    /// CSeq method, RFC 3261 §17.1.3).
    pub fn client_for_response(response: &Response) -> Option<Self> {
        let (branch, _) = branch_and_sent_by(&response.headers);
        let method = response.headers.cseq()?.method;
        Some(Self {
            branch: branch?,
            sent_by: SmolStr::default(),
            method,
            is_server: false,
        })
    }

    /// The same key with a different method; CANCEL and ACK match the
    /// transaction of the request they refer to.
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            branch: self.branch.clone(),
            sent_by: self.sent_by.clone(),
            method,
            is_server: self.is_server,
        }
    }
}

fn branch_and_sent_by(headers: &Headers) -> (Option<SmolStr>, SmolStr) {
    match headers.top_via() {
        Some(via) => (
            via.branch().map(SmolStr::new),
            SmolStr::new(via.sent_by()),
        ),
        None => (None, SmolStr::default()),
    }
}

/// Substitute branch for peers that predate the magic cookie: Call-ID and
/// CSeq stand in (RFC 3261 §17.2.3 fallback matching, flattened).
fn legacy_branch(headers: &Headers) -> SmolStr {
    let call_id = headers.call_id().map(|v| v.as_str()).unwrap_or("-");
    let cseq = headers
        .get_first("CSeq")
        .map(|v| v.as_str())
        .unwrap_or("-");
    SmolStr::new(format!("legacy:{}:{}", call_id, cseq))
}

/// Builds the ACK for a non-2xx final response (RFC 3261 §17.1.1.3).
///
/// The ACK reuses the INVITE's request URI, top Via (same branch), From,
/// Call-ID, and CSeq number; the To comes from the response so the tag
/// matches.
pub fn ack_for_non_2xx(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get_first("Via") {
        headers.append("Via", via.clone());
    }
    if let Some(from) = invite.headers.get_first("From") {
        headers.append("From", from.clone());
    }
    let to = response
        .headers
        .get_first("To")
        .or_else(|| invite.headers.get_first("To"));
    if let Some(to) = to {
        headers.append("To", to.clone());
    }
    if let Some(call_id) = invite.headers.call_id() {
        headers.append("Call-ID", call_id.clone());
    }
    if let Some(cseq) = invite.headers.cseq() {
        headers.append("CSeq", format!("{} ACK", cseq.seq));
    }
    headers.append("Max-Forwards", "70");
    for route in invite.headers.get_all("Route") {
        headers.append("Route", route.clone());
    }

    Request::new(
        RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers,
        bytes::Bytes::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use larynx_core::{SipUri, StatusLine};

    fn invite_with_via(branch: &str) -> Request {
        let mut headers = Headers::new();
        headers.append(
            "Via",
            format!("SIP/2.0/UDP client.example.com:5060;branch={branch}"),
        );
        headers.append("From", "<sip:alice@example.com>;tag=1");
        headers.append("To", "<sip:bob@example.com>");
        headers.append("Call-ID", "call-1");
        headers.append("CSeq", "7 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn server_key_includes_sent_by() {
        let key = TransactionKey::server(&invite_with_via("z9hG4bKabc"));
        assert_eq!(key.branch.as_str(), "z9hG4bKabc");
        assert_eq!(key.sent_by.as_str(), "client.example.com:5060");
        assert_eq!(key.method, Method::Invite);
        assert!(key.is_server);
    }

    #[test]
    fn cancel_key_substitutes_method() {
        let key = TransactionKey::server(&invite_with_via("z9hG4bKabc"));
        let cancel_view = key.with_method(Method::Cancel);
        assert_eq!(cancel_view.branch, key.branch);
        assert_ne!(cancel_view, key);
        assert_eq!(cancel_view.with_method(Method::Invite), key);
    }

    #[test]
    fn legacy_request_gets_substitute_key() {
        let mut req = invite_with_via("z9hG4bKx");
        req.headers.set_single("Via", "SIP/2.0/UDP old.example.com");
        let key = TransactionKey::server(&req);
        assert!(key.branch.starts_with("legacy:call-1:"));
    }

    #[test]
    fn response_key_uses_cseq_method() {
        let mut headers = Headers::new();
        headers.append("Via", "SIP/2.0/UDP us.example.com;branch=z9hG4bKcli");
        headers.append("CSeq", "7 INVITE");
        let res = Response::new(StatusLine::new(180, ""), headers, Bytes::new());
        let key = TransactionKey::client_for_response(&res).unwrap();
        assert_eq!(key.branch.as_str(), "z9hG4bKcli");
        assert_eq!(key.method, Method::Invite);
        assert!(!key.is_server);
    }

    #[test]
    fn non_2xx_ack_shares_invite_branch() {
        let invite = invite_with_via("z9hG4bKabc");
        let mut headers = Headers::new();
        headers.append("To", "<sip:bob@example.com>;tag=srv");
        let response = Response::new(StatusLine::new(486, ""), headers, Bytes::new());

        let ack = ack_for_non_2xx(&invite, &response);
        assert_eq!(ack.start.method, Method::Ack);
        assert_eq!(
            ack.headers.top_via().unwrap().branch(),
            Some("z9hG4bKabc")
        );
        assert_eq!(ack.headers.cseq().unwrap().seq, 7);
        assert_eq!(ack.headers.cseq().unwrap().method, Method::Ack);
        assert_eq!(
            ack.headers.to_addr().unwrap().tag(),
            Some("srv")
        );
    }
}
