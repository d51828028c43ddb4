// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog layer.
//!
//! A dialog is identified by `(Call-ID, local tag, remote tag)` and owns
//! the state needed to build in-dialog requests: the remote target, the
//! route set learned from Record-Route, and both CSeq counters. The
//! [`DialogManager`] is the O(1) table the user-agent facades consult for
//! every in-dialog message.

use std::fmt;

use bytes::Bytes;
use dashmap::DashMap;
use larynx_core::{
    generate_branch, generate_cseq_seed, Headers, Method, NameAddr, Request, RequestLine,
    Response, SipUri, StatusLine,
};
use smol_str::SmolStr;
use tracing::debug;

/// Dialog lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a provisional response carrying a To tag.
    Early,
    /// Established by a 2xx (or the ACK confirming it).
    Confirmed,
    /// Ended by BYE, a non-2xx final to the INVITE, or timeout.
    Terminated,
}

/// Dialog-layer failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// In-dialog request without a matching dialog (responds 481).
    Unknown,
    /// CSeq regression or missing required header (responds 400).
    ProtocolViolation(&'static str),
    /// Operation not valid in the dialog's current state.
    InvalidState(&'static str),
}

impl fmt::Display for DialogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogError::Unknown => write!(f, "no matching dialog"),
            DialogError::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            DialogError::InvalidState(what) => write!(f, "invalid dialog state: {}", what),
        }
    }
}

impl std::error::Error for DialogError {}

/// Dialog identifier (RFC 3261 §12): Call-ID plus both tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// The id an inbound in-dialog request maps to: the request's From tag
    /// is the peer's (our remote), its To tag is ours.
    pub fn from_incoming_request(request: &Request) -> Option<Self> {
        let call_id = request.headers.call_id()?.clone();
        let remote_tag = request.headers.from_addr()?.tag().map(SmolStr::new)?;
        let local_tag = request.headers.to_addr()?.tag().map(SmolStr::new)?;
        Some(Self {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

/// Local half of the Via for requests this dialog originates.
#[derive(Debug, Clone)]
pub struct LocalVia {
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: u16,
}

impl LocalVia {
    pub fn udp(host: &str, port: u16) -> Self {
        Self {
            transport: SmolStr::new("UDP"),
            host: SmolStr::new(host),
            port,
        }
    }
}

/// One peer-to-peer SIP relationship.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    /// Our address-of-record (From on requests we send).
    pub local_uri: SipUri,
    /// The peer's address-of-record.
    pub remote_uri: SipUri,
    /// The peer's Contact; request-URI for in-dialog requests.
    pub remote_target: SipUri,
    /// Route set in send order (Record-Route of the initial request for a
    /// UAS; of the response, reversed, for a UAC).
    pub route_set: Vec<SipUri>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// CSeq number the INVITE used; the ACK to a 2xx reuses it.
    pub invite_cseq: u32,
    pub secure: bool,
    pub is_uac: bool,
}

impl Dialog {
    /// Builds the UAS-side dialog for an initial INVITE. The local tag is
    /// the To tag the UAS will answer with; the local CSeq starts at a
    /// random 31-bit seed.
    pub fn from_uas_invite(request: &Request, local_tag: &str) -> Result<Self, DialogError> {
        let call_id = request
            .headers
            .call_id()
            .ok_or(DialogError::ProtocolViolation("missing Call-ID"))?
            .clone();
        let from = request
            .headers
            .from_addr()
            .ok_or(DialogError::ProtocolViolation("missing From"))?;
        let remote_tag = from
            .tag()
            .map(SmolStr::new)
            .ok_or(DialogError::ProtocolViolation("From has no tag"))?;
        let to = request
            .headers
            .to_addr()
            .ok_or(DialogError::ProtocolViolation("missing To"))?;
        let cseq = request
            .headers
            .cseq()
            .ok_or(DialogError::ProtocolViolation("missing CSeq"))?;

        let remote_target = request
            .headers
            .contacts()
            .first()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| from.uri.clone());

        // Route set: Record-Route of the initial request, in order.
        let route_set = request
            .headers
            .record_routes()
            .into_iter()
            .map(|addr| addr.uri)
            .collect();

        let secure = to.uri.sips || from.uri.sips;

        Ok(Self {
            id: DialogId::new(call_id, SmolStr::new(local_tag), remote_tag),
            state: DialogState::Early,
            local_uri: to.uri,
            remote_uri: from.uri,
            remote_target,
            route_set,
            local_cseq: generate_cseq_seed(),
            remote_cseq: cseq.seq,
            invite_cseq: cseq.seq,
            secure,
            is_uac: false,
        })
    }

    /// Builds the UAC-side dialog from a dialog-creating response (a 1xx
    /// with a To tag makes an early dialog; a 2xx confirms).
    pub fn from_uac_response(invite: &Request, response: &Response) -> Result<Self, DialogError> {
        let call_id = response
            .headers
            .call_id()
            .or_else(|| invite.headers.call_id())
            .ok_or(DialogError::ProtocolViolation("missing Call-ID"))?
            .clone();
        let from = invite
            .headers
            .from_addr()
            .ok_or(DialogError::ProtocolViolation("missing From"))?;
        let local_tag = from
            .tag()
            .map(SmolStr::new)
            .ok_or(DialogError::ProtocolViolation("From has no tag"))?;
        let to = response
            .headers
            .to_addr()
            .ok_or(DialogError::ProtocolViolation("missing To"))?;
        let remote_tag = to
            .tag()
            .map(SmolStr::new)
            .ok_or(DialogError::ProtocolViolation("response To has no tag"))?;
        let cseq = invite
            .headers
            .cseq()
            .ok_or(DialogError::ProtocolViolation("missing CSeq"))?;

        let state = if response.is_success() {
            DialogState::Confirmed
        } else if response.is_provisional() {
            DialogState::Early
        } else {
            return Err(DialogError::InvalidState(
                "no dialog from a non-2xx final response",
            ));
        };

        let remote_target = response
            .headers
            .contacts()
            .first()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| to.uri.clone());

        // Route set: Record-Route of the response, reversed.
        let mut route_set: Vec<SipUri> = response
            .headers
            .record_routes()
            .into_iter()
            .map(|addr| addr.uri)
            .collect();
        route_set.reverse();

        let secure = from.uri.sips || to.uri.sips;

        Ok(Self {
            id: DialogId::new(call_id, local_tag, remote_tag),
            state,
            local_uri: from.uri,
            remote_uri: to.uri,
            remote_target,
            route_set,
            local_cseq: cseq.seq,
            remote_cseq: 0,
            invite_cseq: cseq.seq,
            secure,
            is_uac: true,
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// Next CSeq for an outgoing in-dialog request.
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Validates and records an inbound in-dialog request: CSeq must not
    /// regress (ACK reuses the INVITE's number), and a Contact refreshes
    /// the remote target.
    pub fn update_from_request(&mut self, request: &Request) -> Result<(), DialogError> {
        let cseq = request
            .headers
            .cseq()
            .ok_or(DialogError::ProtocolViolation("missing CSeq"))?;
        if request.start.method == Method::Ack {
            if cseq.seq != self.remote_cseq {
                return Err(DialogError::ProtocolViolation("ACK CSeq mismatch"));
            }
        } else {
            if cseq.seq <= self.remote_cseq {
                return Err(DialogError::ProtocolViolation("CSeq did not increase"));
            }
            self.remote_cseq = cseq.seq;
        }

        if let Some(contact) = request.headers.contacts().first() {
            self.remote_target = contact.uri.clone();
        }
        Ok(())
    }

    /// Applies a target refresh from a 2xx to INVITE or re-INVITE.
    pub fn update_from_response(&mut self, response: &Response) {
        if let Some(contact) = response.headers.contacts().first() {
            self.remote_target = contact.uri.clone();
        }
        if response.is_success() {
            self.confirm();
        }
    }

    /// Builds an in-dialog request with the route set applied.
    ///
    /// Loose routing (top route carries `;lr`): the request URI is the
    /// remote target and the route set is copied into Route headers.
    /// Strict routing: the top route becomes the request URI, and the
    /// remote target is appended as the final Route.
    pub fn create_request(&mut self, method: Method, via: &LocalVia) -> Request {
        let cseq = self.next_cseq();
        self.request_with_cseq(method, cseq, via)
    }

    /// The ACK for a 2xx response: same CSeq number as the INVITE, method
    /// ACK, a fresh branch (it is a new end-to-end request).
    pub fn create_ack(&self, via: &LocalVia) -> Request {
        self.request_with_cseq(Method::Ack, self.invite_cseq, via)
    }

    /// ACK with an explicit CSeq number, for 2xx responses to a re-INVITE.
    pub fn create_ack_for(&self, cseq: u32, via: &LocalVia) -> Request {
        self.request_with_cseq(Method::Ack, cseq, via)
    }

    fn request_with_cseq(&self, method: Method, cseq: u32, via: &LocalVia) -> Request {
        let (request_uri, routes) = self.routing();

        let mut headers = Headers::new();
        headers.append(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                via.transport,
                via.host,
                via.port,
                generate_branch()
            ),
        );

        let mut from = NameAddr::from_uri(self.local_uri.clone());
        from.set_tag(&self.id.local_tag);
        headers.append("From", from.to_string());

        let mut to = NameAddr::from_uri(self.remote_uri.clone());
        if !self.id.remote_tag.is_empty() {
            to.set_tag(&self.id.remote_tag);
        }
        headers.append("To", to.to_string());

        headers.append("Call-ID", self.id.call_id.clone());
        headers.append("CSeq", format!("{} {}", cseq, method.as_str()));
        headers.append("Max-Forwards", "70");
        for route in &routes {
            headers.append("Route", NameAddr::from_uri(route.clone()).to_string());
        }

        Request::new(RequestLine::new(method, request_uri), headers, Bytes::new())
    }

    fn routing(&self) -> (SipUri, Vec<SipUri>) {
        match self.route_set.first() {
            None => (self.remote_target.clone(), Vec::new()),
            Some(top) if top.is_loose_router() => {
                (self.remote_target.clone(), self.route_set.clone())
            }
            Some(top) => {
                // Strict-routing peer: it expects itself in the request URI.
                let mut routes: Vec<SipUri> = self.route_set[1..].to_vec();
                routes.push(self.remote_target.clone());
                (top.clone(), routes)
            }
        }
    }

    /// Builds a response to an in-dialog request: Via, From, Call-ID, and
    /// CSeq copy over; To gains our tag when absent.
    pub fn create_response(
        &self,
        request: &Request,
        code: u16,
        reason: &str,
        contact: Option<&SipUri>,
    ) -> Response {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.append("Via", via.clone());
        }
        if let Some(from) = request.headers.get_first("From") {
            headers.append("From", from.clone());
        }
        if let Some(to_raw) = request.headers.get_first("To") {
            let to_value = match NameAddr::parse(to_raw) {
                Ok(mut addr) if addr.tag().is_none() && !self.id.local_tag.is_empty() => {
                    addr.set_tag(&self.id.local_tag);
                    addr.to_string()
                }
                _ => to_raw.to_string(),
            };
            headers.append("To", to_value);
        }
        headers.append("Call-ID", self.id.call_id.clone());
        if let Some(cseq) = request.headers.get_first("CSeq") {
            headers.append("CSeq", cseq.clone());
        }
        if let Some(contact) = contact {
            headers.append("Contact", NameAddr::from_uri(contact.clone()).to_string());
        }

        Response::new(StatusLine::new(code, reason), headers, Bytes::new())
    }
}

/// Table of live dialogs keyed by [`DialogId`].
#[derive(Default)]
pub struct DialogManager {
    dialogs: DashMap<DialogId, Dialog>,
}

impl DialogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialog: Dialog) {
        debug!(call_id = %dialog.id.call_id, state = ?dialog.state, "dialog stored");
        self.dialogs.insert(dialog.id.clone(), dialog);
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.clone())
    }

    /// Runs a closure against the live dialog so CSeq counters and target
    /// refreshes never act on a stale copy.
    pub fn modify<R>(&self, id: &DialogId, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        self.dialogs.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Resolves an inbound in-dialog request to its dialog id.
    pub fn match_request(&self, request: &Request) -> Option<DialogId> {
        let id = DialogId::from_incoming_request(request)?;
        self.dialogs.contains_key(&id).then_some(id)
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.remove(id).map(|(_, dialog)| dialog)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Drops all terminated dialogs.
    pub fn sweep_terminated(&self) {
        self.dialogs
            .retain(|_, dialog| dialog.state != DialogState::Terminated);
    }
}
