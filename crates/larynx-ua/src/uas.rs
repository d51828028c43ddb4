// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UAS facade: inbound request routing and the [`IncomingCall`] handle.
//!
//! A new INVITE server transaction becomes an [`IncomingCall`] carrying
//! the parsed offer, caller/callee addresses, and any `X-*` headers. The
//! application answers through `trying`/`ringing`/`accept`/`reject`; a
//! 100 Trying goes out automatically when the application stays silent
//! past the configured grace period. In-dialog BYE, CANCEL, OPTIONS, and
//! INFO are answered here and surfaced through [`UserAgentEvents`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use larynx_core::{
    generate_tag, Headers, Method, NameAddr, Request, Response, SipMessage, SipUri, StatusLine,
};
use larynx_dialog::{Dialog, DialogId, DialogManager, DialogState};
use larynx_parse::{parse_message, serialize_response};
use larynx_sdp::{parse_sdp, serialize_sdp, SessionDescription};
use larynx_transaction::{
    ReceiveOutcome, ServerTransactionHandle, TimerDefaults, TransactionManager, TransportContext,
    TransportDispatcher,
};
use smol_str::SmolStr;
use tokio::time;
use tracing::{debug, warn};

use crate::uac::{RequestHandle, UserAgentClient};
use crate::UserAgentConfig;

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, INFO";

/// Callback surface the embedding application implements.
///
/// Every callback gets a cheap clone of the call handle; only `on_invite`
/// must be implemented, the rest default to sensible UAS behavior.
#[async_trait]
pub trait UserAgentEvents: Send + Sync + 'static {
    /// A new incoming call. Respond through the handle.
    async fn on_invite(&self, call: IncomingCall);

    /// A re-INVITE on a confirmed dialog with a refreshed offer. The
    /// default declines the change and keeps the session.
    async fn on_reinvite(&self, call: IncomingCall) {
        let _ = call.reject(488, "").await;
    }

    /// The peer hung up; the 200 OK was already sent.
    async fn on_bye(&self, call: IncomingCall, request: Request) {
        let _ = (call, request);
    }

    /// The caller cancelled before a final response; 487/200 were sent.
    async fn on_cancel(&self, call: IncomingCall) {
        let _ = call;
    }

    /// An in-dialog INFO (commonly DTMF); the 200 OK was already sent.
    async fn on_info(&self, call: IncomingCall, request: Request) {
        let _ = (call, request);
    }

    /// Override to answer OPTIONS; `None` sends 200 with `Allow`.
    async fn on_options(&self, request: &Request) -> Option<Response> {
        let _ = request;
        None
    }
}

/// Errors on [`IncomingCall`] operations. These are programmer errors
/// local to the call; the process keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// `accept` or `reject` after a final response was already sent.
    AlreadyAnswered,
    /// The operation needs a confirmed dialog.
    NotConfirmed,
    /// `reject` called with a non-failure status code.
    InvalidStatusCode(u16),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::AlreadyAnswered => write!(f, "call already answered"),
            CallError::NotConfirmed => write!(f, "call is not confirmed"),
            CallError::InvalidStatusCode(code) => {
                write!(f, "status {} is not a valid rejection", code)
            }
        }
    }
}

impl std::error::Error for CallError {}

struct CallInner {
    manager: TransactionManager,
    dialogs: Arc<DialogManager>,
    calls: Arc<DashMap<SmolStr, IncomingCall>>,
    handle: Mutex<ServerTransactionHandle>,
    invite: Mutex<Request>,
    sdp_offer: Mutex<Option<SessionDescription>>,
    dialog_id: DialogId,
    x_headers: Vec<(SmolStr, SmolStr)>,
    contact: SipUri,
    ctx: TransportContext,
    timer_defaults: TimerDefaults,
    responded: AtomicBool,
    answered: AtomicBool,
}

/// One incoming INVITE and its (future) dialog.
#[derive(Clone)]
pub struct IncomingCall {
    inner: Arc<CallInner>,
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("call_id", &self.inner.dialog_id.call_id)
            .field("answered", &self.inner.answered.load(Ordering::Relaxed))
            .finish()
    }
}

impl IncomingCall {
    pub fn call_id(&self) -> &SmolStr {
        &self.inner.dialog_id.call_id
    }

    pub fn dialog_id(&self) -> &DialogId {
        &self.inner.dialog_id
    }

    /// The caller's address (From of the INVITE).
    pub fn caller(&self) -> Option<NameAddr> {
        self.inner.invite.lock().unwrap().headers.from_addr()
    }

    /// The callee's address (To of the INVITE).
    pub fn callee(&self) -> Option<NameAddr> {
        self.inner.invite.lock().unwrap().headers.to_addr()
    }

    /// The SDP offer carried by the (re-)INVITE, if any.
    pub fn sdp_offer(&self) -> Option<SessionDescription> {
        self.inner.sdp_offer.lock().unwrap().clone()
    }

    /// All `X-*` headers of the initial INVITE in arrival order.
    pub fn x_headers(&self) -> &[(SmolStr, SmolStr)] {
        &self.inner.x_headers
    }

    /// First value of an arbitrary header on the current INVITE.
    pub fn header(&self, name: &str) -> Option<SmolStr> {
        self.inner
            .invite
            .lock()
            .unwrap()
            .headers
            .get_first(name)
            .cloned()
    }

    /// Whether a final response has been sent.
    pub fn answered(&self) -> bool {
        self.inner.answered.load(Ordering::Relaxed)
    }

    /// Sends 100 Trying (also suppresses the automatic one).
    pub async fn trying(&self) {
        self.inner.responded.store(true, Ordering::Relaxed);
        let invite = self.inner.invite.lock().unwrap().clone();
        let response = reply_to(&invite, 100, "");
        let handle = self.handle();
        handle.send_provisional(response).await;
    }

    /// Sends 180 Ringing with our To tag, optionally with early media SDP.
    pub async fn ringing(&self, early_sdp: Option<&SessionDescription>) {
        self.inner.responded.store(true, Ordering::Relaxed);
        let mut response = self.build_response(180, "");
        if let Some(sdp) = early_sdp {
            set_sdp_body(&mut response, sdp);
        }
        self.handle().send_provisional(response).await;
    }

    /// Accepts the call: 200 OK carrying the answer SDP and our Contact.
    ///
    /// Over UDP the 200 is retransmitted on the RFC 3261 schedule until
    /// the ACK arrives; with no ACK within 64·T1 the dialog is torn down.
    pub async fn accept(&self, answer_sdp: &SessionDescription) -> Result<(), CallError> {
        if self.inner.answered.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyAnswered);
        }
        self.inner.responded.store(true, Ordering::Relaxed);

        let mut response = self.build_response(200, "");
        set_sdp_body(&mut response, answer_sdp);
        self.handle().send_final(response.clone()).await;
        self.spawn_ok_retransmit(response);
        Ok(())
    }

    /// Rejects with a 3xx-6xx final. On an unanswered initial INVITE this
    /// terminates the early dialog; on a re-INVITE the session survives.
    pub async fn reject(&self, code: u16, reason: &str) -> Result<(), CallError> {
        if !(300..=699).contains(&code) {
            return Err(CallError::InvalidStatusCode(code));
        }
        if self.inner.answered.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyAnswered);
        }
        self.inner.responded.store(true, Ordering::Relaxed);

        let response = self.build_response(code, reason);
        self.handle().send_final(response).await;

        let early = self
            .inner
            .dialogs
            .get(&self.inner.dialog_id)
            .map(|d| d.state == DialogState::Early)
            .unwrap_or(false);
        if early {
            self.remove_call_state();
        } else {
            // Rejected re-INVITE: allow the next one to be answered.
            self.inner.answered.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Hangs up a confirmed call with a BYE.
    pub async fn hangup(&self) -> Result<RequestHandle, CallError> {
        let confirmed = self
            .inner
            .dialogs
            .get(&self.inner.dialog_id)
            .map(|d| d.state == DialogState::Confirmed)
            .unwrap_or(false);
        if !confirmed {
            return Err(CallError::NotConfirmed);
        }

        let client = UserAgentClient::from_parts(
            self.inner.manager.clone(),
            self.inner.dialogs.clone(),
        );
        let handle = client
            .send_bye(&self.inner.dialog_id, self.inner.ctx)
            .await
            .map_err(|_| CallError::NotConfirmed)?;
        self.inner.calls.remove(&self.inner.dialog_id.call_id);
        Ok(handle)
    }

    fn handle(&self) -> ServerTransactionHandle {
        self.inner.handle.lock().unwrap().clone()
    }

    fn build_response(&self, code: u16, reason: &str) -> Response {
        let invite = self.inner.invite.lock().unwrap().clone();
        let contact = (code == 200).then_some(&self.inner.contact);
        match self.inner.dialogs.get(&self.inner.dialog_id) {
            Some(dialog) => dialog.create_response(&invite, code, reason, contact),
            None => reply_to(&invite, code, reason),
        }
    }

    fn remove_call_state(&self) {
        self.inner
            .dialogs
            .modify(&self.inner.dialog_id, |d| d.terminate());
        self.inner.dialogs.remove(&self.inner.dialog_id);
        self.inner.calls.remove(&self.inner.dialog_id.call_id);
    }

    /// Application-level 200 retransmission until ACK (RFC 3261 §13.3.1.4).
    fn spawn_ok_retransmit(&self, response: Response) {
        if self.inner.ctx.kind.is_reliable() {
            return;
        }
        let bytes = serialize_response(&response);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let t1 = inner.timer_defaults.t1;
            let limit = t1.saturating_mul(64);
            let mut interval = t1;
            let mut elapsed = Duration::ZERO;
            loop {
                time::sleep(interval).await;
                elapsed += interval;
                match inner.dialogs.get(&inner.dialog_id) {
                    Some(dialog) if dialog.state == DialogState::Early => {}
                    _ => break,
                }
                if elapsed >= limit {
                    warn!(
                        call_id = %inner.dialog_id.call_id,
                        "no ACK for 200 OK; terminating dialog"
                    );
                    inner.dialogs.modify(&inner.dialog_id, |d| d.terminate());
                    inner.dialogs.remove(&inner.dialog_id);
                    inner.calls.remove(&inner.dialog_id.call_id);
                    break;
                }
                let _ = inner
                    .manager
                    .dispatcher()
                    .dispatch(&inner.ctx, bytes.clone())
                    .await;
                interval = (interval * 2).min(inner.timer_defaults.t2);
            }
        });
    }
}

/// UAS over one transport.
#[derive(Clone)]
pub struct UserAgentServer {
    manager: TransactionManager,
    dialogs: Arc<DialogManager>,
    events: Arc<dyn UserAgentEvents>,
    config: UserAgentConfig,
    timer_defaults: TimerDefaults,
    calls: Arc<DashMap<SmolStr, IncomingCall>>,
}

impl UserAgentServer {
    pub fn new(
        dispatcher: Arc<dyn TransportDispatcher>,
        config: UserAgentConfig,
        events: Arc<dyn UserAgentEvents>,
    ) -> Self {
        Self::with_timers(dispatcher, config, events, TimerDefaults::default())
    }

    /// Custom base timers, mainly for compressed-timer tests.
    pub fn with_timers(
        dispatcher: Arc<dyn TransportDispatcher>,
        config: UserAgentConfig,
        events: Arc<dyn UserAgentEvents>,
        timer_defaults: TimerDefaults,
    ) -> Self {
        Self {
            manager: TransactionManager::with_timers(dispatcher, timer_defaults),
            dialogs: Arc::new(DialogManager::new()),
            events,
            config,
            timer_defaults,
            calls: Arc::new(DashMap::new()),
        }
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn dialogs(&self) -> &Arc<DialogManager> {
        &self.dialogs
    }

    /// A UAC sharing this agent's transaction and dialog state.
    pub fn client(&self) -> UserAgentClient {
        UserAgentClient::from_parts(self.manager.clone(), self.dialogs.clone())
    }

    /// Live call lookup by Call-ID.
    pub fn call(&self, call_id: &str) -> Option<IncomingCall> {
        self.calls.get(call_id).map(|entry| entry.clone())
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Entry point for a framed message from the transport. Malformed
    /// input is dropped and logged; nothing is sent in reply.
    pub async fn handle_datagram(&self, data: Bytes, ctx: TransportContext) {
        match parse_message(&data) {
            Ok(message) => self.handle_message(message, ctx).await,
            Err(err) => warn!(%err, peer = %ctx.peer, "dropping unparseable datagram"),
        }
    }

    pub async fn handle_message(&self, message: SipMessage, ctx: TransportContext) {
        match message {
            SipMessage::Request(request) => self.handle_request(request, ctx).await,
            SipMessage::Response(response) => self.manager.receive_response(response).await,
        }
    }

    async fn handle_request(&self, request: Request, ctx: TransportContext) {
        match self.manager.receive_request(request.clone(), ctx).await {
            ReceiveOutcome::Retransmission | ReceiveOutcome::AckAbsorbed => {}
            ReceiveOutcome::AckPassthrough => self.handle_ack(request).await,
            ReceiveOutcome::New(handle) => {
                if let Some(response) = validate_request(&request) {
                    handle.send_final(response).await;
                    return;
                }
                match request.start.method.clone() {
                    Method::Invite => self.handle_invite(request, handle, ctx).await,
                    Method::Bye => self.handle_bye(request, handle).await,
                    Method::Cancel => self.handle_cancel(request, handle).await,
                    Method::Options => self.handle_options(request, handle).await,
                    Method::Info => self.handle_info(request, handle).await,
                    Method::Ack => {}
                    Method::Extension(_) => {
                        let mut response = reply_to(&request, 405, "");
                        response.headers.append("Allow", ALLOW);
                        handle.send_final(response).await;
                    }
                }
            }
        }
    }

    async fn handle_invite(
        &self,
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        // An INVITE matching a confirmed dialog is a session refresh.
        if let Some(id) = self.dialogs.match_request(&request) {
            self.handle_reinvite(id, request, handle).await;
            return;
        }

        let local_tag = generate_tag();
        let dialog = match Dialog::from_uas_invite(&request, &local_tag) {
            Ok(dialog) => dialog,
            Err(err) => {
                debug!(%err, "rejecting INVITE");
                handle.send_final(reply_to(&request, 400, "")).await;
                return;
            }
        };

        let sdp_offer = match parse_offer(&request) {
            Ok(offer) => offer,
            Err(()) => {
                // Unusable offer: 488 without bothering the application.
                handle.send_final(reply_to(&request, 488, "")).await;
                return;
            }
        };

        let dialog_id = dialog.id.clone();
        self.dialogs.insert(dialog);

        let (host, port) = self.manager.dispatcher().local_contact();
        let call = IncomingCall {
            inner: Arc::new(CallInner {
                manager: self.manager.clone(),
                dialogs: self.dialogs.clone(),
                calls: self.calls.clone(),
                handle: Mutex::new(handle),
                x_headers: collect_x_headers(&request.headers),
                invite: Mutex::new(request),
                sdp_offer: Mutex::new(sdp_offer),
                dialog_id,
                contact: SipUri::with_host_port(host.as_str(), port),
                ctx,
                timer_defaults: self.timer_defaults,
                responded: AtomicBool::new(false),
                answered: AtomicBool::new(false),
            }),
        };
        self.calls.insert(call.call_id().clone(), call.clone());

        self.spawn_auto_trying(call.clone());
        self.events.on_invite(call).await;
    }

    async fn handle_reinvite(
        &self,
        id: DialogId,
        request: Request,
        handle: ServerTransactionHandle,
    ) {
        let valid = self
            .dialogs
            .modify(&id, |dialog| dialog.update_from_request(&request))
            .unwrap_or(Err(larynx_dialog::DialogError::Unknown));
        if valid.is_err() {
            handle.send_final(reply_to(&request, 400, "")).await;
            return;
        }

        let Some(call) = self.call(id.call_id.as_str()) else {
            handle.send_final(reply_to(&request, 481, "")).await;
            return;
        };

        let offer = match parse_offer(&request) {
            Ok(offer) => offer,
            Err(()) => {
                // Negotiation-failure policy: refuse the refresh, keep the
                // session as it was.
                handle.send_final(reply_to(&request, 488, "")).await;
                return;
            }
        };

        *call.inner.invite.lock().unwrap() = request;
        *call.inner.sdp_offer.lock().unwrap() = offer;
        *call.inner.handle.lock().unwrap() = handle;
        call.inner.answered.store(false, Ordering::SeqCst);

        self.events.on_reinvite(call).await;
    }

    async fn handle_ack(&self, request: Request) {
        let Some(id) = self.dialogs.match_request(&request) else {
            debug!("ACK without a matching dialog; dropping");
            return;
        };
        let result = self.dialogs.modify(&id, |dialog| {
            let result = dialog.update_from_request(&request);
            dialog.confirm();
            result
        });
        if let Some(Err(err)) = result {
            debug!(%err, "ignoring ACK with bad CSeq");
        }
    }

    async fn handle_bye(&self, request: Request, handle: ServerTransactionHandle) {
        let Some(id) = self.dialogs.match_request(&request) else {
            handle.send_final(reply_to(&request, 481, "")).await;
            return;
        };

        let valid = self
            .dialogs
            .modify(&id, |dialog| dialog.update_from_request(&request))
            .unwrap_or(Err(larynx_dialog::DialogError::Unknown));
        if valid.is_err() {
            handle.send_final(reply_to(&request, 400, "")).await;
            return;
        }

        let response = self
            .dialogs
            .get(&id)
            .map(|dialog| dialog.create_response(&request, 200, "", None))
            .unwrap_or_else(|| reply_to(&request, 200, ""));
        handle.send_final(response).await;

        self.dialogs.modify(&id, |dialog| dialog.terminate());
        self.dialogs.remove(&id);
        if let Some((_, call)) = self.calls.remove(&id.call_id) {
            self.events.on_bye(call, request).await;
        }
    }

    async fn handle_cancel(&self, request: Request, cancel_handle: ServerTransactionHandle) {
        let Some(invite_handle) = self.manager.matching_invite(&request) else {
            cancel_handle.send_final(reply_to(&request, 481, "")).await;
            return;
        };

        // The CANCEL itself succeeds regardless of the INVITE's fate.
        cancel_handle.send_final(reply_to(&request, 200, "")).await;

        let call = request
            .headers
            .call_id()
            .and_then(|call_id| self.call(call_id.as_str()));
        let Some(call) = call else {
            return;
        };
        if call.answered() {
            // Too late: the final response already went out.
            return;
        }

        let response = call.build_response(487, "");
        invite_handle.send_final(response).await;
        call.inner.answered.store(true, Ordering::SeqCst);
        call.remove_call_state();
        self.events.on_cancel(call).await;
    }

    async fn handle_options(&self, request: Request, handle: ServerTransactionHandle) {
        let response = match self.events.on_options(&request).await {
            Some(response) => response,
            None => {
                let mut response = reply_to(&request, 200, "");
                response.headers.append("Allow", ALLOW);
                response
            }
        };
        handle.send_final(response).await;
    }

    async fn handle_info(&self, request: Request, handle: ServerTransactionHandle) {
        let Some(id) = self.dialogs.match_request(&request) else {
            handle.send_final(reply_to(&request, 481, "")).await;
            return;
        };
        let valid = self
            .dialogs
            .modify(&id, |dialog| dialog.update_from_request(&request))
            .unwrap_or(Err(larynx_dialog::DialogError::Unknown));
        if valid.is_err() {
            handle.send_final(reply_to(&request, 400, "")).await;
            return;
        }

        let response = self
            .dialogs
            .get(&id)
            .map(|dialog| dialog.create_response(&request, 200, "", None))
            .unwrap_or_else(|| reply_to(&request, 200, ""));
        handle.send_final(response).await;

        if let Some(call) = self.call(id.call_id.as_str()) {
            self.events.on_info(call, request).await;
        }
    }

    /// Sends the automatic 100 Trying when the application has not
    /// responded within the grace period.
    fn spawn_auto_trying(&self, call: IncomingCall) {
        let delay = self.config.trying_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            if !call.inner.responded.load(Ordering::Relaxed) {
                call.trying().await;
            }
        });
    }

    /// The supported-codec negotiation options for this agent.
    pub fn answer_options(&self) -> larynx_sdp::AnswerOptions {
        larynx_sdp::AnswerOptions {
            supported: self.config.supported_codecs.clone(),
            dtmf: self.config.dtmf,
            ..larynx_sdp::AnswerOptions::default()
        }
    }
}

/// Builds a response to a request outside any dialog: Via, From, To,
/// Call-ID, and CSeq copy over; non-provisional responses get a To tag
/// when the request had none.
pub fn reply_to(request: &Request, code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.append("Via", via.clone());
    }
    if let Some(from) = request.headers.get_first("From") {
        headers.append("From", from.clone());
    }
    if let Some(to_raw) = request.headers.get_first("To") {
        let to_value = match NameAddr::parse(to_raw) {
            Ok(mut addr) if addr.tag().is_none() && code > 100 => {
                addr.set_tag(&generate_tag());
                addr.to_string()
            }
            _ => to_raw.to_string(),
        };
        headers.append("To", to_value);
    }
    if let Some(call_id) = request.headers.call_id() {
        headers.append("Call-ID", call_id.clone());
    }
    if let Some(cseq) = request.headers.get_first("CSeq") {
        headers.append("CSeq", cseq.clone());
    }
    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// Required-header check for dispatch (RFC 3261 §8.2): one Via, a tagged
/// From, To, Call-ID, and a CSeq whose method matches the request line.
/// Returns the 400 to send when the request is unusable.
fn validate_request(request: &Request) -> Option<Response> {
    if request.start.method == Method::Ack {
        return None;
    }
    let ok = request.headers.top_via().is_some()
        && request
            .headers
            .from_addr()
            .is_some_and(|from| from.tag().is_some())
        && request.headers.to_addr().is_some()
        && request.headers.call_id().is_some()
        && request
            .headers
            .cseq()
            .is_some_and(|cseq| cseq.method == request.start.method);
    if ok {
        None
    } else {
        Some(reply_to(request, 400, ""))
    }
}

fn collect_x_headers(headers: &Headers) -> Vec<(SmolStr, SmolStr)> {
    headers
        .iter()
        .filter(|h| {
            h.name.len() >= 2 && h.name.as_str()[..2].eq_ignore_ascii_case("x-")
        })
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect()
}

/// `Ok(None)` for no body, `Ok(Some)` for a parsed offer, `Err` for a
/// body that claims to be SDP but does not parse.
fn parse_offer(request: &Request) -> Result<Option<SessionDescription>, ()> {
    if request.body.is_empty() {
        return Ok(None);
    }
    let is_sdp = request
        .headers
        .content_type()
        .map(|ct| ct.as_str().to_ascii_lowercase().starts_with("application/sdp"))
        .unwrap_or(false);
    if !is_sdp {
        return Ok(None);
    }
    let text = std::str::from_utf8(&request.body).map_err(|_| ())?;
    parse_sdp(text).map(Some).map_err(|_| ())
}

fn set_sdp_body(response: &mut Response, sdp: &SessionDescription) {
    response
        .headers
        .set_single("Content-Type", "application/sdp");
    response.body = Bytes::from(serialize_sdp(sdp));
}
