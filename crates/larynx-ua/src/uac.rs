// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UAC facade: outbound INVITEs and in-dialog requests.
//!
//! Every request resolves through a [`RequestHandle`] with the final
//! response or a transaction error. Outbound INVITEs return an
//! [`OutboundCall`] which tracks provisionals, applies the CANCEL
//! queueing rule (CANCEL waits for the first provisional), and creates
//! the dialog when the call is answered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use larynx_core::{
    generate_branch, generate_call_id, generate_cseq_seed, generate_tag, Headers, Method,
    NameAddr, Request, RequestLine, Response, SipUri,
};
use larynx_dialog::{Dialog, DialogError, DialogId, DialogManager, DialogState, LocalVia};
use larynx_parse::serialize_request;
use larynx_sdp::{serialize_sdp, SessionDescription};
use larynx_transaction::{
    ClientTransactionUser, TerminationKind, TransactionKey, TransactionManager, TransportContext,
    TransportDispatcher,
};
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Failure of a client request, delivered through its completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No final response within 64·T1.
    Timeout,
    /// The dispatcher could not send.
    Transport,
    /// The transaction ended without delivering a final response.
    Terminated,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "transaction timeout"),
            RequestError::Transport => write!(f, "transport error"),
            RequestError::Terminated => write!(f, "transaction terminated"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Completion handle for one outgoing request.
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<Response, RequestError>>,
}

impl RequestHandle {
    /// Waits for the final response. Dropping the handle instead does not
    /// tear down the transaction; a late response is absorbed silently.
    pub async fn wait(self) -> Result<Response, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Terminated),
        }
    }
}

/// What the completion TU does beyond resolving the handle.
enum TuRole {
    /// Nothing extra (INFO, CANCEL, OPTIONS).
    Plain,
    /// Remove the dialog once the BYE completes.
    Bye { dialog_id: DialogId },
    /// Target-refresh the dialog and ACK the 2xx with the given CSeq.
    Reinvite {
        dialog_id: DialogId,
        cseq: u32,
        ctx: TransportContext,
    },
    /// Initial INVITE: early dialogs, queued CANCEL, dialog on 2xx.
    Invite(InviteState),
}

struct InviteState {
    invite: Request,
    ctx: TransportContext,
    provisional_seen: AtomicBool,
    cancel_requested: AtomicBool,
    early_dialogs: Mutex<Vec<DialogId>>,
    confirmed: Mutex<Option<DialogId>>,
}

struct CompletionTu {
    client: UserAgentClient,
    tx: Mutex<Option<oneshot::Sender<Result<Response, RequestError>>>>,
    role: TuRole,
}

impl CompletionTu {
    fn resolve(&self, result: Result<Response, RequestError>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl ClientTransactionUser for CompletionTu {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response) {
        let TuRole::Invite(state) = &self.role else {
            return;
        };
        state.provisional_seen.store(true, Ordering::SeqCst);

        // A provisional with a To tag opens an early dialog; each distinct
        // remote tag is its own early dialog.
        if response
            .headers
            .to_addr()
            .is_some_and(|to| to.tag().is_some())
        {
            if let Ok(dialog) = Dialog::from_uac_response(&state.invite, response) {
                let id = dialog.id.clone();
                let mut early = state.early_dialogs.lock().unwrap();
                if !early.contains(&id) {
                    self.client.dialogs.insert(dialog);
                    early.push(id);
                }
            }
        }

        if state.cancel_requested.swap(false, Ordering::SeqCst) {
            debug!(branch = %key.branch, "flushing queued CANCEL");
            self.client
                .send_cancel_now(&state.invite, state.ctx)
                .await;
        }
    }

    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        match &self.role {
            TuRole::Plain => {}
            TuRole::Bye { dialog_id } => {
                self.client.dialogs.remove(dialog_id);
            }
            TuRole::Reinvite {
                dialog_id,
                cseq,
                ctx,
            } => {
                if response.is_success() {
                    self.client
                        .dialogs
                        .modify(dialog_id, |d| d.update_from_response(response));
                    self.client.ack_2xx(dialog_id, Some(*cseq), *ctx).await;
                }
            }
            TuRole::Invite(state) => {
                if response.is_success() {
                    self.confirm_dialog(state, response).await;
                } else {
                    // Early dialogs die with a non-2xx final to the INVITE.
                    for id in state.early_dialogs.lock().unwrap().drain(..) {
                        self.client.dialogs.remove(&id);
                    }
                }
            }
        }
        self.resolve(Ok(response.clone()));
    }

    async fn on_terminated(&self, key: &TransactionKey, reason: &str, kind: TerminationKind) {
        let error = match kind {
            TerminationKind::Timeout => RequestError::Timeout,
            TerminationKind::TransportError => RequestError::Transport,
            TerminationKind::Normal => RequestError::Terminated,
        };
        if self.tx.lock().unwrap().is_some() {
            debug!(branch = %key.branch, %reason, "request failed");
        }
        self.resolve(Err(error));
    }
}

impl CompletionTu {
    async fn confirm_dialog(&self, state: &InviteState, response: &Response) {
        let dialog = match Dialog::from_uac_response(&state.invite, response) {
            Ok(dialog) => dialog,
            Err(err) => {
                warn!(%err, "2xx did not yield a usable dialog");
                return;
            }
        };
        let confirmed_id = dialog.id.clone();

        // At most one early dialog confirms; the others are dropped.
        let stale: Vec<DialogId> = state
            .early_dialogs
            .lock()
            .unwrap()
            .drain(..)
            .filter(|id| *id != confirmed_id)
            .collect();
        for id in stale {
            self.client.dialogs.remove(&id);
        }

        self.client.dialogs.insert(dialog);
        *state.confirmed.lock().unwrap() = Some(confirmed_id.clone());
        self.client.ack_2xx(&confirmed_id, None, state.ctx).await;
    }
}

/// UAC half of a user agent, sharing the transaction manager and dialog
/// table with the server side.
#[derive(Clone)]
pub struct UserAgentClient {
    manager: TransactionManager,
    pub(crate) dialogs: Arc<DialogManager>,
}

impl UserAgentClient {
    /// Standalone UAC with its own transaction manager and dialog table.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>) -> Self {
        Self {
            manager: TransactionManager::new(dispatcher),
            dialogs: Arc::new(DialogManager::new()),
        }
    }

    /// UAC over existing state (the UAS side constructs one this way).
    pub fn from_parts(manager: TransactionManager, dialogs: Arc<DialogManager>) -> Self {
        Self { manager, dialogs }
    }

    pub fn dialogs(&self) -> &Arc<DialogManager> {
        &self.dialogs
    }

    /// Routes an inbound response to the owning transaction. Agents that
    /// also run a UAS feed responses through the server facade instead.
    pub async fn handle_response(&self, response: Response) {
        self.manager.receive_response(response).await;
    }

    fn local_via(&self, ctx: &TransportContext) -> LocalVia {
        let (host, port) = self.manager.dispatcher().local_contact();
        LocalVia {
            transport: SmolStr::new(ctx.kind.via_token()),
            host: SmolStr::new(host),
            port,
        }
    }

    fn contact_uri(&self) -> SipUri {
        let (host, port) = self.manager.dispatcher().local_contact();
        SipUri::with_host_port(host, port)
    }

    /// Sends a BYE on a confirmed dialog; the dialog terminates now and
    /// is dropped once the BYE completes.
    pub async fn send_bye(
        &self,
        dialog_id: &DialogId,
        ctx: TransportContext,
    ) -> Result<RequestHandle, DialogError> {
        let via = self.local_via(&ctx);
        let request = self
            .dialogs
            .modify(dialog_id, |dialog| {
                if dialog.state != DialogState::Confirmed {
                    return Err(DialogError::InvalidState("BYE needs a confirmed dialog"));
                }
                let request = dialog.create_request(Method::Bye, &via);
                dialog.terminate();
                Ok(request)
            })
            .ok_or(DialogError::Unknown)??;

        self.start_completed(
            request,
            ctx,
            TuRole::Bye {
                dialog_id: dialog_id.clone(),
            },
        )
        .await
    }

    /// Sends a re-INVITE with a fresh offer on a confirmed dialog.
    pub async fn send_reinvite(
        &self,
        dialog_id: &DialogId,
        ctx: TransportContext,
        sdp: &SessionDescription,
    ) -> Result<RequestHandle, DialogError> {
        let via = self.local_via(&ctx);
        let contact = self.contact_uri();
        let request = self
            .dialogs
            .modify(dialog_id, |dialog| {
                if dialog.state != DialogState::Confirmed {
                    return Err(DialogError::InvalidState(
                        "re-INVITE needs a confirmed dialog",
                    ));
                }
                let mut request = dialog.create_request(Method::Invite, &via);
                request
                    .headers
                    .append("Contact", NameAddr::from_uri(contact.clone()).to_string());
                request
                    .headers
                    .set_single("Content-Type", "application/sdp");
                request.body = Bytes::from(serialize_sdp(sdp));
                Ok(request)
            })
            .ok_or(DialogError::Unknown)??;

        let cseq = request.headers.cseq().map(|c| c.seq).unwrap_or_default();
        self.start_completed(
            request,
            ctx,
            TuRole::Reinvite {
                dialog_id: dialog_id.clone(),
                cseq,
                ctx,
            },
        )
        .await
    }

    /// Sends an in-dialog INFO (e.g. out-of-band DTMF).
    pub async fn send_info(
        &self,
        dialog_id: &DialogId,
        ctx: TransportContext,
        content_type: &str,
        body: Bytes,
    ) -> Result<RequestHandle, DialogError> {
        let via = self.local_via(&ctx);
        let request = self
            .dialogs
            .modify(dialog_id, |dialog| {
                if dialog.state != DialogState::Confirmed {
                    return Err(DialogError::InvalidState("INFO needs a confirmed dialog"));
                }
                let mut request = dialog.create_request(Method::Info, &via);
                request.headers.set_single("Content-Type", content_type);
                request.body = body.clone();
                Ok(request)
            })
            .ok_or(DialogError::Unknown)??;

        self.start_completed(request, ctx, TuRole::Plain).await
    }

    /// Originates a call: INVITE with an optional offer.
    pub async fn send_invite(
        &self,
        target: &SipUri,
        local: &SipUri,
        offer: Option<&SessionDescription>,
        ctx: TransportContext,
    ) -> Result<OutboundCall, DialogError> {
        let via = self.local_via(&ctx);
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
        let mut from = NameAddr::from_uri(local.clone());
        from.set_tag(&generate_tag());
        headers.append("From", from.to_string());
        headers.append("To", NameAddr::from_uri(target.clone()).to_string());
        headers.append("Call-ID", generate_call_id(via.host.as_str()));
        headers.append(
            "CSeq",
            format!("{} INVITE", generate_cseq_seed()),
        );
        headers.append(
            "Contact",
            NameAddr::from_uri(self.contact_uri()).to_string(),
        );
        headers.append("Max-Forwards", "70");

        let body = match offer {
            Some(sdp) => {
                headers.set_single("Content-Type", "application/sdp");
                Bytes::from(serialize_sdp(sdp))
            }
            None => Bytes::new(),
        };

        let invite = Request::new(
            RequestLine::new(Method::Invite, target.clone()),
            headers,
            body,
        );

        let (tx, rx) = oneshot::channel();
        let tu = Arc::new(CompletionTu {
            client: self.clone(),
            tx: Mutex::new(Some(tx)),
            role: TuRole::Invite(InviteState {
                invite: invite.clone(),
                ctx,
                provisional_seen: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                early_dialogs: Mutex::new(Vec::new()),
                confirmed: Mutex::new(None),
            }),
        });

        self.manager
            .start_client(invite, ctx, tu.clone())
            .await
            .map_err(|_| DialogError::ProtocolViolation("INVITE has no Via branch"))?;

        Ok(OutboundCall {
            handle: RequestHandle { rx },
            tu,
        })
    }

    async fn start_completed(
        &self,
        request: Request,
        ctx: TransportContext,
        role: TuRole,
    ) -> Result<RequestHandle, DialogError> {
        let (tx, rx) = oneshot::channel();
        let tu = Arc::new(CompletionTu {
            client: self.clone(),
            tx: Mutex::new(Some(tx)),
            role,
        });
        self.manager
            .start_client(request, ctx, tu)
            .await
            .map_err(|_| DialogError::ProtocolViolation("request has no Via branch"))?;
        Ok(RequestHandle { rx })
    }

    /// Fires the CANCEL for a pending INVITE: same request URI, Via
    /// (branch included), From, To, Call-ID; CSeq keeps the number with
    /// method CANCEL (RFC 3261 §9.1).
    async fn send_cancel_now(&self, invite: &Request, ctx: TransportContext) {
        let mut headers = Headers::new();
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = invite.headers.get_first(name) {
                headers.append(name, value.clone());
            }
        }
        if let Some(cseq) = invite.headers.cseq() {
            headers.append("CSeq", format!("{} CANCEL", cseq.seq));
        }
        headers.append("Max-Forwards", "70");
        let cancel = Request::new(
            RequestLine::new(Method::Cancel, invite.start.uri.clone()),
            headers,
            Bytes::new(),
        );

        let (tx, rx) = oneshot::channel();
        drop(rx); // CANCEL's 200 is not interesting
        let tu = Arc::new(CompletionTu {
            client: self.clone(),
            tx: Mutex::new(Some(tx)),
            role: TuRole::Plain,
        });
        if let Err(err) = self.manager.start_client(cancel, ctx, tu).await {
            warn!(%err, "failed to start CANCEL transaction");
        }
    }

    /// The ACK to a 2xx bypasses the transaction layer: it is built from
    /// dialog state and dispatched directly to the peer that answered.
    async fn ack_2xx(&self, dialog_id: &DialogId, cseq: Option<u32>, ctx: TransportContext) {
        let via = self.local_via(&ctx);
        let ack = self.dialogs.get(dialog_id).map(|dialog| match cseq {
            Some(cseq) => dialog.create_ack_for(cseq, &via),
            None => dialog.create_ack(&via),
        });
        let Some(ack) = ack else {
            return;
        };
        if let Err(err) = self
            .manager
            .dispatcher()
            .dispatch(&ctx, serialize_request(&ack))
            .await
        {
            warn!(%err, "failed to send ACK");
        }
    }
}

/// A pending outbound INVITE.
pub struct OutboundCall {
    handle: RequestHandle,
    tu: Arc<CompletionTu>,
}

impl OutboundCall {
    /// Waits for the final response to the INVITE.
    pub async fn wait(self) -> Result<Response, RequestError> {
        self.handle.wait().await
    }

    /// Cancels the pending INVITE. Sent immediately once a provisional
    /// response has arrived; queued until then (RFC 3261 §9.1).
    pub async fn cancel(&self) {
        let TuRole::Invite(state) = &self.tu.role else {
            return;
        };
        if state.provisional_seen.load(Ordering::SeqCst) {
            self.tu
                .client
                .send_cancel_now(&state.invite, state.ctx)
                .await;
        } else {
            debug!("no provisional yet; CANCEL queued");
            state.cancel_requested.store(true, Ordering::SeqCst);
        }
    }

    /// The confirmed dialog, once a 2xx has been processed.
    pub fn dialog_id(&self) -> Option<DialogId> {
        match &self.tu.role {
            TuRole::Invite(state) => state.confirmed.lock().unwrap().clone(),
            _ => None,
        }
    }
}
