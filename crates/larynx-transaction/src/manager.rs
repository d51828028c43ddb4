// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction runtime: owns the state machines, matches inbound traffic
//! to them, runs timers, and moves bytes through the dispatcher.
//!
//! Timer handling follows the runtime model of the rest of the stack: a
//! timer is one spawned sleep guarded by a oneshot; cancellation drops the
//! sender side and is synchronous and idempotent. Expiry is funnelled
//! through a single command channel so per-transaction processing stays
//! serialized with inbound messages.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use larynx_core::{Method, Request, Response};
use larynx_parse::serialize_request;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, error, warn};

use crate::fsm::{
    ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
    ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
};
use crate::timers::{TimerDefaults, TimerTable};
use crate::transport::{TransportContext, TransportDispatcher};
use crate::{ack_for_non_2xx, TerminationKind, TransactionKey, TransactionTimer};

/// Ceiling on simultaneously tracked transactions per direction; the
/// oldest transaction is evicted when a new one would exceed it.
const MAX_TRANSACTIONS: usize = 10_000;

/// Callbacks a client transaction delivers to its user.
#[async_trait]
pub trait ClientTransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response);
    async fn on_final(&self, key: &TransactionKey, response: &Response);
    async fn on_terminated(&self, key: &TransactionKey, reason: &str, kind: TerminationKind);
}

/// What happened to an inbound request.
pub enum ReceiveOutcome {
    /// A new server transaction was created; respond through the handle.
    New(ServerTransactionHandle),
    /// Retransmission of a known request; the last response was re-sent.
    Retransmission,
    /// ACK absorbed by the matching INVITE server transaction (non-2xx).
    AckAbsorbed,
    /// ACK to a 2xx: no transaction, belongs to the dialog layer.
    AckPassthrough,
}

enum Command {
    ServerTimer {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    ClientTimer {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    ClientTransportError {
        key: TransactionKey,
    },
    ServerTransportError {
        key: TransactionKey,
    },
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    seq: u64,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    tu: Arc<dyn ClientTransactionUser>,
    /// Kept for building the ACK to a non-2xx final.
    request: Request,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    seq: u64,
}

impl ServerEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        self.timers.remove(&timer);
    }

    fn cancel_all(&mut self) {
        self.timers.clear();
    }
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        self.timers.remove(&timer);
    }

    fn cancel_all(&mut self) {
        self.timers.clear();
    }
}

struct Inner {
    dispatcher: Arc<dyn TransportDispatcher>,
    server: DashMap<TransactionKey, ServerEntry>,
    client: DashMap<TransactionKey, ClientEntry>,
    defaults: TimerDefaults,
    seq: std::sync::atomic::AtomicU64,
}

/// Owns all SIP transactions of one user agent.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
    cmd_tx: mpsc::Sender<Command>,
}

impl TransactionManager {
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>) -> Self {
        Self::with_timers(dispatcher, TimerDefaults::default())
    }

    /// Custom T1/T2/T4, mainly for compressed-timer tests.
    pub fn with_timers(dispatcher: Arc<dyn TransportDispatcher>, defaults: TimerDefaults) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let manager = Self {
            inner: Arc::new(Inner {
                dispatcher,
                server: DashMap::new(),
                client: DashMap::new(),
                defaults,
                seq: std::sync::atomic::AtomicU64::new(0),
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    pub fn dispatcher(&self) -> &Arc<dyn TransportDispatcher> {
        &self.inner.dispatcher
    }

    fn next_seq(&self) -> u64 {
        self.inner
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn table(&self, ctx: &TransportContext) -> TimerTable {
        TimerTable::new(ctx.kind, self.inner.defaults)
    }

    fn spawn_command_loop(&self, mut rx: mpsc::Receiver<Command>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::ServerTimer { key, timer } => {
                        manager.server_timer_fired(key, timer).await;
                    }
                    Command::ClientTimer { key, timer } => {
                        manager.client_timer_fired(key, timer).await;
                    }
                    Command::ClientTransportError { key } => {
                        if let Some(mut entry) = manager.inner.client.get_mut(&key) {
                            let actions = match &mut entry.kind {
                                ClientKind::Invite(fsm) => {
                                    fsm.on_event(ClientInviteEvent::TransportError)
                                }
                                ClientKind::NonInvite(fsm) => {
                                    fsm.on_event(ClientNonInviteEvent::TransportError)
                                }
                            };
                            drop(entry);
                            manager.apply_client_actions(&key, actions).await;
                        }
                    }
                    Command::ServerTransportError { key } => {
                        if let Some(mut entry) = manager.inner.server.get_mut(&key) {
                            let actions = match &mut entry.kind {
                                ServerKind::Invite(fsm) => {
                                    fsm.on_event(ServerInviteEvent::TransportError)
                                }
                                ServerKind::NonInvite(fsm) => {
                                    fsm.on_event(ServerNonInviteEvent::TransportError)
                                }
                            };
                            drop(entry);
                            manager.apply_server_actions(&key, actions).await;
                        }
                    }
                }
            }
        });
    }

    // --- Server side ----------------------------------------------------

    /// Keys an inbound request to a server transaction, creating one for a
    /// fresh request. ACK never creates a transaction (RFC 3261 §17.2.3).
    pub async fn receive_request(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> ReceiveOutcome {
        let key = TransactionKey::server(&request);

        if request.start.method == Method::Ack {
            let invite_key = key.with_method(Method::Invite);
            let actions = match self.inner.server.get_mut(&invite_key) {
                Some(mut entry) => match &mut entry.kind {
                    ServerKind::Invite(fsm) => Some(fsm.on_event(ServerInviteEvent::ReceiveAck)),
                    ServerKind::NonInvite(_) => None,
                },
                None => None,
            };
            return match actions {
                Some(actions) => {
                    self.apply_server_actions(&invite_key, actions).await;
                    ReceiveOutcome::AckAbsorbed
                }
                None => ReceiveOutcome::AckPassthrough,
            };
        }

        if let Some(entry) = self.inner.server.get(&key) {
            let actions = match &entry.kind {
                ServerKind::Invite(fsm) => fsm.on_retransmit(),
                ServerKind::NonInvite(fsm) => fsm.on_retransmit(),
            };
            drop(entry);
            debug!(branch = %key.branch, method = %key.method, "request retransmission");
            self.apply_server_actions(&key, actions).await;
            return ReceiveOutcome::Retransmission;
        }

        let table = self.table(&ctx);
        let mut entry = ServerEntry {
            kind: match request.start.method {
                Method::Invite => ServerKind::Invite(ServerInviteFsm::new(table)),
                _ => ServerKind::NonInvite(ServerNonInviteFsm::new(table)),
            },
            ctx,
            timers: HashMap::new(),
            seq: self.next_seq(),
        };
        let actions = match &mut entry.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::ReceiveInvite(request)),
            ServerKind::NonInvite(fsm) => {
                fsm.on_event(ServerNonInviteEvent::ReceiveRequest(request))
            }
        };

        self.evict_if_full(true);
        self.inner.server.insert(key.clone(), entry);
        self.apply_server_actions(&key, actions).await;

        ReceiveOutcome::New(ServerTransactionHandle {
            manager: self.clone(),
            key,
        })
    }

    /// The INVITE server transaction a CANCEL refers to, if still alive.
    pub fn matching_invite(&self, cancel: &Request) -> Option<ServerTransactionHandle> {
        let key = TransactionKey::server(cancel).with_method(Method::Invite);
        if self.inner.server.contains_key(&key) {
            Some(ServerTransactionHandle {
                manager: self.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub async fn send_provisional(&self, key: &TransactionKey, response: Response) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => {
                    fsm.on_event(ServerInviteEvent::SendProvisional(response))
                }
                ServerKind::NonInvite(fsm) => {
                    fsm.on_event(ServerNonInviteEvent::SendProvisional(response))
                }
            };
            drop(entry);
            self.apply_server_actions(key, actions).await;
        }
    }

    pub async fn send_final(&self, key: &TransactionKey, response: Response) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::SendFinal(response)),
                ServerKind::NonInvite(fsm) => {
                    fsm.on_event(ServerNonInviteEvent::SendFinal(response))
                }
            };
            drop(entry);
            self.apply_server_actions(key, actions).await;
        }
    }

    // --- Client side ----------------------------------------------------

    /// Starts a client transaction and transmits the request.
    pub async fn start_client(
        &self,
        request: Request,
        ctx: TransportContext,
        tu: Arc<dyn ClientTransactionUser>,
    ) -> Result<TransactionKey> {
        let key = TransactionKey::client(&request)
            .ok_or_else(|| anyhow!("outgoing request has no Via branch"))?;
        debug!(branch = %key.branch, method = %key.method, "starting client transaction");

        let table = self.table(&ctx);
        let mut entry = ClientEntry {
            kind: match request.start.method {
                Method::Invite => ClientKind::Invite(ClientInviteFsm::new(table)),
                _ => ClientKind::NonInvite(ClientNonInviteFsm::new(table)),
            },
            ctx,
            tu,
            request: request.clone(),
            timers: HashMap::new(),
            seq: self.next_seq(),
        };
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::SendInvite(request)),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::SendRequest(request)),
        };

        self.evict_if_full(false);
        self.inner.client.insert(key.clone(), entry);
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    /// Routes an inbound response to its client transaction. Responses
    /// that match nothing are absorbed silently (late or stray).
    pub async fn receive_response(&self, response: Response) {
        let Some(key) = TransactionKey::client_for_response(&response) else {
            warn!("response without Via branch or CSeq; dropping");
            return;
        };
        if !self.inner.client.contains_key(&key) {
            debug!(branch = %key.branch, code = response.code(), "no matching client transaction");
            return;
        }

        let provisional = response.is_provisional();
        if let Some(mut entry) = self.inner.client.get_mut(&key) {
            let actions = match (&mut entry.kind, provisional) {
                (ClientKind::Invite(fsm), true) => {
                    fsm.on_event(ClientInviteEvent::ReceiveProvisional(response))
                }
                (ClientKind::Invite(fsm), false) => {
                    fsm.on_event(ClientInviteEvent::ReceiveFinal(response))
                }
                (ClientKind::NonInvite(fsm), true) => {
                    fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response))
                }
                (ClientKind::NonInvite(fsm), false) => {
                    fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response))
                }
            };
            drop(entry);
            self.apply_client_actions(&key, actions).await;
        }
    }

    /// Whether a client transaction is still tracked (pending or waiting
    /// out its completion timers).
    pub fn has_client(&self, key: &TransactionKey) -> bool {
        self.inner.client.contains_key(key)
    }

    // --- Action application ---------------------------------------------

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Transmit(bytes) => {
                    let ctx = match self.inner.server.get(key) {
                        Some(entry) => entry.ctx,
                        None => continue,
                    };
                    if let Err(err) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
                        error!(%err, branch = %key.branch, "server transmit failed");
                        let _ = self
                            .cmd_tx
                            .send(Command::ServerTransportError { key: key.clone() })
                            .await;
                    }
                }
                ServerAction::Schedule { timer, duration } => {
                    self.schedule(key.clone(), timer, duration, true);
                }
                ServerAction::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ServerAction::Terminate { reason, .. } => {
                    debug!(branch = %key.branch, %reason, "server transaction terminated");
                    if let Some((_, mut entry)) = self.inner.server.remove(key) {
                        entry.cancel_all();
                    }
                }
            }
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Transmit(bytes) => {
                    let ctx = match self.inner.client.get(key) {
                        Some(entry) => entry.ctx,
                        None => continue,
                    };
                    if let Err(err) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
                        error!(%err, branch = %key.branch, "client transmit failed");
                        let _ = self
                            .cmd_tx
                            .send(Command::ClientTransportError { key: key.clone() })
                            .await;
                    }
                }
                ClientAction::Deliver(response) => {
                    if let Some(entry) = self.inner.client.get(key) {
                        let tu = entry.tu.clone();
                        drop(entry);
                        if response.is_provisional() {
                            tu.on_provisional(key, &response).await;
                        } else {
                            tu.on_final(key, &response).await;
                        }
                    }
                }
                ClientAction::GenerateAck(response) => {
                    self.send_non_2xx_ack(key, &response).await;
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule(key.clone(), timer, duration, false);
                }
                ClientAction::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ClientAction::Terminate { reason, kind } => {
                    debug!(branch = %key.branch, %reason, "client transaction terminated");
                    if let Some((_, mut entry)) = self.inner.client.remove(key) {
                        entry.cancel_all();
                        entry.tu.on_terminated(key, reason.as_str(), kind).await;
                    }
                }
            }
        }
    }

    /// The ACK for a non-2xx final is generated by the transaction layer
    /// itself on the INVITE's branch (RFC 3261 §17.1.1.3).
    async fn send_non_2xx_ack(&self, key: &TransactionKey, response: &Response) {
        let (ack, ctx) = match self.inner.client.get(key) {
            Some(entry) => (ack_for_non_2xx(&entry.request, response), entry.ctx),
            None => return,
        };
        let bytes: Bytes = serialize_request(&ack);
        if let Err(err) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
            error!(%err, branch = %key.branch, "failed to send ACK");
        }
    }

    // --- Timers ---------------------------------------------------------

    fn schedule(
        &self,
        key: TransactionKey,
        timer: TransactionTimer,
        duration: Duration,
        is_server: bool,
    ) {
        if duration.is_zero() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx.send(timer_command(key, timer, is_server)).await;
            });
            return;
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let registered = if is_server {
            match self.inner.server.get_mut(&key) {
                Some(mut entry) => {
                    entry.cancel_timer(timer);
                    entry.timers.insert(timer, cancel_tx);
                    true
                }
                None => false,
            }
        } else {
            match self.inner.client.get_mut(&key) {
                Some(mut entry) => {
                    entry.cancel_timer(timer);
                    entry.timers.insert(timer, cancel_tx);
                    true
                }
                None => false,
            }
        };
        if !registered {
            return;
        }

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(timer_command(key, timer, is_server)).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    async fn server_timer_fired(&self, key: TransactionKey, timer: TransactionTimer) {
        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            entry.cancel_timer(timer);
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TimerFired(timer)),
                ServerKind::NonInvite(fsm) => {
                    fsm.on_event(ServerNonInviteEvent::TimerFired(timer))
                }
            };
            drop(entry);
            self.apply_server_actions(&key, actions).await;
        }
    }

    async fn client_timer_fired(&self, key: TransactionKey, timer: TransactionTimer) {
        if let Some(mut entry) = self.inner.client.get_mut(&key) {
            entry.cancel_timer(timer);
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TimerFired(timer)),
                ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
            };
            drop(entry);
            self.apply_client_actions(&key, actions).await;
        }
    }

    /// Drops the oldest transaction when the table is full. Keeps a
    /// flooded agent bounded in memory at the cost of the oldest state.
    fn evict_if_full(&self, server: bool) {
        if server {
            if self.inner.server.len() < MAX_TRANSACTIONS {
                return;
            }
            let oldest = self
                .inner
                .server
                .iter()
                .min_by_key(|entry| entry.seq)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                warn!(branch = %key.branch, "server transaction table full; evicting oldest");
                if let Some((_, mut entry)) = self.inner.server.remove(&key) {
                    entry.cancel_all();
                }
            }
        } else {
            if self.inner.client.len() < MAX_TRANSACTIONS {
                return;
            }
            let oldest = self
                .inner
                .client
                .iter()
                .min_by_key(|entry| entry.seq)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                warn!(branch = %key.branch, "client transaction table full; evicting oldest");
                if let Some((_, mut entry)) = self.inner.client.remove(&key) {
                    entry.cancel_all();
                }
            }
        }
    }
}

fn timer_command(key: TransactionKey, timer: TransactionTimer, is_server: bool) -> Command {
    if is_server {
        Command::ServerTimer { key, timer }
    } else {
        Command::ClientTimer { key, timer }
    }
}

/// Response path for one server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub async fn send_provisional(&self, response: Response) {
        self.manager.send_provisional(&self.key, response).await;
    }

    pub async fn send_final(&self, response: Response) {
        self.manager.send_final(&self.key, response).await;
    }

    /// Whether the transaction is still tracked (no final sent, or still
    /// draining its wait timers).
    pub fn is_active(&self) -> bool {
        self.manager.inner.server.contains_key(&self.key)
    }
}

impl std::fmt::Debug for ServerTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransactionHandle")
            .field("key", &self.key)
            .finish()
    }
}
