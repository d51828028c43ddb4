// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four §17 transaction state machines.
//!
//! Machines are pure: every event returns a list of actions for the
//! runtime to execute (transmit bytes, schedule or cancel a timer,
//! deliver a response upward, terminate). Illegal event/state pairs
//! return no actions.

use std::time::Duration;

use bytes::Bytes;
use larynx_core::{Request, Response};
use larynx_parse::{serialize_request, serialize_response};
use smol_str::SmolStr;

use crate::timers::TimerTable;
use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TerminationKind, TransactionTimer,
};

/// Events driving client transactions.
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by client transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit(Bytes),
    /// Hand the response to the transaction user.
    Deliver(Response),
    /// A non-2xx final needs an ACK on this transaction's branch.
    GenerateAck(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    CancelTimer(TransactionTimer),
    Terminate {
        reason: SmolStr,
        kind: TerminationKind,
    },
}

/// Events driving server transactions.
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite(Request),
    ReceiveAck,
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by server transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Bytes),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    CancelTimer(TransactionTimer),
    Terminate {
        reason: SmolStr,
        kind: TerminationKind,
    },
}

// --- Client INVITE (RFC 3261 §17.1.1) ----------------------------------

pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TimerTable,
    a_interval: Duration,
    last_invite: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1(),
            timers,
            last_invite: None,
        }
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => self.send_invite(invite),
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![
                    ClientAction::CancelTimer(TransactionTimer::A),
                    ClientAction::Deliver(response),
                ]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                self.receive_final(response)
            }
            (Completed, ClientInviteEvent::ReceiveFinal(response)) => {
                // Retransmitted final: re-ACK, do not deliver again.
                if response.is_success() {
                    Vec::new()
                } else {
                    vec![ClientAction::GenerateAck(response)]
                }
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => self.timer_a(),
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    ClientAction::CancelTimer(TransactionTimer::A),
                    ClientAction::Terminate {
                        reason: SmolStr::new("no final response within 64*T1"),
                        kind: TerminationKind::Timeout,
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("Timer D"),
                    kind: TerminationKind::Normal,
                }]
            }
            (_, ClientInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    kind: TerminationKind::TransportError,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn send_invite(&mut self, invite: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&invite);
        self.last_invite = Some(bytes.clone());
        let mut actions = vec![ClientAction::Transmit(bytes)];
        if self.timers.retransmits() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.timers.duration(TransactionTimer::A),
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn receive_final(&mut self, response: Response) -> Vec<ClientAction> {
        let mut actions = vec![
            ClientAction::CancelTimer(TransactionTimer::A),
            ClientAction::CancelTimer(TransactionTimer::B),
            ClientAction::Deliver(response.clone()),
        ];
        if response.is_success() {
            // 2xx terminates the transaction; the ACK is an end-to-end
            // request owned by the dialog layer.
            self.state = ClientInviteState::Terminated;
            actions.push(ClientAction::Terminate {
                reason: SmolStr::new("2xx received"),
                kind: TerminationKind::Normal,
            });
        } else {
            self.state = ClientInviteState::Completed;
            actions.push(ClientAction::GenerateAck(response));
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::D,
                duration: self.timers.duration(TransactionTimer::D),
            });
        }
        actions
    }

    fn timer_a(&mut self) -> Vec<ClientAction> {
        let Some(invite) = &self.last_invite else {
            return Vec::new();
        };
        let actions = vec![
            ClientAction::Transmit(invite.clone()),
            ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration: {
                    self.a_interval = (self.a_interval * 2).min(self.timers.t2());
                    self.a_interval
                },
            },
        ];
        actions
    }
}

// --- Client non-INVITE (RFC 3261 §17.1.2) ------------------------------

pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TimerTable,
    e_interval: Duration,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1(),
            timers,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => self.send_request(request),
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![ClientAction::Deliver(response)]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    ClientAction::Deliver(response),
                    ClientAction::CancelTimer(TransactionTimer::E),
                    ClientAction::CancelTimer(TransactionTimer::F),
                    ClientAction::Schedule {
                        timer: TransactionTimer::K,
                        duration: self.timers.duration(TransactionTimer::K),
                    },
                ]
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::CancelTimer(TransactionTimer::E),
                    ClientAction::Terminate {
                        reason: SmolStr::new("no final response within 64*T1"),
                        kind: TerminationKind::Timeout,
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("Timer K"),
                    kind: TerminationKind::Normal,
                }]
            }
            (_, ClientNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    kind: TerminationKind::TransportError,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn send_request(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![ClientAction::Transmit(bytes)];
        if self.timers.retransmits() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.timers.duration(TransactionTimer::E),
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    fn timer_e(&mut self) -> Vec<ClientAction> {
        let Some(request) = &self.last_request else {
            return Vec::new();
        };
        self.e_interval = (self.e_interval * 2).min(self.timers.t2());
        vec![
            ClientAction::Transmit(request.clone()),
            ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            },
        ]
    }
}

// --- Server INVITE (RFC 3261 §17.2.1) ----------------------------------

pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TimerTable,
    g_interval: Duration,
    last_response: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.t1(),
            timers,
            last_response: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveInvite(_)) => Vec::new(),
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                let bytes = serialize_response(&response);
                self.last_response = Some(bytes.clone());
                vec![ServerAction::Transmit(bytes)]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => self.send_final(response),
            (Completed, ServerInviteEvent::ReceiveAck) => {
                self.state = Confirmed;
                vec![
                    ServerAction::CancelTimer(TransactionTimer::G),
                    ServerAction::CancelTimer(TransactionTimer::H),
                    ServerAction::Schedule {
                        timer: TransactionTimer::I,
                        duration: self.timers.duration(TransactionTimer::I),
                    },
                ]
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => self.timer_g(),
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::CancelTimer(TransactionTimer::G),
                    ServerAction::Terminate {
                        reason: SmolStr::new("no ACK within 64*T1"),
                        kind: TerminationKind::Timeout,
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("Timer I"),
                    kind: TerminationKind::Normal,
                }]
            }
            (_, ServerInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    kind: TerminationKind::TransportError,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// A retransmitted INVITE re-sends the latest response.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        let latest = match self.state {
            ServerInviteState::Completed => self.last_final.as_ref(),
            _ => self.last_response.as_ref(),
        };
        match latest {
            Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
            None => Vec::new(),
        }
    }

    fn send_final(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = serialize_response(&response);
        if response.is_success() {
            // 2xx ends the transaction immediately; 200 retransmission
            // until ACK is the TU's business (RFC 3261 §13.3.1.4).
            self.state = ServerInviteState::Terminated;
            vec![
                ServerAction::Transmit(bytes),
                ServerAction::Terminate {
                    reason: SmolStr::new("2xx sent"),
                    kind: TerminationKind::Normal,
                },
            ]
        } else {
            self.state = ServerInviteState::Completed;
            self.last_final = Some(bytes.clone());
            let mut actions = vec![ServerAction::Transmit(bytes)];
            if self.timers.retransmits() {
                actions.push(ServerAction::Schedule {
                    timer: TransactionTimer::G,
                    duration: self.timers.duration(TransactionTimer::G),
                });
            }
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::H,
                duration: self.timers.duration(TransactionTimer::H),
            });
            actions
        }
    }

    fn timer_g(&mut self) -> Vec<ServerAction> {
        let Some(bytes) = &self.last_final else {
            return Vec::new();
        };
        self.g_interval = (self.g_interval * 2).min(self.timers.t2());
        vec![
            ServerAction::Transmit(bytes.clone()),
            ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}

// --- Server non-INVITE (RFC 3261 §17.2.2) ------------------------------

pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TimerTable,
    last_final: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest(_)) => Vec::new(),
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                vec![ServerAction::Transmit(serialize_response(&response))]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.state = Completed;
                let bytes = serialize_response(&response);
                self.last_final = Some(bytes.clone());
                vec![
                    ServerAction::Transmit(bytes),
                    ServerAction::Schedule {
                        timer: TransactionTimer::J,
                        duration: self.timers.duration(TransactionTimer::J),
                    },
                ]
            }
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("Timer J"),
                    kind: TerminationKind::Normal,
                }]
            }
            (_, ServerNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    kind: TerminationKind::TransportError,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// A retransmitted request re-sends the final response, if any.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        match (&self.state, &self.last_final) {
            (ServerNonInviteState::Completed, Some(bytes)) => {
                vec![ServerAction::Transmit(bytes.clone())]
            }
            _ => Vec::new(),
        }
    }
}
