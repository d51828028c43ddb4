// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport abstraction.
//!
//! The stack never opens sockets. The embedding application supplies a
//! [`TransportDispatcher`] that moves framed SIP bytes to a peer, and feeds
//! inbound messages back in through the user-agent facades. Two properties
//! are assumed: UDP may reorder or drop datagrams (so the state machines
//! retransmit), and TCP delivers in order with `Content-Length` framing.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Which transport carried (or should carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    /// Reliable transports collapse the wait-state timers to zero.
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Tcp)
    }

    /// The Via transport token.
    pub fn via_token(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }
}

/// Where a transaction's messages go: captured when the transaction is
/// created so retransmissions reuse the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportContext {
    pub kind: TransportKind,
    pub peer: SocketAddr,
}

impl TransportContext {
    pub fn new(kind: TransportKind, peer: SocketAddr) -> Self {
        Self { kind, peer }
    }

    pub fn udp(peer: SocketAddr) -> Self {
        Self::new(TransportKind::Udp, peer)
    }
}

/// Outbound half of the transport supplied by the embedder.
///
/// `payload` is a complete framed SIP message. Errors terminate the
/// owning transaction and surface as `TransportError`.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()>;

    /// Host (and optional port) the local user agent is reachable at,
    /// used for Via and Contact construction.
    fn local_contact(&self) -> (String, u16);
}

/// Where to send a response per RFC 3261 §18.2.2: the top Via's
/// `received` address when present (else sent-by host), and the `rport`
/// value when present (else the sent-by port, else 5060).
///
/// Transports that reply straight to the datagram source do not need
/// this; it exists for transports that route responses by Via.
pub fn response_destination(response: &larynx_core::Response) -> Option<(String, u16)> {
    let via = response.headers.top_via()?;
    let host = via
        .received()
        .map(str::to_owned)
        .unwrap_or_else(|| via.host.to_string());
    let port = via
        .rport()
        .and_then(|p| p.parse().ok())
        .or(via.port)
        .unwrap_or(5060);
    Some((host, port))
}
