// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bridge to the external RTP media engine.
//!
//! The signaling core hands the engine a negotiated local endpoint and the
//! peer's offer, and gets back a [`MediaSession`] whose answer SDP goes
//! into the 200 OK. Decoded audio and DTMF flow to the application through
//! a [`MediaSink`]; RTP bytes never cross this boundary.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use larynx_sdp::SessionDescription;

/// Receiver for media events decoded by the RTP engine.
pub trait MediaSink: Send + Sync {
    /// A frame of decoded audio with its RTP timestamp.
    fn on_audio(&self, pcm: &[u8], timestamp: u32);

    /// A DTMF digit (RFC 4733 telephone-event), with its duration.
    fn on_dtmf(&self, digit: char, duration_ms: u32);
}

/// One call's media half, created from the peer's SDP offer.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// The negotiated answer to embed in the 200 OK.
    fn sdp_answer(&self) -> &SessionDescription;

    /// The audio payload type negotiation selected.
    fn chosen_payload_type(&self) -> u8;

    /// Attaches the sink receiving audio/DTMF callbacks.
    fn set_sink(&mut self, sink: Arc<dyn MediaSink>);

    /// Binds sockets and starts the RTP flow.
    async fn start(&mut self) -> Result<()>;

    /// Stops the flow and releases the port.
    async fn stop(&mut self) -> Result<()>;
}

/// Factory the application registers to produce media sessions.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    /// Creates a session bound to `local_ip:local_port`, negotiated
    /// against `offer`.
    async fn create(
        &self,
        local_ip: &str,
        local_port: u16,
        offer: &SessionDescription,
    ) -> Result<Box<dyn MediaSession>>;
}
