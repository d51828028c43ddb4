// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-agent facades over the transaction and dialog layers.
//!
//! [`UserAgentServer`] turns inbound INVITEs into [`IncomingCall`] handles
//! and drives the callback surface the application implements
//! ([`UserAgentEvents`]). [`UserAgentClient`] issues in-dialog requests
//! (BYE, re-INVITE, INFO) and outbound INVITEs with CANCEL support, each
//! resolved through a completion handle. The RTP engine stays behind the
//! [`MediaSession`] bridge; this crate never touches media bytes.

use std::time::Duration;

use larynx_core::SipUri;
use smol_str::SmolStr;

pub mod bridge;
pub mod uac;
pub mod uas;

pub use bridge::{MediaSession, MediaSessionFactory, MediaSink};
pub use uac::{OutboundCall, RequestError, RequestHandle, UserAgentClient};
pub use uas::{reply_to, CallError, IncomingCall, UserAgentEvents, UserAgentServer};

pub use larynx_core::{Request, Response};
pub use larynx_dialog::{DialogId, DialogState};

/// Settings shared by the facades.
#[derive(Debug, Clone)]
pub struct UserAgentConfig {
    /// Our address-of-record (goes into From/To on requests we originate).
    pub local_uri: SipUri,
    /// `User-Agent` header value on requests we originate.
    pub user_agent: SmolStr,
    /// Payload types offered/accepted, in preference order.
    pub supported_codecs: Vec<u8>,
    /// Negotiate `telephone-event` when offered.
    pub dtmf: bool,
    /// Grace period before the automatic 100 Trying.
    pub trying_delay: Duration,
}

impl UserAgentConfig {
    pub fn new(local_uri: SipUri) -> Self {
        Self {
            local_uri,
            user_agent: SmolStr::new(concat!("larynx/", env!("CARGO_PKG_VERSION"))),
            supported_codecs: vec![0, 8],
            dtmf: true,
            trying_delay: Duration::from_millis(200),
        }
    }
}
