// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types for the larynx stack:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **URIs**: [`SipUri`] (sip/sips) and [`NameAddr`] (addr-spec with display name)
//! - **Headers**: [`Headers`] raw store with typed accessors
//! - **Methods**: [`Method`] (INVITE, BYE, CANCEL, OPTIONS, INFO, ACK)
//! - **Identifiers**: branch / tag / Call-ID generators
//!
//! Header-sized strings use [`SmolStr`](smol_str::SmolStr) and message
//! bodies use [`Bytes`](bytes::Bytes), so clones along the signaling path
//! stay cheap.

pub mod cseq;
pub mod headers;
pub mod ident;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod uri;
pub mod via;

pub use cseq::CSeq;
pub use headers::{
    canonical_name, expand_compact, is_multi_value, split_multi_value, Header, Headers,
};
pub use ident::{generate_branch, generate_call_id, generate_cseq_seed, generate_tag};
pub use method::Method;
pub use msg::{default_reason, Request, RequestLine, Response, SipMessage, StatusLine};
pub use name_addr::NameAddr;
pub use uri::{SipUri, UriError};
pub use via::{is_rfc3261_branch, ViaHeader, BRANCH_MAGIC_COOKIE};
