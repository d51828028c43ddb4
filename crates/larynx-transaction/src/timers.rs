// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values per RFC 3261 §17 / Table 4.
//!
//! Over reliable transports the wait-state timers (D, I, J, K) and the
//! retransmit timers (A, E, G) collapse to zero; the transaction timeouts
//! (B, F, H) stay at 64·T1 everywhere.

use std::time::Duration;

use crate::transport::TransportKind;
use crate::TransactionTimer;

/// RFC 3261 base timer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// Round-trip estimate, 500 ms by default.
    pub t1: Duration,
    /// Maximum retransmit interval, 4 s by default.
    pub t2: Duration,
    /// Maximum lifetime of a message in the network, 5 s by default.
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer table for one transaction, bound to its transport.
#[derive(Debug, Clone, Copy)]
pub struct TimerTable {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TimerTable {
    pub fn new(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// Whether retransmit timers should run at all.
    pub fn retransmits(&self) -> bool {
        !self.transport.is_reliable()
    }

    /// The initial duration for a timer; retransmit timers double on each
    /// firing up to T2, which the state machines track themselves.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.defaults.t1.saturating_mul(64)
            }
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            TransactionTimer::I | TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
            TransactionTimer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1.saturating_mul(64)
                }
            }
        }
    }
}
