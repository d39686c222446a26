//! Routing activation and alive-check bookkeeping for one peer
//!
//! ```text
//!  Idle ──0x0005──▶ Activating ──▶ Active ──timeout / deactivate──▶ Inactive
//!                                    ▲                                  │
//!                                    └──────────── 0x0005 ──────────────┘
//! ```
//!
//! Activation completes synchronously inside
//! [`RoutingSession::on_routing_activation_request`], so `Activating` is
//! never observed from outside.
//!
//! The session never touches a clock itself. Callers pass `now` into every
//! operation, which keeps the alive-check cadence deterministic under test.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::doip::payload::{
    AliveCheckRequest, RoutingActivationCode, RoutingActivationRequest, RoutingActivationResponse,
};
use crate::doip::DoipFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingState {
    Idle,
    /// Between request and response; not held across calls
    Activating,
    Active,
    Inactive,
}

/// Outcome of [`RoutingSession::poll_alive_check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliveCheck {
    /// Nothing to do yet
    NotDue,
    /// Send this Alive Check Request to the peer
    Send(DoipFrame),
    /// The previous request went unanswered; the session is now Inactive
    Expired,
}

#[derive(Debug)]
pub struct RoutingSession {
    local_logical_address: u16,
    peer_logical_address: Option<u16>,
    state: RoutingState,
    last_activity: Option<Instant>,
    interval: Duration,
    timeout: Option<Duration>,
    next_alive_check: Option<Instant>,
    /// Send time of an alive check that has not been answered yet
    pending_since: Option<Instant>,
}

impl RoutingSession {
    pub fn new(local_logical_address: u16, interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            local_logical_address,
            peer_logical_address: None,
            state: RoutingState::Idle,
            last_activity: None,
            interval,
            timeout,
            next_alive_check: None,
            pending_since: None,
        }
    }

    pub fn from_config(local_logical_address: u16, config: &RoutingConfig) -> Self {
        Self::new(
            local_logical_address,
            config.alive_check_interval(),
            config.alive_check_timeout(),
        )
    }

    pub fn state(&self) -> RoutingState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == RoutingState::Active
    }

    pub fn local_logical_address(&self) -> u16 {
        self.local_logical_address
    }

    pub fn peer_logical_address(&self) -> Option<u16> {
        self.peer_logical_address
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn alive_check_interval(&self) -> Duration {
        self.interval
    }

    /// True when `source_address` is the activated peer
    pub fn accepts_source(&self, source_address: u16) -> bool {
        self.is_active() && self.peer_logical_address == Some(source_address)
    }

    // ===== Routing Activation (0x0005) =====

    /// Activate routing for `request.source_address`. Always succeeds.
    pub fn on_routing_activation_request(
        &mut self,
        request: &RoutingActivationRequest,
        now: Instant,
    ) -> RoutingActivationResponse {
        let source_address = request.source_address;
        if let Some(previous) = self.peer_logical_address.filter(|_| self.is_active()) {
            if previous != source_address {
                warn!(
                    previous = format!("0x{:04X}", previous),
                    source_address = format!("0x{:04X}", source_address),
                    "Routing re-activated by a different tester"
                );
            }
        }

        debug!(
            source_address = format!("0x{:04X}", source_address),
            activation_type = format!("0x{:02X}", request.activation_type),
            "Routing activation requested"
        );

        self.peer_logical_address = Some(source_address);
        self.last_activity = Some(now);
        self.next_alive_check = Some(now + self.interval);
        self.pending_since = None;
        self.state = RoutingState::Active;

        info!(
            tester = format!("0x{:04X}", source_address),
            entity = format!("0x{:04X}", self.local_logical_address),
            "Routing activated"
        );

        RoutingActivationResponse {
            entity_address: self.local_logical_address,
            tester_address: source_address,
            code: RoutingActivationCode::Success,
            reserved: 0,
        }
    }

    // ===== Alive Check (0x0007 / 0x0008) =====

    pub fn on_alive_check_response(&mut self, source_address: Option<u16>, now: Instant) {
        if let (Some(got), Some(peer)) = (source_address, self.peer_logical_address) {
            if got != peer {
                debug!(
                    source_address = format!("0x{:04X}", got),
                    peer = format!("0x{:04X}", peer),
                    "Alive check response from unexpected address"
                );
            }
        }
        self.touch(now);
    }

    /// Record inbound traffic from the peer
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.pending_since = None;
    }

    /// Decide whether an Alive Check Request is due at `now`.
    ///
    /// A request that stayed unanswered for longer than the timeout expires
    /// the session the next time a check falls due.
    pub fn poll_alive_check(&mut self, now: Instant) -> AliveCheck {
        if !self.is_active() {
            return AliveCheck::NotDue;
        }
        let Some(due) = self.next_alive_check else {
            return AliveCheck::NotDue;
        };
        if now < due {
            return AliveCheck::NotDue;
        }

        if let (Some(sent), Some(timeout)) = (self.pending_since, self.timeout) {
            if now.saturating_duration_since(sent) >= timeout {
                warn!(
                    peer = self.peer_logical_address.map(|a| format!("0x{:04X}", a)),
                    timeout_ms = timeout.as_millis() as u64,
                    "Alive check unanswered, routing expired"
                );
                self.deactivate();
                return AliveCheck::Expired;
            }
        }

        // One interval after the due time, not after `now`
        let mut next = due + self.interval;
        if next <= now {
            next = now + self.interval;
        }
        self.next_alive_check = Some(next);
        if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
        debug!(
            source_address = format!("0x{:04X}", self.local_logical_address),
            "Sending alive check request"
        );
        AliveCheck::Send(
            AliveCheckRequest {
                source_address: self.local_logical_address,
            }
            .into_frame(),
        )
    }

    /// Leave the Active state. Returns true if routing was active.
    pub fn deactivate(&mut self) -> bool {
        let was_active = self.is_active();
        if was_active {
            info!(
                peer = self.peer_logical_address.map(|a| format!("0x{:04X}", a)),
                "Routing deactivated"
            );
        }
        if self.state != RoutingState::Idle {
            self.state = RoutingState::Inactive;
        }
        self.next_alive_check = None;
        self.pending_since = None;
        was_active
    }
}
