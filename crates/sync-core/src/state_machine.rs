use std::time::Duration;

use crate::{
    error::{SyncError, SyncErrorCategory},
    retry::RetryPolicy,
    types::ConnectionState,
};

/// What the transport owner should do after a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Close report from a superseded connection; nothing changes.
    Stale,
    /// Normal closure or ineligible session; stay closed.
    StayClosed,
    /// Schedule exactly one reconnect attempt after `delay`.
    Reconnect {
        attempt: u32,
        delay: Duration,
        generation: u64,
    },
    /// Too many consecutive failures; reconnection is abandoned.
    Abandon { attempts: u32 },
}

/// Lifecycle of the single push connection owned by one session context.
///
/// Every open attempt gets a new generation number. Reports from the transport
/// and reconnect timers carry the generation they belong to, so late reports
/// from a superseded connection are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    eligible: bool,
    generation: u64,
    failed_attempts: u32,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            eligible: true,
            generation: 0,
            failed_attempts: 0,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start an open attempt and return its generation.
    ///
    /// Rejected while another attempt is in flight or a connection is open.
    pub fn begin_open(&mut self) -> Result<u64, SyncError> {
        if !self.eligible {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "session_ineligible",
                "session was torn down; open is not allowed",
            ));
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed { .. } => {
                self.generation = self.generation.wrapping_add(1);
                self.state = ConnectionState::Connecting;
                Ok(self.generation)
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                Err(SyncError::invalid_state(self.state, "open"))
            }
        }
    }

    /// Transport reported a successful open.
    pub fn on_open(&mut self, generation: u64) -> Result<ConnectionState, SyncError> {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return Err(SyncError::invalid_state(self.state, "on_open"));
        }
        self.state = ConnectionState::Open;
        self.failed_attempts = 0;
        Ok(self.state)
    }

    /// Transport reported closure (or a failed connect attempt).
    pub fn on_closed(&mut self, generation: u64, normal: bool, policy: &RetryPolicy) -> CloseOutcome {
        if generation != self.generation {
            return CloseOutcome::Stale;
        }
        if matches!(self.state, ConnectionState::Closed { .. }) {
            return CloseOutcome::Stale;
        }

        self.state = ConnectionState::Closed { normal };
        if normal || !self.eligible {
            return CloseOutcome::StayClosed;
        }

        let attempt = self.failed_attempts;
        if !policy.allows_attempt(attempt) {
            return CloseOutcome::Abandon { attempts: attempt };
        }
        self.failed_attempts = attempt.saturating_add(1);
        CloseOutcome::Reconnect {
            attempt,
            delay: policy.delay(),
            generation,
        }
    }

    /// A scheduled reconnect fired; returns whether it should proceed.
    pub fn reconnect_due(&self, generation: u64) -> bool {
        self.eligible
            && generation == self.generation
            && self.state == ConnectionState::Closed { normal: false }
    }

    /// Intentional teardown. Invalidates in-flight attempts and timers.
    pub fn teardown(&mut self) -> ConnectionState {
        self.eligible = false;
        self.generation = self.generation.wrapping_add(1);
        self.state = ConnectionState::Closed { normal: true };
        self.state
    }
}
