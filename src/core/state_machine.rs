//! Session State Machine
//!
//! Validates device session lifecycle transitions:
//!
//! ```text
//! Closed -> Opening -> Open -> Closing -> Closed
//!              |                            ^
//!              +------- (open failed) ------+
//! ```
//!
//! Every accepted transition is recorded with a timestamp and reason.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Not connected (initial and terminal)
    Closed,
    /// Acquiring the channel
    Opening,
    /// Channel acquired, traffic flowing
    Open,
    /// Releasing the channel
    Closing,
}

impl SessionState {
    /// Check if state allows sending data
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Rejected lifecycle transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct StateError {
    /// State the machine was in
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Session state machine
pub struct SessionStateMachine {
    state: SessionState,
    history: Vec<StateTransition>,
    max_history: usize,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in `Closed`
    pub fn new() -> Self {
        Self {
            state: SessionState::Closed,
            history: Vec::new(),
            max_history: 100,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get state history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: SessionState,
        reason: Option<&str>,
    ) -> Result<(), StateError> {
        if !self.is_valid_transition(new_state) {
            return Err(StateError {
                from: self.state,
                to: new_state,
            });
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = new_state;
        Ok(())
    }

    fn is_valid_transition(&self, new_state: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self.state, new_state),
            (Closed, Opening)
                | (Opening, Open)
                | (Opening, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Closed);

        sm.transition(SessionState::Opening, Some("open requested")).unwrap();
        sm.transition(SessionState::Open, None).unwrap();
        assert!(sm.state().can_send());

        sm.transition(SessionState::Closing, None).unwrap();
        assert!(sm.state().is_transitional());
        sm.transition(SessionState::Closed, None).unwrap();

        assert_eq!(sm.history().len(), 4);
        assert_eq!(sm.history()[0].reason.as_deref(), Some("open requested"));
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Opening, None).unwrap();
        sm.transition(SessionState::Closed, Some("connect failed")).unwrap();
        assert_eq!(sm.state(), SessionState::Closed);
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = SessionStateMachine::new();

        let err = sm.transition(SessionState::Open, None).unwrap_err();
        assert_eq!(err.from, SessionState::Closed);
        assert_eq!(err.to, SessionState::Open);
        assert_eq!(err.to_string(), "Invalid transition from closed to open");

        // Same-state transitions are rejected too
        assert!(sm.transition(SessionState::Closed, None).is_err());
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = SessionStateMachine::new();
        for _ in 0..60 {
            sm.transition(SessionState::Opening, None).unwrap();
            sm.transition(SessionState::Closed, None).unwrap();
        }
        assert_eq!(sm.history().len(), 100);
    }
}
