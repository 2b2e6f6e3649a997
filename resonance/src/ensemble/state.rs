//! Ensemble run state machine with legal-transition guards.
//!
//! ```text
//! Starting → Streaming | Aborted
//! Streaming → Draining | Aborted
//! Draining → Completed | Aborted
//! ```
//!
//! Every transition is recorded so a finished run can report how it got
//! where it is.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Acquiring handles and launching streams.
    Starting,
    /// Consuming tokens and emitting windows.
    Streaming,
    /// Every stream ended; flushing the partial window.
    Draining,
    /// Drained cleanly. Terminal.
    Completed,
    /// Cancelled, or no stream left alive. Terminal.
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Draining => write!(f, "Draining"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

fn is_legal_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Starting, Streaming) | (Streaming, Draining) | (Draining, Completed)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunState,
    pub to: RunState,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal run transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// State of one ensemble run.
#[derive(Debug)]
pub struct RunStateMachine {
    run_id: RunId,
    current: RunState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl RunStateMachine {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            current: RunState::Starting,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            run_id = %self.run_id,
            from = %self.current,
            to = %to,
            reason = reason.unwrap_or(""),
            "Run state transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn abort(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(RunState::Aborted, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }
}
