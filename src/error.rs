//! Error taxonomy for the coordination core.
//!
//! A hand-rolled enum plus `Display`/`Error` impls, rather than pulling in
//! `thiserror`/`anyhow`.

use std::error::Error;
use std::fmt;

/// Errors surfaced across the coordination core.
///
/// `BackendStreamError` is the only error an [`crate::agent_runner::AgentRunner`]
/// surfaces upward on its own; everything
/// else it encounters is swallowed and logged. `InvalidTransition` is returned by
/// the shared-state bus and dropped by callers (the offending workflow call is
/// discarded, the attempt continues). `WorkspaceSafetyViolation`, `HardTimeout`,
/// and `NoViableWinner` are surfaced by the orchestrator to its caller.
#[derive(Debug, Clone)]
pub enum CoordinationError {
    /// An attempt's backend reported an `error` chunk or its transport broke.
    BackendStreamError {
        /// Anon id of the agent whose attempt failed.
        anon_id: String,
        /// Human-readable detail forwarded from the backend.
        detail: String,
    },

    /// A runner tried to commit a transition that violates a `SharedState` invariant
    /// (e.g. voting for an unknown anon id, committing after the run is no longer
    /// `coordinating`).
    InvalidTransition {
        /// Anon id of the agent whose transition was rejected.
        anon_id: String,
        /// What was attempted and why it was rejected.
        detail: String,
    },

    /// A workspace path failed the absolute / lexically-under-parent safety
    /// predicates in [`crate::workspace`]. Fatal: the run must abort.
    WorkspaceSafetyViolation(String),

    /// The run-wide wall-clock timeout elapsed before the coordinating phase
    /// otherwise concluded.
    HardTimeout,

    /// Winner selection produced no candidate because no agent ever
    /// committed an answer.
    NoViableWinner,
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::BackendStreamError { anon_id, detail } => {
                write!(f, "backend stream error for {}: {}", anon_id, detail)
            }
            CoordinationError::InvalidTransition { anon_id, detail } => {
                write!(f, "invalid transition for {}: {}", anon_id, detail)
            }
            CoordinationError::WorkspaceSafetyViolation(detail) => {
                write!(f, "workspace safety violation: {}", detail)
            }
            CoordinationError::HardTimeout => write!(f, "hard timeout elapsed"),
            CoordinationError::NoViableWinner => write!(f, "no viable winner: no agent answered"),
        }
    }
}

impl Error for CoordinationError {}

/// Why an aborted run ended without a presented answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// `Answered` was empty at selection time.
    NoAnswers,
    /// The run-wide hard timeout fired with no usable state.
    HardTimeout,
    /// Every agent exhausted its attempts without producing a usable answer.
    AllAgentsFailed,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::NoAnswers => "no_answers",
            AbortReason::HardTimeout => "hard_timeout",
            AbortReason::AllAgentsFailed => "all_agents_failed",
        };
        write!(f, "{}", s)
    }
}
