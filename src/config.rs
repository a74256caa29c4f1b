//! Configuration for a coordination run.
//!
//! Users construct this manually — no file parsing dependencies are introduced
//! here. YAML/TOML config loading belongs to the CLI layer that wraps this
//! core, not to the core itself.

use std::path::PathBuf;
use std::time::Duration;

/// Whether an agent is allowed to cast a vote for itself.
///
/// Real deployments disagree on this (some `vote` tool schemas restrict the
/// enum of valid targets to exclude the caller, others don't), so it's a config
/// flag rather than an inferred default. `Allowed` is the default because the
/// orchestrator does not enforce a no-self-vote rule unless asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfVotePolicy {
    /// Self-votes are accepted like any other vote.
    Allowed,
    /// A `vote` targeting the voting agent's own anon id is rejected with
    /// `invalid_transition`.
    Forbidden,
}

impl Default for SelfVotePolicy {
    fn default() -> Self {
        SelfVotePolicy::Allowed
    }
}

/// Global configuration for one coordination run.
///
/// Constructed directly or via [`CoordinationConfig::default`] plus the `with_*`
/// builder methods.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Maximum number of attempts any single agent may take before it is forced
    /// into `failed`/`completed` without further restarts. Default: 3.
    pub max_attempts: u32,

    /// Per-attempt soft timeout. An attempt exceeding this converts to
    /// cancellation + `timeout` status. Default: 120s.
    pub attempt_timeout: Duration,

    /// Per-run hard wall-clock timeout that forces termination regardless of
    /// vote/answer state.
    pub run_timeout: Duration,

    /// Self-voting policy (see [`SelfVotePolicy`]).
    pub self_vote_policy: SelfVotePolicy,

    /// Root directory under which all agent working directories, snapshot
    /// directories, and temporary peer views are created. Must be absolute;
    /// enforced by [`crate::workspace::WorkspacePath`].
    pub workspace_root: PathBuf,

    /// Root directory for the per-run `session/<timestamp>/` artefact tree
    /// (event log, per-agent answer files, final presentation).
    pub session_root: PathBuf,
}

impl Default for CoordinationConfig {
    /// Defaults: 3 attempts per agent, a 120s per-attempt timeout, a 30 minute
    /// run-wide timeout, self-voting allowed, and `./massgen_workspaces` /
    /// `./massgen_sessions` as the working roots.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(30 * 60),
            self_vote_policy: SelfVotePolicy::Allowed,
            workspace_root: PathBuf::from("massgen_workspaces"),
            session_root: PathBuf::from("massgen_sessions"),
        }
    }
}

impl CoordinationConfig {
    /// Override the per-agent attempt budget (builder pattern).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the per-attempt soft timeout (builder pattern).
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Override the run-wide hard timeout (builder pattern).
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Override the self-voting policy (builder pattern).
    pub fn with_self_vote_policy(mut self, policy: SelfVotePolicy) -> Self {
        self.self_vote_policy = policy;
        self
    }

    /// Override the workspace root directory (builder pattern).
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Override the session artefact root directory (builder pattern).
    pub fn with_session_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.session_root = root.into();
        self
    }
}
