//! Append-only coordination event log entries.
//!
//! One `enum` per event kind, each variant carrying exactly the fields
//! relevant to it, rather than a single struct with a pile of `Option` fields.
//! `details` is kept as a `serde_json::Value` escape hatch for the tracker's
//! free-form rendering, but every event kind gets a typed constructor here so
//! callers never hand-build JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One entry in the append-only coordination event log.
///
/// Events are written in the order their causing transition is committed by the
/// shared-state bus; the log is never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: CoordinationEventType,
    pub agent_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// The fixed vocabulary of coordination event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationEventType {
    CoordinationStart,
    CoordinationEnd,
    AgentStart,
    AgentRestart,
    AgentAnswering,
    AgentVoting,
    AgentNewAnswer,
    AgentVoteCast,
    ContextShared,
    ContextReceived,
    RestartTriggered,
    ConsensusReached,
    AgentCompleted,
    AgentTimeout,
    AgentFailed,
}

impl CoordinationEvent {
    fn now(event_type: CoordinationEventType, agent_id: Option<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            agent_id,
            details,
        }
    }

    pub fn coordination_start(agent_count: usize) -> Self {
        Self::now(
            CoordinationEventType::CoordinationStart,
            None,
            Some(json!({ "agent_count": agent_count })),
        )
    }

    pub fn coordination_end(reason: &str) -> Self {
        Self::now(
            CoordinationEventType::CoordinationEnd,
            None,
            Some(json!({ "reason": reason })),
        )
    }

    pub fn agent_start(anon_id: &str, attempt_no: u32) -> Self {
        Self::now(
            CoordinationEventType::AgentStart,
            Some(anon_id.to_string()),
            Some(json!({ "attempt_no": attempt_no })),
        )
    }

    pub fn agent_restart(anon_id: &str, attempts_remaining: u32, trigger_version: u64) -> Self {
        Self::now(
            CoordinationEventType::AgentRestart,
            Some(anon_id.to_string()),
            Some(json!({
                "attempts_remaining": attempts_remaining,
                "trigger_version": trigger_version,
            })),
        )
    }

    pub fn agent_answering(anon_id: &str) -> Self {
        Self::now(CoordinationEventType::AgentAnswering, Some(anon_id.to_string()), None)
    }

    pub fn agent_voting(anon_id: &str) -> Self {
        Self::now(CoordinationEventType::AgentVoting, Some(anon_id.to_string()), None)
    }

    /// `text` is carried in full (not just the version numbers) so the event
    /// log is complete w.r.t. state: replaying it into an empty `SharedState`
    /// must reconstruct `current_answer`, not just version counters.
    pub fn agent_new_answer(anon_id: &str, text: &str, version: u64, global_version: u64) -> Self {
        Self::now(
            CoordinationEventType::AgentNewAnswer,
            Some(anon_id.to_string()),
            Some(json!({ "text": text, "version": version, "global_version": global_version })),
        )
    }

    pub fn agent_vote_cast(anon_id: &str, target_anon_id: &str, reason: &str) -> Self {
        Self::now(
            CoordinationEventType::AgentVoteCast,
            Some(anon_id.to_string()),
            Some(json!({ "target": target_anon_id, "reason": reason })),
        )
    }

    pub fn context_shared(anon_id: &str, global_version: u64) -> Self {
        Self::now(
            CoordinationEventType::ContextShared,
            Some(anon_id.to_string()),
            Some(json!({ "global_version": global_version })),
        )
    }

    pub fn context_received(anon_id: &str, peer_count: usize) -> Self {
        Self::now(
            CoordinationEventType::ContextReceived,
            Some(anon_id.to_string()),
            Some(json!({ "peer_count": peer_count })),
        )
    }

    pub fn restart_triggered(cause_anon_id: &str, affected: &[String], version: u64) -> Self {
        Self::now(
            CoordinationEventType::RestartTriggered,
            Some(cause_anon_id.to_string()),
            Some(json!({ "affected": affected, "version": version })),
        )
    }

    pub fn consensus_reached(winner_anon_id: &str, rule: &str) -> Self {
        Self::now(
            CoordinationEventType::ConsensusReached,
            Some(winner_anon_id.to_string()),
            Some(json!({ "rule": rule })),
        )
    }

    pub fn agent_completed(anon_id: &str) -> Self {
        Self::now(CoordinationEventType::AgentCompleted, Some(anon_id.to_string()), None)
    }

    pub fn agent_timeout(anon_id: &str) -> Self {
        Self::now(CoordinationEventType::AgentTimeout, Some(anon_id.to_string()), None)
    }

    pub fn agent_failed(anon_id: &str, detail: &str) -> Self {
        Self::now(
            CoordinationEventType::AgentFailed,
            Some(anon_id.to_string()),
            Some(json!({ "detail": detail })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let event = CoordinationEvent::agent_vote_cast("agent1", "agent2", "clear and correct");
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: CoordinationEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event_type, CoordinationEventType::AgentVoteCast);
        assert_eq!(decoded.agent_id.as_deref(), Some("agent1"));
    }
}
