//! Shared state & event bus.
//!
//! Implemented as a single-writer actor: an event loop task owns the one
//! [`SharedState`] and applies [`BusRequest`]s received over an `mpsc` channel in
//! arrival order, replying through a `oneshot` channel per request, rather than
//! a lock-based design — though a `tokio::sync::RwLock<SharedState>` would
//! satisfy the same observable contract.
//!
//! Every committed transition additionally publishes the corresponding
//! [`CoordinationEvent`] on a `broadcast` channel so the (read-only)
//! [`crate::tracker::CoordinationTracker`] can observe it without ever being able
//! to block the bus — a lagging or panicking subscriber only misses events, it
//! never stalls a writer.

use crate::coordination_event::CoordinationEvent;
use crate::error::CoordinationError;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Lifecycle status of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Working,
    Voted,
    Answered,
    Restarting,
    Completed,
    Failed,
    TimedOut,
}

/// A committed vote: who it targets and the stated reason.
#[derive(Debug, Clone)]
pub struct Vote {
    pub target_anon_id: String,
    pub reason: String,
}

/// Per-agent process-local state, mutated only via bus transitions.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub status: AgentStatus,
    pub current_answer: Option<String>,
    pub answer_version: u64,
    pub vote: Option<Vote>,
    pub has_voted: bool,
    pub has_answered: bool,
    pub restart_count: u32,
    pub attempts_remaining: u32,
    /// Global context version at which `current_answer` was last committed.
    /// Used for the tie-break rule in winner selection.
    pub last_answer_committed_at_version: Option<u64>,
}

impl AgentState {
    fn new(max_attempts: u32) -> Self {
        Self {
            status: AgentStatus::Idle,
            current_answer: None,
            answer_version: 0,
            vote: None,
            has_voted: false,
            has_answered: false,
            restart_count: 0,
            attempts_remaining: max_attempts,
            last_answer_committed_at_version: None,
        }
    }
}

/// Run-wide coordination phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Coordinating,
    Selecting,
    Presenting,
    Done,
    Aborted,
}

/// A read-only, point-in-time copy of [`SharedState`] used by the orchestrator to
/// evaluate the termination rule and winner selection (§4.3.4)
/// without holding up the bus.
#[derive(Debug, Clone)]
pub struct SharedStateSnapshot {
    pub agents: Vec<(String, AgentState)>,
    pub global_context_version: u64,
    pub final_winner: Option<String>,
    pub phase: Phase,
}

impl SharedStateSnapshot {
    /// `Active = {x : status(x) not in {failed, timeout}}`.
    pub fn active(&self) -> impl Iterator<Item = &(String, AgentState)> {
        self.agents
            .iter()
            .filter(|(_, s)| !matches!(s.status, AgentStatus::Failed | AgentStatus::TimedOut))
    }

    pub fn voted_active(&self) -> impl Iterator<Item = &(String, AgentState)> {
        self.active().filter(|(_, s)| s.has_voted)
    }

    pub fn answered_active(&self) -> impl Iterator<Item = &(String, AgentState)> {
        self.active().filter(|(_, s)| s.has_answered)
    }
}

/// Full coordination state for one run. Owned exclusively by the bus
/// event loop; never accessed from more than one task at a time.
struct SharedState {
    agents: HashMap<String, AgentState>,
    order: Vec<String>,
    global_context_version: u64,
    final_winner: Option<String>,
    phase: Phase,
}

impl SharedState {
    fn new(anon_ids: &[String], max_attempts: u32) -> Self {
        let mut agents = HashMap::with_capacity(anon_ids.len());
        for anon_id in anon_ids {
            agents.insert(anon_id.clone(), AgentState::new(max_attempts));
        }
        Self {
            agents,
            order: anon_ids.to_vec(),
            global_context_version: 0,
            final_winner: None,
            phase: Phase::Coordinating,
        }
    }

    fn snapshot(&self) -> SharedStateSnapshot {
        SharedStateSnapshot {
            agents: self
                .order
                .iter()
                .map(|id| (id.clone(), self.agents[id].clone()))
                .collect(),
            global_context_version: self.global_context_version,
            final_winner: self.final_winner.clone(),
            phase: self.phase,
        }
    }
}

enum BusRequest {
    SnapshotPeerAnswers {
        for_anon_id: String,
        reply: oneshot::Sender<HashMap<String, (String, u64)>>,
    },
    CommitNewAnswer {
        anon_id: String,
        text: String,
        reply: oneshot::Sender<Result<(bool, u64), CoordinationError>>,
    },
    CommitVote {
        voter_anon: String,
        target_anon: String,
        reason: String,
        self_vote_forbidden: bool,
        reply: oneshot::Sender<Result<bool, CoordinationError>>,
    },
    ClearVoteOnRestart {
        anon_id: String,
        reply: oneshot::Sender<()>,
    },
    MarkStatus {
        anon_id: String,
        status: AgentStatus,
        reply: oneshot::Sender<()>,
    },
    DecrementAttempts {
        anon_id: String,
        reply: oneshot::Sender<Option<u32>>,
    },
    SetPhase {
        phase: Phase,
        reply: oneshot::Sender<()>,
    },
    SetFinalWinner {
        anon_id: String,
        reply: oneshot::Sender<()>,
    },
    SetFallbackAnswer {
        anon_id: String,
        text: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SharedStateSnapshot>,
    },
    PublishEvent {
        event: CoordinationEvent,
        reply: oneshot::Sender<()>,
    },
}

/// A cheaply-clonable handle to the shared-state bus. Every method sends one
/// request and awaits its reply; callers never touch [`SharedState`] directly.
#[derive(Clone)]
pub struct SharedStateHandle {
    tx: mpsc::UnboundedSender<BusRequest>,
    events: broadcast::Sender<CoordinationEvent>,
}

impl SharedStateHandle {
    /// Spawn the bus event loop and return a handle to it plus a broadcast
    /// receiver the caller can hand to a [`crate::tracker::CoordinationTracker`].
    pub fn spawn(
        anon_ids: &[String],
        max_attempts: u32,
    ) -> (Self, broadcast::Receiver<CoordinationEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusRequest>();
        let (events_tx, events_rx) = broadcast::channel(1024);
        let mut state = SharedState::new(anon_ids, max_attempts);
        let events_tx_loop = events_tx.clone();

        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                Self::apply(&mut state, req, &events_tx_loop);
            }
        });

        (
            Self {
                tx,
                events: events_tx,
            },
            events_rx,
        )
    }

    fn publish(events: &broadcast::Sender<CoordinationEvent>, event: CoordinationEvent) {
        // A broadcast channel with no subscribers errors on send; that's fine,
        // the tracker is optional and the bus must never depend on it.
        let _ = events.send(event);
    }

    fn apply(state: &mut SharedState, req: BusRequest, events: &broadcast::Sender<CoordinationEvent>) {
        match req {
            BusRequest::SnapshotPeerAnswers { for_anon_id, reply } => {
                let mut out = HashMap::new();
                for id in &state.order {
                    if id == &for_anon_id {
                        continue;
                    }
                    let agent = &state.agents[id];
                    if agent.has_answered {
                        if let Some(answer) = &agent.current_answer {
                            out.insert(id.clone(), (answer.clone(), agent.answer_version));
                        }
                    }
                }
                let _ = reply.send(out);
            }

            BusRequest::CommitNewAnswer {
                anon_id,
                text,
                reply,
            } => {
                if state.phase != Phase::Coordinating {
                    let _ = reply.send(Ok((false, state.global_context_version)));
                    return;
                }
                let Some(agent) = state.agents.get_mut(&anon_id) else {
                    let _ = reply.send(Err(CoordinationError::InvalidTransition {
                        anon_id: anon_id.clone(),
                        detail: "unknown anon id".to_string(),
                    }));
                    return;
                };

                agent.current_answer = Some(text.clone());
                agent.answer_version += 1;
                state.global_context_version += 1;
                agent.has_answered = true;
                agent.vote = None;
                agent.has_voted = false;
                agent.status = AgentStatus::Answered;
                agent.last_answer_committed_at_version = Some(state.global_context_version);

                let new_version = state.global_context_version;
                let answer_version = agent.answer_version;

                Self::publish(
                    events,
                    CoordinationEvent::agent_new_answer(&anon_id, &text, answer_version, new_version),
                );
                Self::publish(events, CoordinationEvent::context_shared(&anon_id, new_version));

                let _ = reply.send(Ok((true, new_version)));
            }

            BusRequest::CommitVote {
                voter_anon,
                target_anon,
                reason,
                self_vote_forbidden,
                reply,
            } => {
                if state.phase != Phase::Coordinating {
                    let _ = reply.send(Ok(false));
                    return;
                }
                if !state.agents.contains_key(&target_anon) {
                    let _ = reply.send(Err(CoordinationError::InvalidTransition {
                        anon_id: voter_anon,
                        detail: format!("vote target '{}' is not a valid anon id", target_anon),
                    }));
                    return;
                }
                if self_vote_forbidden && target_anon == voter_anon {
                    let _ = reply.send(Err(CoordinationError::InvalidTransition {
                        anon_id: voter_anon,
                        detail: "self-voting is forbidden by configuration".to_string(),
                    }));
                    return;
                }
                let Some(agent) = state.agents.get_mut(&voter_anon) else {
                    let _ = reply.send(Err(CoordinationError::InvalidTransition {
                        anon_id: voter_anon,
                        detail: "unknown anon id".to_string(),
                    }));
                    return;
                };

                agent.vote = Some(Vote {
                    target_anon_id: target_anon.clone(),
                    reason: reason.clone(),
                });
                agent.has_voted = true;
                agent.status = AgentStatus::Voted;

                Self::publish(
                    events,
                    CoordinationEvent::agent_vote_cast(&voter_anon, &target_anon, &reason),
                );

                let _ = reply.send(Ok(true));
            }

            BusRequest::ClearVoteOnRestart { anon_id, reply } => {
                if let Some(agent) = state.agents.get_mut(&anon_id) {
                    agent.vote = None;
                    agent.has_voted = false;
                }
                let _ = reply.send(());
            }

            BusRequest::MarkStatus {
                anon_id,
                status,
                reply,
            } => {
                if let Some(agent) = state.agents.get_mut(&anon_id) {
                    agent.status = status;
                }
                let _ = reply.send(());
            }

            BusRequest::DecrementAttempts { anon_id, reply } => {
                // Check `attempts_remaining > 0` *before* consuming this
                // restart, not after: an agent with exactly one attempt left
                // still gets to take it. `None` means the budget was already
                // spent and the caller should complete, not restart.
                let consumed = if let Some(agent) = state.agents.get_mut(&anon_id) {
                    if agent.attempts_remaining > 0 {
                        agent.attempts_remaining -= 1;
                        agent.restart_count += 1;
                        Some(agent.attempts_remaining)
                    } else {
                        None
                    }
                } else {
                    None
                };
                let _ = reply.send(consumed);
            }

            BusRequest::SetPhase { phase, reply } => {
                state.phase = phase;
                let _ = reply.send(());
            }

            BusRequest::SetFinalWinner { anon_id, reply } => {
                state.final_winner = Some(anon_id);
                let _ = reply.send(());
            }

            BusRequest::SetFallbackAnswer { anon_id, text, reply } => {
                // working --backend done, no workflow call--> completed (answer=last
                // content if none set): fills in a best-effort answer without the
                // version bump / restart cascade a real `new_answer` commit triggers.
                if let Some(agent) = state.agents.get_mut(&anon_id) {
                    if agent.current_answer.is_none() {
                        agent.current_answer = Some(text);
                        agent.has_answered = true;
                        agent.answer_version = 1;
                    }
                    agent.status = AgentStatus::Completed;
                }
                let _ = reply.send(());
            }

            BusRequest::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }

            BusRequest::PublishEvent { event, reply } => {
                Self::publish(events, event);
                let _ = reply.send(());
            }
        }
    }

    /// `snapshot_peer_answers(for_anon_id)`: every other agent's
    /// current answer, keyed by anon id, for agents that have answered.
    pub async fn snapshot_peer_answers(&self, for_anon_id: &str) -> HashMap<String, (String, u64)> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::SnapshotPeerAnswers {
            for_anon_id: for_anon_id.to_string(),
            reply,
        });
        rx.await.unwrap_or_default()
    }

    /// `commit_new_answer(anon_id, text)`.
    pub async fn commit_new_answer(
        &self,
        anon_id: &str,
        text: String,
    ) -> Result<(bool, u64), CoordinationError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::CommitNewAnswer {
            anon_id: anon_id.to_string(),
            text,
            reply,
        });
        rx.await.map_err(|_| CoordinationError::InvalidTransition {
            anon_id: anon_id.to_string(),
            detail: "bus closed".to_string(),
        })?
    }

    /// `commit_vote(voter_anon, target_anon, reason)`.
    pub async fn commit_vote(
        &self,
        voter_anon: &str,
        target_anon: &str,
        reason: String,
        self_vote_forbidden: bool,
    ) -> Result<bool, CoordinationError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::CommitVote {
            voter_anon: voter_anon.to_string(),
            target_anon: target_anon.to_string(),
            reason,
            self_vote_forbidden,
            reply,
        });
        rx.await.map_err(|_| CoordinationError::InvalidTransition {
            anon_id: voter_anon.to_string(),
            detail: "bus closed".to_string(),
        })?
    }

    /// `clear_vote_on_restart(anon_id)`. Emits no event of its own —
    /// the `agent_restart` event implies it.
    pub async fn clear_vote_on_restart(&self, anon_id: &str) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::ClearVoteOnRestart {
            anon_id: anon_id.to_string(),
            reply,
        });
        let _ = rx.await;
    }

    /// `mark_status(anon_id, status)`. Callers are expected to only
    /// request transitions permitted by the state machine in §4.2; this is an
    /// internal bookkeeping call, not a user-facing fallible operation.
    pub async fn mark_status(&self, anon_id: &str, status: AgentStatus) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::MarkStatus {
            anon_id: anon_id.to_string(),
            status,
            reply,
        });
        let _ = rx.await;
    }

    /// Try to consume one restart attempt for `anon_id`.
    /// Returns `Some(remaining)` after decrementing if a restart was granted,
    /// or `None` if the budget was already at zero, in which case the caller
    /// must complete the agent instead of restarting it.
    pub async fn decrement_attempts(&self, anon_id: &str) -> Option<u32> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::DecrementAttempts {
            anon_id: anon_id.to_string(),
            reply,
        });
        rx.await.unwrap_or(None)
    }

    pub async fn set_phase(&self, phase: Phase) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::SetPhase { phase, reply });
        let _ = rx.await;
    }

    pub async fn set_final_winner(&self, anon_id: &str) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::SetFinalWinner {
            anon_id: anon_id.to_string(),
            reply,
        });
        let _ = rx.await;
    }

    /// A read-only point-in-time copy of the full state.
    pub async fn snapshot(&self) -> SharedStateSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::Snapshot { reply });
        rx.await.expect("shared state bus task must not exit while handles are live")
    }

    /// Subscribe another broadcast receiver to the event stream (e.g. for a
    /// second tracker or an artefact writer).
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.events.subscribe()
    }

    /// Fill in a best-effort answer from the last content chunk when an attempt
    /// ends with no workflow call ever committed.
    pub async fn set_fallback_answer(&self, anon_id: &str, text: String) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::SetFallbackAnswer {
            anon_id: anon_id.to_string(),
            text,
            reply,
        });
        let _ = rx.await;
    }

    /// Publish an orchestrator-level lifecycle event (`coordination_start`,
    /// `agent_start`, `agent_restart`, `restart_triggered`, `context_received`,
    /// `consensus_reached`, `agent_completed`, `agent_timeout`, `agent_failed`,
    /// `coordination_end`) through the bus, so it is placed in the same total
    /// order as every state-mutating transition.
    pub async fn publish_event(&self, event: CoordinationEvent) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::PublishEvent { event, reply });
        let _ = rx.await;
    }
}

/// Reconstruct a [`SharedStateSnapshot`] by replaying an event log against an
/// empty state — the event stream is complete with respect to state. Used for
/// offline inspection of a persisted `events.json`, never by the live bus.
pub fn replay(anon_ids: &[String], max_attempts: u32, events: &[CoordinationEvent]) -> SharedStateSnapshot {
    use crate::coordination_event::CoordinationEventType as T;

    let mut state = SharedState::new(anon_ids, max_attempts);

    for event in events {
        match event.event_type {
            T::AgentNewAnswer => {
                let Some(anon_id) = &event.agent_id else { continue };
                let Some(details) = &event.details else { continue };
                let (Some(text), Some(version), Some(global_version)) = (
                    details.get("text").and_then(|v| v.as_str()),
                    details.get("version").and_then(|v| v.as_u64()),
                    details.get("global_version").and_then(|v| v.as_u64()),
                ) else {
                    continue;
                };
                if let Some(agent) = state.agents.get_mut(anon_id) {
                    agent.current_answer = Some(text.to_string());
                    agent.answer_version = version;
                    agent.has_answered = true;
                    agent.vote = None;
                    agent.has_voted = false;
                    agent.status = AgentStatus::Answered;
                    agent.last_answer_committed_at_version = Some(global_version);
                }
                state.global_context_version = state.global_context_version.max(global_version);
            }
            T::AgentVoteCast => {
                let Some(anon_id) = &event.agent_id else { continue };
                let Some(details) = &event.details else { continue };
                let (Some(target), Some(reason)) = (
                    details.get("target").and_then(|v| v.as_str()),
                    details.get("reason").and_then(|v| v.as_str()),
                ) else {
                    continue;
                };
                if let Some(agent) = state.agents.get_mut(anon_id) {
                    agent.vote = Some(Vote {
                        target_anon_id: target.to_string(),
                        reason: reason.to_string(),
                    });
                    agent.has_voted = true;
                    agent.status = AgentStatus::Voted;
                }
            }
            T::AgentRestart => {
                let Some(anon_id) = &event.agent_id else { continue };
                let Some(details) = &event.details else { continue };
                if let Some(agent) = state.agents.get_mut(anon_id) {
                    agent.vote = None;
                    agent.has_voted = false;
                    agent.restart_count += 1;
                    if let Some(remaining) = details.get("attempts_remaining").and_then(|v| v.as_u64()) {
                        agent.attempts_remaining = remaining as u32;
                    }
                }
            }
            T::AgentCompleted => {
                if let Some(anon_id) = &event.agent_id {
                    if let Some(agent) = state.agents.get_mut(anon_id) {
                        agent.status = AgentStatus::Completed;
                    }
                }
            }
            T::AgentTimeout => {
                if let Some(anon_id) = &event.agent_id {
                    if let Some(agent) = state.agents.get_mut(anon_id) {
                        agent.status = AgentStatus::TimedOut;
                    }
                }
            }
            T::AgentFailed => {
                if let Some(anon_id) = &event.agent_id {
                    if let Some(agent) = state.agents.get_mut(anon_id) {
                        agent.status = AgentStatus::Failed;
                    }
                }
            }
            T::ConsensusReached => {
                state.final_winner = event.agent_id.clone();
            }
            _ => {}
        }
    }

    state.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("agent{}", i)).collect()
    }

    #[tokio::test]
    async fn commit_new_answer_increments_versions_and_clears_vote() {
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(2), 3);

        bus.commit_vote("agent1", "agent2", "pending".into(), false)
            .await
            .unwrap();

        let (accepted, global_version) = bus.commit_new_answer("agent1", "42".into()).await.unwrap();
        assert!(accepted);
        assert_eq!(global_version, 1);

        let snap = bus.snapshot().await;
        let agent1 = snap.agents.iter().find(|(id, _)| id == "agent1").unwrap();
        assert_eq!(agent1.1.current_answer.as_deref(), Some("42"));
        assert_eq!(agent1.1.answer_version, 1);
        assert!(!agent1.1.has_voted);
        assert!(agent1.1.vote.is_none());
    }

    #[tokio::test]
    async fn snapshot_peer_answers_excludes_self_and_unanswered() {
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(3), 3);
        bus.commit_new_answer("agent1", "a1".into()).await.unwrap();

        let peers = bus.snapshot_peer_answers("agent1").await;
        assert!(!peers.contains_key("agent1"));
        assert!(!peers.contains_key("agent2"));

        let peers_for_2 = bus.snapshot_peer_answers("agent2").await;
        assert_eq!(peers_for_2.get("agent1"), Some(&("a1".to_string(), 1)));
    }

    #[tokio::test]
    async fn vote_for_unknown_target_is_rejected() {
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(2), 3);
        let result = bus
            .commit_vote("agent1", "agent99", "nope".into(), false)
            .await;
        assert!(matches!(result, Err(CoordinationError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn self_vote_forbidden_rejects_self_target() {
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(2), 3);
        let result = bus
            .commit_vote("agent1", "agent1", "i like mine".into(), true)
            .await;
        assert!(matches!(result, Err(CoordinationError::InvalidTransition { .. })));

        let ok = bus
            .commit_vote("agent1", "agent1", "i like mine".into(), false)
            .await;
        assert!(matches!(ok, Ok(true)));
    }

    #[tokio::test]
    async fn concurrent_commits_serialize_to_one_consistent_state() {
        // Concurrent interleavings of commit_new_answer / commit_vote against N
        // agents must always produce the same final state as some serialization.
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(4), 5);

        let mut handles = Vec::new();
        for i in 1..=4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let anon = format!("agent{}", i);
                bus.commit_new_answer(&anon, format!("answer-{}", i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = bus.snapshot().await;
        assert_eq!(snap.global_context_version, 4);
        assert_eq!(snap.answered_active().count(), 4);
        // Every agent committed exactly once -> versions 1..=4 appear exactly once.
        let mut committed_versions: Vec<u64> = snap
            .agents
            .iter()
            .filter_map(|(_, s)| s.last_answer_committed_at_version)
            .collect();
        committed_versions.sort_unstable();
        assert_eq!(committed_versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn restart_barrier_preserves_peer_answer_until_superseded() {
        // Once agent1 commits "v1" at global version v, every subsequent peer
        // snapshot must observe (v1, v) until a later new_answer by agent1
        // replaces it.
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(2), 3);

        let (_, v) = bus.commit_new_answer("agent1", "v1".into()).await.unwrap();
        let peers = bus.snapshot_peer_answers("agent2").await;
        assert_eq!(peers.get("agent1"), Some(&("v1".to_string(), v)));

        // A peer restart observing this same version must see the identical pair.
        let peers_again = bus.snapshot_peer_answers("agent2").await;
        assert_eq!(peers_again.get("agent1"), Some(&("v1".to_string(), v)));

        // A later new_answer supersedes it.
        let (_, v2) = bus.commit_new_answer("agent1", "v2".into()).await.unwrap();
        assert!(v2 > v);
        let peers_after = bus.snapshot_peer_answers("agent2").await;
        assert_eq!(peers_after.get("agent1"), Some(&("v2".to_string(), v2)));
    }

    #[tokio::test]
    async fn vote_is_cleared_on_restart_and_not_reinstated() {
        // After clear_vote_on_restart(x), x has no vote until it commits a fresh
        // one (or a fresh new_answer) in a later attempt.
        let (bus, _events) = SharedStateHandle::spawn(&anon_ids(2), 3);

        bus.commit_vote("agent2", "agent1", "looks right".into(), false)
            .await
            .unwrap();
        assert!(bus.snapshot().await.agents.iter().any(|(id, s)| id == "agent2" && s.has_voted));

        bus.clear_vote_on_restart("agent2").await;

        let snap = bus.snapshot().await;
        let agent2 = snap.agents.iter().find(|(id, _)| id == "agent2").unwrap();
        assert!(!agent2.1.has_voted);
        assert!(agent2.1.vote.is_none());
    }

    #[tokio::test]
    async fn replay_reconstructs_state_from_event_log() {
        // Applying the serialised event log to an empty SharedState must
        // reconstruct the state the log described.
        let (bus, mut events_rx) = SharedStateHandle::spawn(&anon_ids(2), 3);
        bus.commit_new_answer("agent1", "42".into()).await.unwrap();
        bus.commit_vote("agent2", "agent1", "agree".into(), false)
            .await
            .unwrap();

        let live_snapshot = bus.snapshot().await;

        let mut log = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            log.push(event);
        }

        let replayed = replay(&anon_ids(2), 3, &log);
        let live_agent1 = live_snapshot.agents.iter().find(|(id, _)| id == "agent1").unwrap();
        let replayed_agent1 = replayed.agents.iter().find(|(id, _)| id == "agent1").unwrap();
        assert_eq!(replayed_agent1.1.current_answer, live_agent1.1.current_answer);
        assert_eq!(replayed_agent1.1.answer_version, live_agent1.1.answer_version);

        let replayed_agent2 = replayed.agents.iter().find(|(id, _)| id == "agent2").unwrap();
        assert!(replayed_agent2.1.has_voted);
        assert_eq!(replayed_agent2.1.vote.as_ref().unwrap().target_anon_id, "agent1");
    }
}
