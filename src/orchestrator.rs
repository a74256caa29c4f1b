//! The orchestrator: lifecycle of a whole run.
//!
//! Spawns one [`AgentRunner`] per agent, multiplexes their chunk streams and
//! `RunnerSignal`/`AttemptDone` control events through a single loop, applies
//! the restart-on-new-answer protocol, evaluates the termination rule, and
//! drives final presentation. The loop itself is the "single-threaded
//! coordination loop" the concurrency model requires: every
//! `SharedState` mutation this module performs is a bus call, so the bus
//! remains the single writer even though this loop reacts to events from many
//! concurrently-running agents.

use crate::agent_runner::{AgentRunner, AttemptOutcome, RunnerSignal};
use crate::config::{CoordinationConfig, SelfVotePolicy};
use crate::coordination_event::CoordinationEvent;
use crate::error::{AbortReason, CoordinationError};
use crate::identity::AnonRegistry;
use crate::prompt::{PeerAnswer, PromptBuilder};
use crate::shared_state::{AgentStatus, Phase, SharedStateHandle, SharedStateSnapshot};
use crate::stream_chunk::Backend;
use crate::tracker::CoordinationTracker;
use crate::workspace::WorkspaceManager;
use chrono::Utc;
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Done {
        final_winner: String,
        presentation: String,
    },
    Aborted {
        reason: AbortReason,
    },
}

enum TerminationCause {
    UnanimousVote,
    AttemptsExhausted,
    WallClockElapsed,
}

struct AttemptDone {
    anon_id: String,
    outcome: AttemptOutcome,
}

/// Drives one coordination run from spawn to final presentation.
pub struct Orchestrator {
    config: CoordinationConfig,
    registry: AnonRegistry,
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl Orchestrator {
    /// `agent_ids` and `backends` must be the same length and in the same
    /// declaration order; `agent_ids[i]`'s backend is `backends[i]`.
    pub fn new(config: CoordinationConfig, agent_ids: Vec<String>, backends: Vec<Arc<dyn Backend>>) -> Self {
        let registry = AnonRegistry::new(&agent_ids);
        let mut backend_map = HashMap::with_capacity(backends.len());
        for (agent_id, backend) in agent_ids.iter().zip(backends.into_iter()) {
            let anon_id = registry.anon_id(agent_id).expect("anon id just assigned").to_string();
            backend_map.insert(anon_id, backend);
        }
        Self {
            config,
            registry,
            backends: backend_map,
        }
    }

    pub async fn run(&self, task: &str) -> Result<RunOutcome, CoordinationError> {
        let anon_ids = self.registry.anon_ids().to_vec();
        let (shared, events_rx) = SharedStateHandle::spawn(&anon_ids, self.config.max_attempts);
        let workspace = Arc::new(WorkspaceManager::new(
            self.config.workspace_root.clone(),
            self.config.session_root.clone(),
        ));

        let tracker_handle = tokio::spawn(CoordinationTracker::new().run(events_rx));

        shared.publish_event(CoordinationEvent::coordination_start(anon_ids.len())).await;

        let allow_self_vote = self.config.self_vote_policy == SelfVotePolicy::Allowed;
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<RunnerSignal>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<AttemptDone>();

        let mut cancel_tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut attempt_no: HashMap<String, u32> = HashMap::new();
        let mut latest_snapshot: HashMap<String, PathBuf> = HashMap::new();

        // A workspace safety violation is fatal: the whole body below runs to
        // completion via `?` so that either path still reaches the shared
        // coordination_end/cleanup/artefact-writing tail exactly once.
        let outcome: Result<RunOutcome, CoordinationError> = async {
            for anon_id in &anon_ids {
                attempt_no.insert(anon_id.clone(), 1);
                self.spawn_attempt(
                    anon_id,
                    1,
                    task,
                    allow_self_vote,
                    &shared,
                    &workspace,
                    &mut cancel_tokens,
                    &signal_tx,
                    &done_tx,
                )
                .await?;
            }

            let run_deadline = tokio::time::Instant::now() + self.config.run_timeout;
            let cause = loop {
                tokio::select! {
                    biased;

                    _ = tokio::time::sleep_until(run_deadline) => {
                        break TerminationCause::WallClockElapsed;
                    }

                    Some(signal) = signal_rx.recv() => {
                        self.handle_signal(
                            signal,
                            task,
                            allow_self_vote,
                            &shared,
                            &workspace,
                            &mut cancel_tokens,
                            &mut attempt_no,
                            &mut latest_snapshot,
                            &signal_tx,
                            &done_tx,
                        ).await?;
                    }

                    Some(done) = done_rx.recv() => {
                        self.handle_attempt_done(
                            done,
                            task,
                            allow_self_vote,
                            &shared,
                            &workspace,
                            &mut cancel_tokens,
                            &mut attempt_no,
                            &signal_tx,
                            &done_tx,
                        ).await?;
                    }
                }

                if let Some(cause) = self.check_termination(&shared.snapshot().await) {
                    break cause;
                }
            };

            shared.set_phase(Phase::Selecting).await;
            let snapshot = shared.snapshot().await;

            self.select_winner_and_present(
                cause,
                task,
                &snapshot,
                &shared,
                &workspace,
                &mut cancel_tokens,
                &latest_snapshot,
            )
            .await
        }
        .await;

        let reason = match &outcome {
            Ok(RunOutcome::Done { .. }) => "done".to_string(),
            Ok(RunOutcome::Aborted { reason }) => reason.to_string(),
            Err(e) => e.to_string(),
        };
        shared.publish_event(CoordinationEvent::coordination_end(&reason)).await;
        workspace.cleanup(&anon_ids).await;

        if let Ok(tracker) = tracker_handle.await {
            let session_dir = self
                .config
                .session_root
                .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
            let writer = crate::artifacts::ArtifactWriter::new(session_dir);
            let final_presentation = match &outcome {
                Ok(RunOutcome::Done { final_winner, presentation }) => {
                    Some((final_winner.as_str(), presentation.as_str()))
                }
                _ => None,
            };
            if let Err(e) = writer.write_all(&tracker, &self.registry, final_presentation).await {
                warn!("failed to write coordination artefacts: {}", e);
            }
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_attempt(
        &self,
        anon_id: &str,
        attempt: u32,
        task: &str,
        allow_self_vote: bool,
        shared: &SharedStateHandle,
        workspace: &Arc<WorkspaceManager>,
        cancel_tokens: &mut HashMap<String, CancellationToken>,
        signal_tx: &mpsc::UnboundedSender<RunnerSignal>,
        done_tx: &mpsc::UnboundedSender<AttemptDone>,
    ) -> Result<(), CoordinationError> {
        shared.publish_event(CoordinationEvent::agent_start(anon_id, attempt)).await;

        let token = CancellationToken::new();
        cancel_tokens.insert(anon_id.to_string(), token.clone());

        workspace.prepare_workspace(anon_id).await?;

        let peers = shared.snapshot_peer_answers(anon_id).await;
        shared
            .publish_event(CoordinationEvent::context_received(anon_id, peers.len()))
            .await;

        let peer_ids: Vec<String> = self
            .registry
            .anon_ids()
            .iter()
            .filter(|id| id.as_str() != anon_id)
            .cloned()
            .collect();
        let peer_answers: Vec<PeerAnswer> = peers
            .into_iter()
            .map(|(anon, (text, _version))| PeerAnswer { anon_id: anon, text })
            .collect();

        let builder = PromptBuilder::new(task, anon_id, peer_ids, allow_self_vote);
        let messages = builder.build_messages(&peer_answers);
        let tools = builder.workflow_tools();

        let Some(backend) = self.backends.get(anon_id).cloned() else {
            warn!("{}: no backend registered", anon_id);
            return Ok(());
        };

        let runner = AgentRunner::new(
            anon_id.to_string(),
            backend,
            shared.clone(),
            workspace.clone(),
            !allow_self_vote,
            signal_tx.clone(),
        );

        let attempt_timeout = self.config.attempt_timeout;
        let anon_id_owned = anon_id.to_string();
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let outcome = runner
                .run_attempt(&messages, &tools, token, attempt_timeout, None)
                .await;
            let _ = done_tx.send(AttemptDone {
                anon_id: anon_id_owned,
                outcome,
            });
        });

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_signal(
        &self,
        signal: RunnerSignal,
        task: &str,
        allow_self_vote: bool,
        shared: &SharedStateHandle,
        workspace: &Arc<WorkspaceManager>,
        cancel_tokens: &mut HashMap<String, CancellationToken>,
        attempt_no: &mut HashMap<String, u32>,
        latest_snapshot: &mut HashMap<String, PathBuf>,
        signal_tx: &mpsc::UnboundedSender<RunnerSignal>,
        done_tx: &mpsc::UnboundedSender<AttemptDone>,
    ) -> Result<(), CoordinationError> {
        match signal {
            RunnerSignal::VoteCommitted { .. } => {
                // No state action beyond what the bus already applied; the main
                // loop re-checks termination after every event.
            }
            RunnerSignal::NewAnswerCommitted { anon_id: a, global_version: v } => {
                let snapshot = shared.snapshot().await;

                // Stale-signal guard: a broader restart at a later
                // version has already superseded this one.
                if snapshot.global_context_version > v {
                    info!("{}: new_answer at v{} superseded, skipping restart cascade", a, v);
                    return Ok(());
                }

                let affected: Vec<String> = snapshot
                    .agents
                    .iter()
                    .filter(|(id, s)| {
                        id != &a && !matches!(s.status, AgentStatus::Completed | AgentStatus::Failed | AgentStatus::TimedOut)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();

                if affected.is_empty() {
                    return Ok(());
                }

                shared
                    .publish_event(CoordinationEvent::restart_triggered(&a, &affected, v))
                    .await;

                for x in &affected {
                    if let Some(token) = cancel_tokens.get(x) {
                        token.cancel();
                    }
                }

                // Read-before-write barrier: a's snapshot must land before any
                // restarted peer is allowed to start its next attempt.
                let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
                let path = workspace.snapshot(&a, &timestamp).await?;
                latest_snapshot.insert(a.clone(), path);

                for x in &affected {
                    if let Some(remaining) = shared.decrement_attempts(x).await {
                        shared.clear_vote_on_restart(x).await;
                        shared
                            .publish_event(CoordinationEvent::agent_restart(x, remaining, v))
                            .await;
                        shared.mark_status(x, AgentStatus::Restarting).await;

                        let next_attempt = attempt_no.get(x).copied().unwrap_or(1) + 1;
                        attempt_no.insert(x.clone(), next_attempt);
                        self.spawn_attempt(
                            x,
                            next_attempt,
                            task,
                            allow_self_vote,
                            shared,
                            workspace,
                            cancel_tokens,
                            signal_tx,
                            done_tx,
                        )
                        .await?;
                    } else {
                        shared.mark_status(x, AgentStatus::Completed).await;
                        shared.publish_event(CoordinationEvent::agent_completed(x)).await;
                    }
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_attempt_done(
        &self,
        done: AttemptDone,
        task: &str,
        allow_self_vote: bool,
        shared: &SharedStateHandle,
        workspace: &Arc<WorkspaceManager>,
        cancel_tokens: &mut HashMap<String, CancellationToken>,
        attempt_no: &mut HashMap<String, u32>,
        signal_tx: &mpsc::UnboundedSender<RunnerSignal>,
        done_tx: &mpsc::UnboundedSender<AttemptDone>,
    ) -> Result<(), CoordinationError> {
        let anon_id = done.anon_id;
        match done.outcome {
            AttemptOutcome::CompletedWithAnswer => {
                // A workflow call already moved this agent to `answered`/`voted`
                // via the bus; nothing further to do until a restart or
                // termination decides its fate.
            }
            AttemptOutcome::CompletedWithoutAnswer { last_content } => {
                if let Some(text) = last_content {
                    shared.set_fallback_answer(&anon_id, text).await;
                } else {
                    shared.mark_status(&anon_id, AgentStatus::Completed).await;
                }
                shared.publish_event(CoordinationEvent::agent_completed(&anon_id)).await;
            }
            AttemptOutcome::Failed(e) => {
                if let Some(remaining) = shared.decrement_attempts(&anon_id).await {
                    shared.clear_vote_on_restart(&anon_id).await;
                    let snapshot = shared.snapshot().await;
                    shared
                        .publish_event(CoordinationEvent::agent_restart(
                            &anon_id,
                            remaining,
                            snapshot.global_context_version,
                        ))
                        .await;
                    shared.mark_status(&anon_id, AgentStatus::Restarting).await;

                    let next_attempt = attempt_no.get(&anon_id).copied().unwrap_or(1) + 1;
                    attempt_no.insert(anon_id.clone(), next_attempt);
                    self.spawn_attempt(
                        &anon_id,
                        next_attempt,
                        task,
                        allow_self_vote,
                        shared,
                        workspace,
                        cancel_tokens,
                        signal_tx,
                        done_tx,
                    )
                    .await?;
                } else {
                    shared.mark_status(&anon_id, AgentStatus::Failed).await;
                    shared
                        .publish_event(CoordinationEvent::agent_failed(&anon_id, &e.to_string()))
                        .await;
                }
            }
            AttemptOutcome::TimedOut => {
                shared.mark_status(&anon_id, AgentStatus::TimedOut).await;
                shared.publish_event(CoordinationEvent::agent_timeout(&anon_id)).await;
            }
            AttemptOutcome::Cancelled => {
                // Cancellation is issued either by the restart protocol (which
                // already schedules whatever comes next for this agent) or by
                // the final-presentation cutover (which no longer cares).
            }
        }

        Ok(())
    }

    /// Evaluate the termination rule. The wall-clock cause is handled
    /// by the caller's `sleep_until` branch, not here.
    fn check_termination(&self, snapshot: &SharedStateSnapshot) -> Option<TerminationCause> {
        let active: Vec<_> = snapshot.active().collect();
        if active.is_empty() {
            return Some(TerminationCause::AttemptsExhausted);
        }

        let voted = active.iter().filter(|(_, s)| s.has_voted).count();
        if voted == active.len() {
            return Some(TerminationCause::UnanimousVote);
        }

        if active.iter().all(|(_, s)| s.attempts_remaining == 0) {
            return Some(TerminationCause::AttemptsExhausted);
        }

        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn select_winner_and_present(
        &self,
        cause: TerminationCause,
        task: &str,
        snapshot: &SharedStateSnapshot,
        shared: &SharedStateHandle,
        workspace: &Arc<WorkspaceManager>,
        cancel_tokens: &mut HashMap<String, CancellationToken>,
        latest_snapshot: &HashMap<String, PathBuf>,
    ) -> Result<RunOutcome, CoordinationError> {
        let winner = self.select_winner(snapshot);

        let Some((winner_anon_id, rule)) = winner else {
            let reason = match cause {
                TerminationCause::WallClockElapsed => AbortReason::HardTimeout,
                _ => {
                    let all_failed = snapshot
                        .agents
                        .iter()
                        .all(|(_, s)| matches!(s.status, AgentStatus::Failed | AgentStatus::TimedOut));
                    if all_failed {
                        AbortReason::AllAgentsFailed
                    } else {
                        AbortReason::NoAnswers
                    }
                }
            };
            shared.set_phase(Phase::Aborted).await;
            return Ok(RunOutcome::Aborted { reason });
        };

        shared.publish_event(CoordinationEvent::consensus_reached(&winner_anon_id, rule)).await;
        shared.set_final_winner(&winner_anon_id).await;
        shared.set_phase(Phase::Presenting).await;

        for (anon_id, token) in cancel_tokens.iter() {
            if anon_id != &winner_anon_id {
                token.cancel();
            }
        }

        let peer_answers: Vec<PeerAnswer> = snapshot
            .answered_active()
            .map(|(anon, state)| PeerAnswer {
                anon_id: anon.clone(),
                text: state.current_answer.clone().unwrap_or_default(),
            })
            .collect();

        let Some(backend) = self.backends.get(&winner_anon_id).cloned() else {
            return Err(CoordinationError::NoViableWinner);
        };

        if backend.get_filesystem_support() != crate::stream_chunk::FilesystemSupport::None {
            let snapshots: Vec<(String, PathBuf)> = latest_snapshot
                .iter()
                .map(|(id, path)| (id.clone(), path.clone()))
                .collect();
            workspace.materialise_peer_view(&winner_anon_id, &snapshots).await?;
        }

        let message = PromptBuilder::presentation_message(task, &peer_answers);
        let stream_result = backend.stream(&[message], &[]).await;
        let mut stream = match stream_result {
            Ok(s) => s,
            Err(e) => {
                return Err(CoordinationError::BackendStreamError {
                    anon_id: winner_anon_id,
                    detail: e.to_string(),
                })
            }
        };

        use crate::stream_chunk::StreamChunk;
        use futures_util::StreamExt;

        let mut presentation = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Content { text } => presentation.push_str(&text),
                StreamChunk::CompleteMessage { message } => {
                    if let Some(content) = message.content {
                        presentation.push_str(&content);
                    }
                }
                StreamChunk::Error { error } => {
                    shared.set_phase(Phase::Aborted).await;
                    return Err(CoordinationError::BackendStreamError {
                        anon_id: winner_anon_id,
                        detail: error,
                    });
                }
                StreamChunk::Done => break,
                _ => {}
            }
        }

        shared.set_phase(Phase::Done).await;
        Ok(RunOutcome::Done {
            final_winner: winner_anon_id,
            presentation,
        })
    }

    /// Winner selection rule, returning `(winner_anon_id, rule_name)`.
    fn select_winner(&self, snapshot: &SharedStateSnapshot) -> Option<(String, &'static str)> {
        let voted_active: Vec<_> = snapshot.voted_active().collect();

        if !voted_active.is_empty() {
            let mut tally: HashMap<&str, u32> = HashMap::new();
            for (_, state) in &voted_active {
                if let Some(vote) = &state.vote {
                    *tally.entry(vote.target_anon_id.as_str()).or_insert(0) += 1;
                }
            }

            let max_votes = *tally.values().max().unwrap();
            let candidates: Vec<&str> = tally
                .iter()
                .filter(|(_, &count)| count == max_votes)
                .map(|(&target, _)| target)
                .collect();

            let winner = candidates
                .into_iter()
                .min_by_key(|target| {
                    let agent = snapshot.agents.iter().find(|(id, _)| id.as_str() == *target);
                    match agent {
                        Some((id, state)) => (
                            !state.has_answered, // false (answered) sorts before true
                            state.last_answer_committed_at_version.unwrap_or(u64::MAX),
                            self.registry.anon_ids().iter().position(|x| x == id).unwrap_or(usize::MAX),
                        ),
                        None => (true, u64::MAX, usize::MAX),
                    }
                })
                .map(|s| s.to_string());

            return winner.map(|w| (w, "majority_vote"));
        }

        snapshot
            .answered_active()
            .min_by_key(|(id, _)| self.registry.anon_ids().iter().position(|x| x == id).unwrap_or(usize::MAX))
            .map(|(id, _)| (id.clone(), "fallback_lowest_ordinal"))
    }
}
