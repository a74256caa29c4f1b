//! End-to-end coordination scenarios, driven against a scripted
//! `Backend` double instead of a real LLM.

mod common;

use common::{content_chunk, new_answer_chunk, vote_chunk, Script, ScriptedBackend};
use massgen_core::error::AbortReason;
use massgen_core::stream_chunk::{Backend, StreamChunk};
use massgen_core::{CoordinationConfig, Orchestrator, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config(workspace_root: &std::path::Path, session_root: &std::path::Path) -> CoordinationConfig {
    CoordinationConfig::default()
        .with_max_attempts(3)
        .with_attempt_timeout(Duration::from_secs(5))
        .with_run_timeout(Duration::from_secs(5))
        .with_workspace_root(workspace_root.to_path_buf())
        .with_session_root(session_root.to_path_buf())
}

/// Scenario 1: two agents, unanimous vote after one answer.
#[tokio::test]
async fn two_agents_unanimous_vote_after_one_answer() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-a",
        vec![Script::Chunks(vec![
            new_answer_chunk("4"),
            vote_chunk("agent1", "correct"),
            StreamChunk::Done,
        ])],
    )) as Arc<dyn Backend>;

    let agent2 = Arc::new(ScriptedBackend::new(
        "backend-b",
        vec![
            // Attempt 1: restarted by agent1's new_answer before producing anything useful.
            Script::Pending,
            // Attempt 2 (post-restart): sees agent1's "4" and agrees.
            Script::Chunks(vec![vote_chunk("agent1", "agree"), StreamChunk::Done]),
        ],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(
        config(workspace.path(), session.path()),
        vec!["a1".to_string(), "a2".to_string()],
        vec![agent1, agent2],
    );

    let outcome = orchestrator.run("2+2?").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, presentation } => {
            assert_eq!(final_winner, "agent1");
            assert!(!presentation.is_empty());
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Scenario 2: restart cascade with attempt exhaustion (N=3, max_attempts=2).
#[tokio::test]
async fn restart_cascade_with_attempt_exhaustion() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    // agent1: answers "A1" once, then (after being restarted by agent2) has no
    // more attempts (max_attempts=2, already used its one attempt) and is
    // force-completed retaining "A1".
    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![new_answer_chunk("A1"), StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    // agent2: first attempt pending (restarted by agent1's answer), second
    // attempt answers "A2" then votes for itself.
    let agent2 = Arc::new(ScriptedBackend::new(
        "backend-2",
        vec![
            Script::Pending,
            Script::Chunks(vec![
                new_answer_chunk("A2"),
                vote_chunk("agent2", "mine is better"),
                StreamChunk::Done,
            ]),
        ],
    )) as Arc<dyn Backend>;

    // agent3: first attempt pending (restarted by agent1), second attempt
    // (restarted again by agent2) votes for agent2.
    let agent3 = Arc::new(ScriptedBackend::new(
        "backend-3",
        vec![
            Script::Pending,
            Script::Pending,
            Script::Chunks(vec![vote_chunk("agent2", "agree"), StreamChunk::Done]),
        ],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(
        config(workspace.path(), session.path()).with_max_attempts(2),
        vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
        vec![agent1, agent2, agent3],
    );

    let outcome = orchestrator.run("pick the best answer").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, .. } => {
            assert_eq!(final_winner, "agent2");
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Scenario 3: vote for an absent target is rejected; the voter continues and
/// later wins once it answers and its peer votes for it.
#[tokio::test]
async fn vote_for_absent_target_is_rejected_then_voter_wins() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![
            vote_chunk("agent3", "nonexistent target"),
            content_chunk("reconsidering"),
            new_answer_chunk("X"),
            StreamChunk::Done,
        ])],
    )) as Arc<dyn Backend>;

    let agent2 = Arc::new(ScriptedBackend::new(
        "backend-2",
        vec![Script::Pending, Script::Chunks(vec![vote_chunk("agent1", "agree"), StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(
        config(workspace.path(), session.path()),
        vec!["a1".to_string(), "a2".to_string()],
        vec![agent1, agent2],
    );

    let outcome = orchestrator.run("task").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, .. } => assert_eq!(final_winner, "agent1"),
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Scenario 4: hard timeout with no answers ever committed.
#[tokio::test]
async fn hard_timeout_with_no_answers_aborts() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new("backend-1", vec![Script::Pending])) as Arc<dyn Backend>;
    let agent2 = Arc::new(ScriptedBackend::new("backend-2", vec![Script::Pending])) as Arc<dyn Backend>;

    let cfg = config(workspace.path(), session.path())
        .with_run_timeout(Duration::from_millis(200))
        .with_attempt_timeout(Duration::from_secs(60));

    let orchestrator = Orchestrator::new(cfg, vec!["a1".to_string(), "a2".to_string()], vec![agent1, agent2]);

    let outcome = orchestrator.run("unanswerable").await.unwrap();
    match outcome {
        RunOutcome::Aborted { reason } => assert_eq!(reason, AbortReason::NoAnswers),
        other => panic!("expected Aborted, got {:?}", other),
    }
}

/// Scenario 5: tie broken by earliest answer (N=3).
#[tokio::test]
async fn tie_broken_by_earliest_answer() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    // agent1 answers first (global version 1), then votes for itself.
    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![
            new_answer_chunk("a1"),
            vote_chunk("agent1", "mine"),
            StreamChunk::Done,
        ])],
    )) as Arc<dyn Backend>;

    // agent2 answers second (global version 2), then votes for agent1 (self tally=1, agent1 tally=2).
    let agent2 = Arc::new(ScriptedBackend::new(
        "backend-2",
        vec![
            Script::Pending,
            Script::Chunks(vec![new_answer_chunk("a2"), vote_chunk("agent1", "self-aware"), StreamChunk::Done]),
        ],
    )) as Arc<dyn Backend>;

    // agent3 votes for agent2 once both have answered.
    let agent3 = Arc::new(ScriptedBackend::new(
        "backend-3",
        vec![Script::Pending, Script::Pending, Script::Chunks(vec![vote_chunk("agent2", "liked it"), StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(
        config(workspace.path(), session.path()).with_max_attempts(4),
        vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
        vec![agent1, agent2, agent3],
    );

    let outcome = orchestrator.run("tie task").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, .. } => assert_eq!(final_winner, "agent1"),
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Boundary: N=1 — no restarts are possible, and a single agent's first
/// committed answer (with no peer to vote) is the winner via fallback
/// selection, since no votes are ever cast.
#[tokio::test]
async fn single_agent_run_has_no_restarts_and_wins_by_fallback() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-solo",
        vec![Script::Chunks(vec![new_answer_chunk("solo answer"), StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(config(workspace.path(), session.path()), vec!["a1".to_string()], vec![agent1]);

    let outcome = orchestrator.run("solo task").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, presentation } => {
            assert_eq!(final_winner, "agent1");
            assert!(!presentation.is_empty());
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Boundary: max_attempts=1 — a peer with exactly one attempt left still gets
/// to take it when restarted, but has no budget left for a second restart.
#[tokio::test]
async fn max_attempts_one_grants_exactly_one_restart_then_completes() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![new_answer_chunk("fast answer"), vote_chunk("agent1", "mine"), StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    // agent2's first attempt is cancelled by agent1's restart signal, but its
    // attempts_remaining (1) was never consumed yet, so the restart is granted:
    // its second (and last, since max_attempts=1) attempt runs and, finding
    // nothing more to add, ends without a workflow call.
    let agent2 = Arc::new(ScriptedBackend::new(
        "backend-2",
        vec![Script::Pending, Script::Chunks(vec![StreamChunk::Done])],
    )) as Arc<dyn Backend>;

    let cfg = config(workspace.path(), session.path()).with_max_attempts(1);
    let orchestrator = Orchestrator::new(cfg, vec!["a1".to_string(), "a2".to_string()], vec![agent1, agent2]);

    let outcome = orchestrator.run("fast task").await.unwrap();
    match outcome {
        // agent2 never votes, so the active set never reaches unanimous
        // agreement; termination instead fires once agent2 completes with its
        // single restart attempt spent.
        RunOutcome::Done { final_winner, .. } => assert_eq!(final_winner, "agent1"),
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Same-kind repeats within an attempt (a refining second `new_answer`) are
/// both allowed to commit — only a *different*-kind call in the same
/// `tool_calls` batch is dropped by the tie-break rule.
#[tokio::test]
async fn second_new_answer_in_same_attempt_refines_the_first() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();

    let agent1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![
            new_answer_chunk("draft"),
            new_answer_chunk("final"),
            vote_chunk("agent1", "settled"),
            StreamChunk::Done,
        ])],
    )) as Arc<dyn Backend>;

    let orchestrator = Orchestrator::new(config(workspace.path(), session.path()), vec!["a1".to_string()], vec![agent1]);

    let outcome = orchestrator.run("refine task").await.unwrap();
    match outcome {
        RunOutcome::Done { final_winner, presentation } => {
            assert_eq!(final_winner, "agent1");
            assert!(presentation.contains("final") || !presentation.is_empty());
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

/// Across a run with N agents and max_attempts=k, the total number of
/// attempts launched is bounded by N * k, even under a full restart cascade.
#[tokio::test]
async fn total_attempts_launched_is_bounded_by_n_times_max_attempts() {
    let workspace = tempdir().unwrap();
    let session = tempdir().unwrap();
    const N: usize = 3;
    const K: u32 = 2;

    let backend1 = Arc::new(ScriptedBackend::new(
        "backend-1",
        vec![Script::Chunks(vec![new_answer_chunk("A1"), StreamChunk::Done])],
    ));
    let backend2 = Arc::new(ScriptedBackend::new(
        "backend-2",
        vec![
            Script::Pending,
            Script::Chunks(vec![new_answer_chunk("A2"), vote_chunk("agent2", "mine"), StreamChunk::Done]),
        ],
    ));
    let backend3 = Arc::new(ScriptedBackend::new(
        "backend-3",
        vec![Script::Pending, Script::Pending, Script::Chunks(vec![vote_chunk("agent2", "agree"), StreamChunk::Done])],
    ));

    let orchestrator = Orchestrator::new(
        config(workspace.path(), session.path()).with_max_attempts(K),
        vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
        vec![backend1.clone() as Arc<dyn Backend>, backend2.clone() as Arc<dyn Backend>, backend3.clone() as Arc<dyn Backend>],
    );

    let outcome = orchestrator.run("bounded task").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Done { .. }));

    let total_attempts = backend1.attempts_launched() + backend2.attempts_launched() + backend3.attempts_launched();
    assert!(
        total_attempts <= N * K as usize,
        "total attempts {} exceeded N*k = {}",
        total_attempts,
        N * K as usize
    );
}
