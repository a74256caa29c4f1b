//! Coordination tracker.
//!
//! A pure read-side observer of the shared-state bus's event broadcast. Builds
//! per-agent timelines and a global timeline for debugging/offline inspection; it
//! is never consulted for control decisions. A tracker failure (e.g. a panic in
//! whatever consumes [`CoordinationTracker::summary`]) cannot affect coordination
//! because the bus only ever `broadcast::send`s events and never awaits a
//! tracker response.

use crate::coordination_event::{CoordinationEvent, CoordinationEventType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Aggregate statistics for one agent across a run.
#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    pub answers_committed: usize,
    pub votes_cast: usize,
    pub restarts: usize,
    pub timed_out: bool,
    pub failed: bool,
}

/// Summary produced at the end of a run.
#[derive(Debug, Clone)]
pub struct CoordinationSummary {
    pub duration: chrono::Duration,
    pub total_events: usize,
    pub total_restarts: usize,
    pub final_winner: Option<String>,
    pub per_agent_stats: HashMap<String, AgentStats>,
}

/// Appends every event it observes to an in-memory global timeline and a
/// per-agent projection, mirroring the `events.json` / `events_<anon_id>.json`
/// split persisted by [`crate::artifacts`].
pub struct CoordinationTracker {
    started_at: DateTime<Utc>,
    global_timeline: Vec<CoordinationEvent>,
    per_agent_timeline: HashMap<String, Vec<CoordinationEvent>>,
    final_winner: Option<String>,
}

impl CoordinationTracker {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            global_timeline: Vec::new(),
            per_agent_timeline: HashMap::new(),
            final_winner: None,
        }
    }

    /// Record one event into the global and (if it has an `agent_id`) per-agent
    /// timeline. Idempotent w.r.t. ordering: events must be fed in commit order,
    /// which the bus already guarantees by construction.
    pub fn record(&mut self, event: CoordinationEvent) {
        if event.event_type == CoordinationEventType::ConsensusReached {
            self.final_winner = event.agent_id.clone();
        }
        if let Some(agent_id) = &event.agent_id {
            self.per_agent_timeline
                .entry(agent_id.clone())
                .or_default()
                .push(event.clone());
        }
        self.global_timeline.push(event);
    }

    /// Drive this tracker from a broadcast receiver until the channel closes
    /// (the bus task exits) or a `coordination_end` event is observed.
    pub async fn run(mut self, mut events: broadcast::Receiver<CoordinationEvent>) -> Self {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let is_end = event.event_type == CoordinationEventType::CoordinationEnd;
                    self.record(event);
                    if is_end {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // A lagging tracker must never block the bus; it just loses
                    // the missed events and keeps going.
                    continue;
                }
            }
        }
        self
    }

    /// `summary()`.
    pub fn summary(&self) -> CoordinationSummary {
        let mut per_agent_stats: HashMap<String, AgentStats> = HashMap::new();
        let mut total_restarts = 0;

        for event in &self.global_timeline {
            let Some(agent_id) = &event.agent_id else {
                continue;
            };
            let stats = per_agent_stats.entry(agent_id.clone()).or_default();
            match event.event_type {
                CoordinationEventType::AgentNewAnswer => stats.answers_committed += 1,
                CoordinationEventType::AgentVoteCast => stats.votes_cast += 1,
                CoordinationEventType::AgentRestart => {
                    stats.restarts += 1;
                    total_restarts += 1;
                }
                CoordinationEventType::AgentTimeout => stats.timed_out = true,
                CoordinationEventType::AgentFailed => stats.failed = true,
                _ => {}
            }
        }

        let ended_at = self
            .global_timeline
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(self.started_at);

        CoordinationSummary {
            duration: ended_at - self.started_at,
            total_events: self.global_timeline.len(),
            total_restarts,
            final_winner: self.final_winner.clone(),
            per_agent_stats,
        }
    }

    /// Render a human-readable timeline, matching the `timeline.txt` artefact
    /// written by [`crate::artifacts`] — rendered from events, never consulted
    /// as input.
    pub fn render_timeline(&self) -> String {
        let mut out = String::new();
        for event in &self.global_timeline {
            let who = event.agent_id.as_deref().unwrap_or("-");
            out.push_str(&format!(
                "{} [{}] {:?} {}\n",
                event.timestamp.to_rfc3339(),
                who,
                event.event_type,
                event
                    .details
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            ));
        }
        out
    }

    pub fn global_timeline(&self) -> &[CoordinationEvent] {
        &self.global_timeline
    }

    pub fn per_agent_timeline(&self, anon_id: &str) -> &[CoordinationEvent] {
        self.per_agent_timeline
            .get(anon_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for CoordinationTracker {
    fn default() -> Self {
        Self::new()
    }
}
