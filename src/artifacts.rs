//! Persisted coordination artefacts.
//!
//! Writes the output-only artefact tree under `session/<timestamp>/`: the
//! global and per-agent event projections, every committed answer verbatim,
//! and the human-readable timeline. Snapshot tees are written directly by
//! [`crate::workspace::WorkspaceManager::snapshot`]; this module only handles
//! the event/answer/timeline side. Nothing here is ever read back for a
//! control decision within the same run.

use crate::coordination_event::{CoordinationEvent, CoordinationEventType};
use crate::identity::AnonRegistry;
use crate::tracker::CoordinationTracker;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct ArtifactWriter {
    session_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    /// Write every persisted artefact from a finished tracker.
    /// `final_presentation`, if given, is the presenter's verbatim output,
    /// stored as `<winner_anon_id>.final.txt`.
    pub async fn write_all(
        &self,
        tracker: &CoordinationTracker,
        registry: &AnonRegistry,
        final_presentation: Option<(&str, &str)>,
    ) -> io::Result<()> {
        fs::create_dir_all(&self.session_dir).await?;

        self.write_events_json(tracker.global_timeline()).await?;
        for anon_id in registry.anon_ids() {
            self.write_agent_events_json(anon_id, tracker.per_agent_timeline(anon_id)).await?;
        }
        self.write_answers(tracker.global_timeline()).await?;
        if let Some((winner_anon_id, text)) = final_presentation {
            self.write_final_answer(winner_anon_id, text).await?;
        }
        self.write_timeline(&tracker.render_timeline()).await?;

        Ok(())
    }

    async fn write_events_json(&self, events: &[CoordinationEvent]) -> io::Result<()> {
        write_ndjson(&self.session_dir.join("events.json"), events).await
    }

    async fn write_agent_events_json(&self, anon_id: &str, events: &[CoordinationEvent]) -> io::Result<()> {
        write_ndjson(&self.session_dir.join(format!("events_{}.json", anon_id)), events).await
    }

    /// `answers/<anon_id>.<k>.txt` for every committed `new_answer`, `k` being
    /// the 1-based `answer_version` carried in the event's details.
    async fn write_answers(&self, events: &[CoordinationEvent]) -> io::Result<()> {
        let answers_dir = self.session_dir.join("answers");
        fs::create_dir_all(&answers_dir).await?;

        for event in events {
            if event.event_type != CoordinationEventType::AgentNewAnswer {
                continue;
            }
            let Some(anon_id) = &event.agent_id else { continue };
            let Some(details) = &event.details else { continue };
            let (Some(text), Some(version)) = (
                details.get("text").and_then(|v| v.as_str()),
                details.get("version").and_then(|v| v.as_u64()),
            ) else {
                continue;
            };
            let path = answers_dir.join(format!("{}.{}.txt", anon_id, version));
            fs::write(path, text).await?;
        }

        Ok(())
    }

    async fn write_final_answer(&self, winner_anon_id: &str, text: &str) -> io::Result<()> {
        let answers_dir = self.session_dir.join("answers");
        fs::create_dir_all(&answers_dir).await?;
        fs::write(answers_dir.join(format!("{}.final.txt", winner_anon_id)), text).await
    }

    async fn write_timeline(&self, rendered: &str) -> io::Result<()> {
        fs::write(self.session_dir.join("timeline.txt"), rendered).await
    }
}

async fn write_ndjson(path: &Path, events: &[CoordinationEvent]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    for event in events {
        let line = serde_json::to_string(event).unwrap_or_default();
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_events_answers_and_timeline() {
        let dir = tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());

        let mut tracker = CoordinationTracker::new();
        tracker.record(CoordinationEvent::agent_new_answer("agent1", "42", 1, 1));
        tracker.record(CoordinationEvent::consensus_reached("agent1", "majority"));

        let registry = AnonRegistry::new(&["a".to_string()]);
        writer
            .write_all(&tracker, &registry, Some(("agent1", "The answer is 42.")))
            .await
            .unwrap();

        assert!(fs::try_exists(dir.path().join("events.json")).await.unwrap());
        assert!(fs::try_exists(dir.path().join("events_agent1.json")).await.unwrap());
        assert!(fs::try_exists(dir.path().join("answers").join("agent1.1.txt")).await.unwrap());
        assert!(fs::try_exists(dir.path().join("answers").join("agent1.final.txt")).await.unwrap());
        assert!(fs::try_exists(dir.path().join("timeline.txt")).await.unwrap());

        let answer = fs::read_to_string(dir.path().join("answers").join("agent1.1.txt"))
            .await
            .unwrap();
        assert_eq!(answer, "42");
    }
}
