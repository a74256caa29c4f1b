//! System/user message construction for one attempt.
//!
//! Kept as a free function plus a small builder rather than a trait: there is
//! exactly one way the core talks to a backend, and plain string concatenation
//! is all that's needed here.

use crate::stream_chunk::{BackendMessage, BackendRole, ToolSchema};
use serde_json::json;

/// One peer's latest committed answer, as known at attempt-build time.
pub struct PeerAnswer {
    pub anon_id: String,
    pub text: String,
}

/// Builds the logical message sequence and tool schemas for one agent's attempt.
pub struct PromptBuilder {
    pub task: String,
    pub self_anon_id: String,
    pub peer_anon_ids: Vec<String>,
    pub allow_self_vote: bool,
}

impl PromptBuilder {
    pub fn new(task: impl Into<String>, self_anon_id: impl Into<String>, peer_anon_ids: Vec<String>, allow_self_vote: bool) -> Self {
        Self {
            task: task.into(),
            self_anon_id: self_anon_id.into(),
            peer_anon_ids,
            allow_self_vote,
        }
    }

    /// Build the system message: task, identity, peer-answer table, and the
    /// usage grammar for `new_answer`/`vote`.
    pub fn system_message(&self, peer_answers: &[PeerAnswer]) -> BackendMessage {
        let mut content = String::new();
        content.push_str(&format!(
            "You are {}, one of several independent agents collaborating on this task:\n\n{}\n\n",
            self.self_anon_id, self.task
        ));

        if peer_answers.is_empty() {
            content.push_str("No peer has committed an answer yet.\n\n");
        } else {
            content.push_str("Peer answers committed so far:\n");
            for peer in peer_answers {
                content.push_str(&format!("- {}: {}\n", peer.anon_id, peer.text));
            }
            content.push('\n');
        }

        let vote_targets = self.valid_vote_targets();
        content.push_str(
            "You may call two workflow tools at any point in your response. If your \
             backend cannot accept tool declarations for this turn, emit the call instead \
             as the last fenced block in your content, exactly in this form:\n\n\
             ```json\n{\"tool_name\": \"new_answer\", \"arguments\": {\"content\": \"...\"}}\n```\n\n\
             or\n\n\
             ```json\n{\"tool_name\": \"vote\", \"arguments\": {\"agent_id\": \"...\", \"reason\": \"...\"}}\n```\n\n",
        );
        content.push_str(&format!(
            "`new_answer(content: string)` commits a new answer for you. `vote(agent_id, reason)` \
             casts your vote for the best answer seen so far; valid `agent_id` values are: {}.\n",
            vote_targets.join(", ")
        ));

        BackendMessage {
            role: BackendRole::System,
            content,
        }
    }

    fn valid_vote_targets(&self) -> Vec<String> {
        let mut targets = self.peer_anon_ids.clone();
        if self.allow_self_vote {
            targets.push(self.self_anon_id.clone());
        }
        targets.sort();
        targets
    }

    /// The current user turn. Prior outer-conversation turns,
    /// if any, are the caller's responsibility to prepend — this core is not
    /// itself a multi-turn chat session.
    pub fn user_message(&self) -> BackendMessage {
        BackendMessage {
            role: BackendRole::User,
            content: self.task.clone(),
        }
    }

    /// Build the full message sequence for one attempt.
    pub fn build_messages(&self, peer_answers: &[PeerAnswer]) -> Vec<BackendMessage> {
        vec![self.system_message(peer_answers), self.user_message()]
    }

    /// The two workflow tool schemas, advertised whenever the backend accepts
    /// native tool declarations.
    pub fn workflow_tools(&self) -> Vec<ToolSchema> {
        let vote_targets = self.valid_vote_targets();
        vec![
            ToolSchema {
                name: "new_answer".to_string(),
                description: "Commit a new candidate answer for this task.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": { "content": { "type": "string" } },
                    "required": ["content"],
                }),
            },
            ToolSchema {
                name: "vote".to_string(),
                description: "Cast a vote for the best answer committed so far.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "string", "enum": vote_targets },
                        "reason": { "type": "string" },
                    },
                    "required": ["agent_id"],
                }),
            },
        ]
    }

    /// Build the final-presentation user message: "present the
    /// final answer" embedding every peer's latest answer, sent to the winner's
    /// backend without the workflow tools enabled.
    pub fn presentation_message(task: &str, peer_answers: &[PeerAnswer]) -> BackendMessage {
        let mut content = format!(
            "Present the final answer to this task:\n\n{}\n\nYour own answer and your peers' \
             answers, for reference:\n",
            task
        );
        for peer in peer_answers {
            content.push_str(&format!("- {}: {}\n", peer.anon_id, peer.text));
        }
        BackendMessage {
            role: BackendRole::User,
            content,
        }
    }
}
