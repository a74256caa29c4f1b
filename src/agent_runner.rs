//! Per-agent state machine.
//!
//! Drives one agent through one attempt, translates workflow tool calls
//! (`new_answer`, `vote`) into shared-state transitions, and enforces the
//! per-attempt soft timeout. Control flow is expressed with an explicit
//! [`AttemptOutcome`] result type rather than exceptions, per the Design Notes:
//! "each `run_attempt` returns one of `{CompletedWithAnswer,
//! CompletedWithoutAnswer, Failed{kind}, Cancelled, TimedOut}`; the orchestrator
//! switches on that."

use crate::error::CoordinationError;
use crate::shared_state::{AgentStatus, SharedStateHandle};
use crate::stream_chunk::{Backend, BackendMessage, StreamChunk, ToolCallRequest, ToolSchema};
use crate::workspace::WorkspaceManager;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The two logical tools the core understands, regardless of the backend-specific
/// wire form they arrived in (native `tool_calls` or a fenced JSON block in
/// `content`) — spec §4.2, Design Notes "Dynamic tool-call shape".
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCall {
    NewAnswer { text: String },
    Vote { target_anon_id: String, reason: String },
}

/// Notifies the orchestrator the instant a workflow call commits, so the
/// restart-on-new-answer protocol and the termination rule
/// (§4.3.3) can react without waiting for the whole attempt to finish.
#[derive(Debug, Clone)]
pub enum RunnerSignal {
    NewAnswerCommitted { anon_id: String, global_version: u64 },
    VoteCommitted { anon_id: String },
}

/// The result of one `run_attempt` call.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The backend finished (`done`) having committed at least one answer this
    /// attempt, or having committed a vote (voting implies the attempt's purpose
    /// was served even without a fresh answer).
    CompletedWithAnswer,
    /// The backend finished (`done`) with no workflow call having been committed;
    /// the runner falls back to using the last content chunk as the answer only
    /// if the orchestrator later needs one (e.g. the N=1 boundary case).
    CompletedWithoutAnswer { last_content: Option<String> },
    /// The backend reported an error, or the transport broke.
    Failed(CoordinationError),
    /// Cancelled by the orchestrator (restart or final-presentation cutover).
    Cancelled,
    /// The per-attempt soft timeout elapsed before a terminal chunk arrived.
    TimedOut,
}

/// Extract a workflow call encoded as a fenced ` ```json ` block in free-form
/// content: "scan accumulated content for a fenced json block
/// containing `{"tool_name": ..., "arguments": ...}` and treat the *last* such
/// block as authoritative." Used by backends that cannot natively combine
/// provider-builtin tools with function declarations.
pub fn extract_json_block_call(accumulated_content: &str) -> Option<WorkflowCall> {
    const FENCE_OPEN: &str = "```json";
    const FENCE_CLOSE: &str = "```";

    let mut last_call = None;
    let mut search_from = 0;

    while let Some(start) = accumulated_content[search_from..].find(FENCE_OPEN) {
        let body_start = search_from + start + FENCE_OPEN.len();
        let Some(end_rel) = accumulated_content[body_start..].find(FENCE_CLOSE) else {
            break;
        };
        let body = &accumulated_content[body_start..body_start + end_rel];
        search_from = body_start + end_rel + FENCE_CLOSE.len();

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body.trim()) {
            if let Some(call) = workflow_call_from_json(&value) {
                last_call = Some(call);
            }
        }
    }

    last_call
}

fn workflow_call_from_json(value: &serde_json::Value) -> Option<WorkflowCall> {
    let tool_name = value.get("tool_name")?.as_str()?;
    let arguments = value.get("arguments")?;
    workflow_call_from_name_and_args(tool_name, arguments)
}

fn workflow_call_from_name_and_args(
    tool_name: &str,
    arguments: &serde_json::Value,
) -> Option<WorkflowCall> {
    match tool_name {
        "new_answer" => {
            let text = arguments.get("content")?.as_str()?.to_string();
            Some(WorkflowCall::NewAnswer { text })
        }
        "vote" => {
            let target_anon_id = arguments.get("agent_id")?.as_str()?.to_string();
            let reason = arguments
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(WorkflowCall::Vote {
                target_anon_id,
                reason,
            })
        }
        _ => None,
    }
}

/// Recognise a workflow call from a native tool call, if `call.name` is one of
/// the two logical tools. Non-workflow tool calls return `None` and are
/// forwarded untouched by the caller.
pub fn workflow_call_from_native(call: &ToolCallRequest) -> Option<WorkflowCall> {
    workflow_call_from_name_and_args(&call.name, &call.arguments)
}

/// Drives one agent's attempts. Cheap to clone: the heavy state lives behind
/// `Arc`s shared with the orchestrator.
pub struct AgentRunner {
    pub anon_id: String,
    backend: Arc<dyn Backend>,
    shared: SharedStateHandle,
    workspace: Arc<WorkspaceManager>,
    self_vote_forbidden: bool,
    signal_tx: mpsc::UnboundedSender<RunnerSignal>,
}

impl AgentRunner {
    pub fn new(
        anon_id: impl Into<String>,
        backend: Arc<dyn Backend>,
        shared: SharedStateHandle,
        workspace: Arc<WorkspaceManager>,
        self_vote_forbidden: bool,
        signal_tx: mpsc::UnboundedSender<RunnerSignal>,
    ) -> Self {
        Self {
            anon_id: anon_id.into(),
            backend,
            shared,
            workspace,
            self_vote_forbidden,
            signal_tx,
        }
    }

    /// `run_attempt(ctx, attempt_no)`. `messages`/`tools` are the
    /// already-built logical request (see `crate::prompt::PromptBuilder`);
    /// cancellation fires at every suspension point on the backend stream, per
    /// the concurrency model in spec §5. `chunk_sink`, if given, receives every
    /// chunk as it arrives so a UI can observe per-agent progress without the
    /// orchestrator waiting on other runners.
    pub async fn run_attempt(
        &self,
        messages: &[BackendMessage],
        tools: &[ToolSchema],
        cancel: CancellationToken,
        attempt_timeout: Duration,
        chunk_sink: Option<mpsc::UnboundedSender<StreamChunk>>,
    ) -> AttemptOutcome {
        self.shared.mark_status(&self.anon_id, AgentStatus::Working).await;

        let stream_result = self.backend.stream(messages, tools).await;
        let mut stream = match stream_result {
            Ok(stream) => stream,
            Err(e) => {
                return AttemptOutcome::Failed(CoordinationError::BackendStreamError {
                    anon_id: self.anon_id.clone(),
                    detail: e.to_string(),
                })
            }
        };

        let mut accumulated_content = String::new();
        let mut last_content: Option<String> = None;
        let mut committed_any = false;

        let attempt_fut = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
                    chunk = stream.next() => chunk,
                };

                let Some(chunk) = next else {
                    // Stream ended without an explicit Done/Error: treat as a
                    // malformed-but-terminal backend, same as CompletedWithoutAnswer.
                    break;
                };

                if let Some(sink) = &chunk_sink {
                    let _ = sink.send(chunk.clone());
                }

                match chunk {
                    StreamChunk::Content { text } => {
                        accumulated_content.push_str(&text);
                        last_content = Some(accumulated_content.clone());
                    }
                    StreamChunk::Reasoning { .. } => {}
                    StreamChunk::ToolCalls { calls } => {
                        // Tie-break applies within one emitted batch: a
                        // backend that packs both a new_answer and a vote into the
                        // same tool_calls turn gets only the first committed: a
                        // real backend emitting them as separate, sequential turns
                        // (e.g. "answer, then separately vote for it") is normal
                        // operation and both are allowed to commit (worked example
                        // in spec §8 scenario 1 depends on this).
                        let mut turn_committed = false;
                        for call in &calls {
                            let Some(workflow_call) = workflow_call_from_native(call) else {
                                continue; // non-workflow tool call: forwarded untouched upstream
                            };
                            if turn_committed {
                                warn!(
                                    "{}: dropping second workflow call {:?} in the same turn (tie-break: first committed wins)",
                                    self.anon_id, workflow_call
                                );
                                continue;
                            }
                            if self.apply_workflow_call(workflow_call).await {
                                turn_committed = true;
                                committed_any = true;
                            }
                        }
                    }
                    StreamChunk::ToolResult { .. } => {}
                    StreamChunk::CompleteMessage { message } => {
                        if let Some(content) = &message.content {
                            last_content = Some(content.clone());
                        }
                        let mut turn_committed = false;
                        for call in &message.tool_calls {
                            let Some(workflow_call) = workflow_call_from_native(call) else {
                                continue;
                            };
                            if turn_committed {
                                continue;
                            }
                            if self.apply_workflow_call(workflow_call).await {
                                turn_committed = true;
                                committed_any = true;
                            }
                        }
                    }
                    StreamChunk::AgentStatus { status, .. } => {
                        debug!("{}: agent_status={}", self.anon_id, status);
                    }
                    StreamChunk::McpStatus { status, .. } => {
                        debug!("{}: mcp_status={}", self.anon_id, status);
                    }
                    StreamChunk::Error { error } => {
                        return AttemptOutcome::Failed(CoordinationError::BackendStreamError {
                            anon_id: self.anon_id.clone(),
                            detail: error,
                        });
                    }
                    StreamChunk::Done => break,
                }
            }

            // Content-block recognition happens once per attempt, over the fully
            // accumulated content, and only if no native tool call already
            // committed something — native tool_calls and a JSON-in-content block
            // for the same logical call are not expected simultaneously from a
            // single backend, so native wins when both are present.
            if !committed_any {
                if let Some(call) = extract_json_block_call(&accumulated_content) {
                    if self.apply_workflow_call(call).await {
                        committed_any = true;
                    }
                }
            }

            if committed_any {
                AttemptOutcome::CompletedWithAnswer
            } else {
                AttemptOutcome::CompletedWithoutAnswer { last_content }
            }
        };

        tokio::select! {
            biased;
            _ = tokio::time::sleep(attempt_timeout) => {
                self.shared.mark_status(&self.anon_id, AgentStatus::TimedOut).await;
                AttemptOutcome::TimedOut
            }
            outcome = attempt_fut => outcome,
        }
    }

    /// Apply one recognised workflow call to shared state. Returns `true` if it
    /// was committed, `false` if the bus rejected it (invalid_transition —
    /// logged and dropped propagation policy). Publishes the `answering`/`voting`
    /// transition the instant the call is recognised, ahead of knowing whether
    /// the bus will actually accept the commit.
    async fn apply_workflow_call(&self, call: WorkflowCall) -> bool {
        match call {
            WorkflowCall::NewAnswer { text } => {
                self.shared
                    .publish_event(crate::coordination_event::CoordinationEvent::agent_answering(&self.anon_id))
                    .await;
                match self.shared.commit_new_answer(&self.anon_id, text).await {
                    Ok((true, global_version)) => {
                        let _ = self.signal_tx.send(RunnerSignal::NewAnswerCommitted {
                            anon_id: self.anon_id.clone(),
                            global_version,
                        });
                        true
                    }
                    Ok((false, _)) => {
                        info!("{}: new_answer rejected (phase no longer coordinating)", self.anon_id);
                        false
                    }
                    Err(e) => {
                        warn!("{}: new_answer rejected: {}", self.anon_id, e);
                        false
                    }
                }
            }
            WorkflowCall::Vote {
                target_anon_id,
                reason,
            } => {
                self.shared
                    .publish_event(crate::coordination_event::CoordinationEvent::agent_voting(&self.anon_id))
                    .await;
                match self
                    .shared
                    .commit_vote(&self.anon_id, &target_anon_id, reason, self.self_vote_forbidden)
                    .await
                {
                    Ok(true) => {
                        let _ = self.signal_tx.send(RunnerSignal::VoteCommitted {
                            anon_id: self.anon_id.clone(),
                        });
                        true
                    }
                    Ok(false) => {
                        info!("{}: vote rejected (phase no longer coordinating)", self.anon_id);
                        false
                    }
                    Err(e) => {
                        warn!("{}: vote rejected: {}", self.anon_id, e);
                        false
                    }
                }
            }
        }
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_new_answer_json_block() {
        let content = "Here is my reasoning.\n```json\n{\"tool_name\": \"new_answer\", \"arguments\": {\"content\": \"42\"}}\n```\nDone.";
        let call = extract_json_block_call(content);
        assert_eq!(call, Some(WorkflowCall::NewAnswer { text: "42".to_string() }));
    }

    #[test]
    fn last_json_block_is_authoritative() {
        let content = "```json\n{\"tool_name\": \"vote\", \"arguments\": {\"agent_id\": \"agent1\", \"reason\": \"first\"}}\n```\nActually wait.\n```json\n{\"tool_name\": \"vote\", \"arguments\": {\"agent_id\": \"agent2\", \"reason\": \"second\"}}\n```";
        let call = extract_json_block_call(content);
        assert_eq!(
            call,
            Some(WorkflowCall::Vote {
                target_anon_id: "agent2".to_string(),
                reason: "second".to_string()
            })
        );
    }

    #[test]
    fn ignores_non_workflow_json_blocks() {
        let content = "```json\n{\"tool_name\": \"calculator\", \"arguments\": {\"expression\": \"2+2\"}}\n```";
        assert_eq!(extract_json_block_call(content), None);
    }

    #[test]
    fn native_tool_call_recognised_by_name() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "new_answer".to_string(),
            arguments: serde_json::json!({ "content": "4" }),
        };
        assert_eq!(
            workflow_call_from_native(&call),
            Some(WorkflowCall::NewAnswer { text: "4".to_string() })
        );
    }

    #[test]
    fn non_workflow_native_tool_call_is_not_recognised() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "search_web".to_string(),
            arguments: serde_json::json!({ "query": "rust" }),
        };
        assert_eq!(workflow_call_from_native(&call), None);
    }
}
