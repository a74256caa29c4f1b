//! The `StreamChunk` transport type and the `Backend` contract.
//!
//! `StreamChunk` is the sole wire type passed between backends, the agent runner,
//! and the orchestrator. Modeled as a tagged `enum` rather than a struct of
//! `Option` fields, covering the full set of kinds a coordination-aware
//! backend must be able to emit.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::pin::Pin;

/// One native tool call requested by the backend in a `tool_calls` chunk.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned id, used to correlate a later `tool_result`.
    pub id: String,
    /// Tool name. The two workflow tools are `new_answer` and `vote`; anything
    /// else is a non-workflow call and is forwarded untouched.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

/// A complete assistant message, as emitted by a `complete_message` chunk.
#[derive(Debug, Clone)]
pub struct CompleteMessage {
    /// Final text content, if any.
    pub content: Option<String>,
    /// Tool calls attached to this message, if any.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The tagged envelope used between backends, agents, and the orchestrator.
///
/// A well-formed stream ends with exactly one [`StreamChunk::Done`] or one
/// [`StreamChunk::Error`]; the orchestrator treats `Error` as terminal for that
/// attempt only.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental assistant-visible text.
    Content { text: String },

    /// Reasoning / "thinking" trace, either incremental or as a full block.
    /// Never inspected for workflow calls — only `Content` and `ToolCalls` are.
    Reasoning {
        delta: Option<String>,
        text: Option<String>,
    },

    /// One or more native tool calls requested by the backend in this turn.
    ToolCalls { calls: Vec<ToolCallRequest> },

    /// The result of executing a (non-workflow) tool call, fed back to the
    /// backend by the caller, not something a backend itself emits upstream.
    ToolResult {
        call_id: String,
        content: Option<String>,
    },

    /// A fully-formed assistant message, used by backends that don't expose an
    /// incremental delta API.
    CompleteMessage { message: CompleteMessage },

    /// Informational agent lifecycle status, never treated as an error.
    AgentStatus {
        status: String,
        source: Option<String>,
    },

    /// Informational MCP lifecycle status.
    McpStatus {
        status: String,
        content: Option<String>,
        source: Option<String>,
    },

    /// Terminal: the backend failed. Ends the stream.
    Error { error: String },

    /// Terminal: the backend finished normally. Ends the stream.
    Done,
}

impl StreamChunk {
    /// True for the two chunk kinds that terminate a well-formed stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done | StreamChunk::Error { .. })
    }
}

/// Discriminates how (if at all) a backend can be given a filesystem view of
/// peer workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemSupport {
    /// The backend has no filesystem affordance; `T_a` is never materialised.
    None,
    /// The backend can read files directly from a path the core provides.
    Native,
    /// The backend requires an MCP filesystem tool server to be injected.
    Mcp,
}

/// Boxed stream of chunks returned by [`Backend::stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// A single message in the logical conversation handed to a backend.
#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub role: BackendRole,
    pub content: String,
}

/// Role of a [`BackendMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    System,
    User,
    Assistant,
}

/// A tool schema offered to the backend for a turn, used to advertise the two
/// workflow tools (`new_answer`, `vote`) and, when filesystem context is native,
/// any filesystem tools.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// The only interface the coordination core needs from an LLM adapter:
/// `Send + Sync`, an async streaming entry point, plus the coordination-specific
/// capability discriminators.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stream a response given the logical message sequence and the workflow (and
    /// any filesystem) tools available this turn. Must yield chunks terminated by
    /// exactly one `Done` or `Error`.
    async fn stream(
        &self,
        messages: &[BackendMessage],
        tools: &[ToolSchema],
    ) -> Result<ChunkStream, Box<dyn Error + Send + Sync>>;

    /// Discriminates whether/how this backend can be given a peer-workspace view.
    /// Defaults to `None`, matching `ClientWrapper`'s "report nothing extra unless
    /// you override it" default posture.
    fn get_filesystem_support(&self) -> FilesystemSupport {
        FilesystemSupport::None
    }

    /// If `true`, the core does not resend conversation history on restart — only
    /// the new user turn. Defaults to `false` (stateless, full history each time).
    fn is_stateful(&self) -> bool {
        false
    }

    /// Identifier for the underlying model, surfaced in logs and artefacts.
    fn model_name(&self) -> &str;
}
