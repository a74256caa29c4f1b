//! Shared test-only `Backend` double used by the coordination scenario tests.
//!
//! Each agent's backend is scripted per-attempt: the Nth call to `stream()`
//! pops the Nth script and replays it as a chunk sequence. This lets a test
//! assert on exact attempt-by-attempt coordination behaviour without needing
//! a real LLM.

use async_trait::async_trait;
use futures_util::stream;
use massgen_core::stream_chunk::{
    Backend, BackendMessage, ChunkStream, FilesystemSupport, StreamChunk, ToolCallRequest, ToolSchema,
};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One attempt's scripted behaviour.
pub enum Script {
    /// Replay these chunks in order, then end the stream.
    Chunks(Vec<StreamChunk>),
    /// Never produce a chunk — used to drive the attempt/run timeout paths.
    Pending,
}

pub struct ScriptedBackend {
    model_name: String,
    scripts: Mutex<Vec<Script>>,
    filesystem_support: FilesystemSupport,
    attempts_launched: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(model_name: &str, scripts: Vec<Script>) -> Self {
        Self {
            model_name: model_name.to_string(),
            scripts: Mutex::new(scripts.into_iter().rev().collect()),
            filesystem_support: FilesystemSupport::None,
            attempts_launched: AtomicUsize::new(0),
        }
    }

    pub fn with_filesystem_support(mut self, support: FilesystemSupport) -> Self {
        self.filesystem_support = support;
        self
    }

    /// Number of times `stream()` has been called, i.e. attempts actually
    /// launched against this backend.
    pub fn attempts_launched(&self) -> usize {
        self.attempts_launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn stream(
        &self,
        _messages: &[BackendMessage],
        _tools: &[ToolSchema],
    ) -> Result<ChunkStream, Box<dyn Error + Send + Sync>> {
        self.attempts_launched.fetch_add(1, Ordering::SeqCst);
        let next = self.scripts.lock().unwrap().pop();
        match next.unwrap_or(Script::Chunks(vec![StreamChunk::Done])) {
            Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks))),
            Script::Pending => Ok(Box::pin(stream::pending())),
        }
    }

    fn get_filesystem_support(&self) -> FilesystemSupport {
        self.filesystem_support
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

pub fn new_answer_chunk(text: &str) -> StreamChunk {
    StreamChunk::ToolCalls {
        calls: vec![ToolCallRequest {
            id: "call_new_answer".to_string(),
            name: "new_answer".to_string(),
            arguments: serde_json::json!({ "content": text }),
        }],
    }
}

pub fn vote_chunk(target_anon_id: &str, reason: &str) -> StreamChunk {
    StreamChunk::ToolCalls {
        calls: vec![ToolCallRequest {
            id: "call_vote".to_string(),
            name: "vote".to_string(),
            arguments: serde_json::json!({ "agent_id": target_anon_id, "reason": reason }),
        }],
    }
}

pub fn content_chunk(text: &str) -> StreamChunk {
    StreamChunk::Content { text: text.to_string() }
}
