//! LLM provider seam.
//!
//! The orchestrator only consumes the streamed event model defined here; the
//! provider wire format stays behind [`CompletionClient`]. Events are the
//! least common denominator the chat loop needs: reasoning deltas, answer
//! deltas, tool-call requests, and a terminal usage report.

pub mod manager;
pub mod openai;

use crate::error::LlmError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// One event from a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// Reasoning tokens, emitted before the visible answer by models that
    /// expose their chain of thought.
    ReasoningDelta(String),
    /// Explicit end-of-reasoning signal.
    ReasoningComplete,
    /// One visible answer token.
    TextDelta(String),
    /// The model requested a tool invocation.
    ToolCall(ToolCallRequest),
    /// The stream finished. Carries provider-reported token counts and any
    /// follow-up suggestions the model attached to its final payload.
    Completed {
        usage: TokenUsage,
        followups: Vec<String>,
    },
}

/// A model-initiated tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token counts as reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Chat history entry sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// Tool surface advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: serde_json::Value,
}

/// One streamed completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

pub type LlmEventStream =
    Pin<Box<dyn Stream<Item = Result<LlmEvent, LlmError>> + Send>>;

/// Streams one completion turn. Implementations must emit events in arrival
/// order and terminate the stream after `Completed` (or an error).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_turn(&self, request: CompletionRequest) -> Result<LlmEventStream, LlmError>;
}
