//! Realtime event model.
//!
//! Every event the orchestrator emits is one variant of [`WsEvent`], tagged
//! by `type` and carrying the originating conversation id where one exists.
//! Two wire encodings decode to the same variant: the canonical descriptive
//! form this server emits, and a short-code form (`tok`, `cid`, ...) kept for
//! older clients. They are synonyms, never distinct events.

use crate::pool::protocol::ExecutionResult;
use crate::{ConversationId, JobId, MessageId};
use serde::{Deserialize, Serialize};

/// One streamed event, multiplexed over the per-session realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// Model reasoning tokens, accumulated separately from the answer.
    #[serde(alias = "rt")]
    ReasoningToken {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        #[serde(alias = "t")]
        text: String,
    },

    /// The model switched from reasoning to the visible answer.
    #[serde(alias = "rc")]
    ReasoningComplete {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
    },

    /// One visible answer token.
    #[serde(alias = "tok")]
    AnswerToken {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        #[serde(alias = "t")]
        text: String,
    },

    /// The model requested a tool; execution is starting.
    #[serde(alias = "tcs")]
    ToolCallStart {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        tool: String,
        #[serde(alias = "idx")]
        execution_index: usize,
    },

    /// Progress of a SQL job through the worker pool.
    #[serde(alias = "qp")]
    QueryProgress {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        job_id: JobId,
        #[serde(alias = "idx")]
        execution_index: usize,
        status: QueryStatus,
    },

    /// Chart specification forwarded from the chart-creation tool. May arrive
    /// before the turn completes; the orchestrator holds it for the merge.
    #[serde(alias = "chart")]
    ChartSpec {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        #[serde(alias = "idx")]
        execution_index: usize,
        spec: ChartSpecPayload,
    },

    /// Turn finished: final content plus resolved executions with merged
    /// chart specs. A rate-limit warning rides along when the recorded usage
    /// landed in the warning band.
    #[serde(alias = "done")]
    ChatComplete {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
        executions: Vec<SqlExecution>,
        input_tokens: u64,
        output_tokens: u64,
        warning: Option<UsageSummary>,
    },

    /// Turn failed. Partial content was finalized first; the message id of
    /// the flushed partial is carried when one exists.
    #[serde(alias = "err")]
    ChatError {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        message: String,
        partial_message_id: Option<MessageId>,
    },

    /// Follow-up prompts suggested by the model for the next turn.
    #[serde(alias = "fs")]
    FollowupSuggestions {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        suggestions: Vec<String>,
    },

    /// Rolling-window usage snapshot. Global: applies to every conversation
    /// of the session's user.
    #[serde(alias = "usage")]
    UsageUpdate {
        #[serde(alias = "u")]
        usage_tokens: i64,
        #[serde(alias = "l")]
        limit_tokens: i64,
        #[serde(alias = "p")]
        usage_percent: f64,
        remaining_tokens: i64,
    },

    /// Usage crossed the warning threshold.
    #[serde(alias = "rlw")]
    RateLimitWarning {
        #[serde(alias = "u")]
        usage_tokens: i64,
        #[serde(alias = "l")]
        limit_tokens: i64,
        #[serde(alias = "p")]
        usage_percent: f64,
    },

    /// Admission denied before any LLM call was made.
    #[serde(alias = "rlx")]
    RateLimitExceeded {
        #[serde(alias = "cid")]
        conversation_id: ConversationId,
        resets_in_seconds: i64,
        #[serde(alias = "p")]
        usage_percent: f64,
    },
}

impl WsEvent {
    /// The originating conversation, or `None` for global events.
    ///
    /// This is the single dispatch point the session filter keys on; adding a
    /// variant without classifying it here fails to compile.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            WsEvent::ReasoningToken {
                conversation_id, ..
            }
            | WsEvent::ReasoningComplete {
                conversation_id, ..
            }
            | WsEvent::AnswerToken {
                conversation_id, ..
            }
            | WsEvent::ToolCallStart {
                conversation_id, ..
            }
            | WsEvent::QueryProgress {
                conversation_id, ..
            }
            | WsEvent::ChartSpec {
                conversation_id, ..
            }
            | WsEvent::ChatComplete {
                conversation_id, ..
            }
            | WsEvent::ChatError {
                conversation_id, ..
            }
            | WsEvent::FollowupSuggestions {
                conversation_id, ..
            }
            | WsEvent::RateLimitExceeded {
                conversation_id, ..
            } => Some(conversation_id),
            WsEvent::UsageUpdate { .. } | WsEvent::RateLimitWarning { .. } => None,
        }
    }
}

/// Job status as reported on `query_progress` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Chart specification produced by the chart-creation tool. The server never
/// computes anything from it; it is relayed to the client as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartSpecPayload {
    #[serde(alias = "kind")]
    pub chart_type: String,
    pub title: Option<String>,
    /// Axis/series mapping and rendering options, opaque to the server.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One resolved SQL execution attached to a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlExecution {
    /// Zero-based position of this execution within the turn.
    pub index: usize,
    pub query_text: String,
    pub result: ExecutionResult,
    /// Chart spec merged in at finalization, when one targeted this index.
    pub chart_spec: Option<ChartSpecPayload>,
}

/// Compact usage snapshot attached to completion events in the warning band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub usage_tokens: i64,
    pub limit_tokens: i64,
    pub usage_percent: f64,
}
