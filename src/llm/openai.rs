//! OpenAI-compatible streaming client.
//!
//! Speaks the chat-completions SSE dialect shared by every provider the
//! manager knows. Deltas are translated into [`LlmEvent`]s as they arrive;
//! tool-call argument fragments are accumulated per index and emitted once
//! the stream finishes the call.

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionClient, CompletionRequest, LlmEvent, LlmEventStream, TokenUsage,
    ToolCallRequest,
};
use crate::llm::manager::LlmManager;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct OpenAiCompatClient {
    manager: Arc<LlmManager>,
}

impl OpenAiCompatClient {
    pub fn new(manager: Arc<LlmManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn stream_turn(&self, request: CompletionRequest) -> Result<LlmEventStream, LlmError> {
        let (provider, model) = self.manager.resolve_model(&request.model);
        let api_key = self.manager.get_api_key(&provider)?;
        let base_url = self.manager.get_base_url(&provider)?.to_string();

        let body = build_request_body(&model, &request);
        let response = self
            .manager
            .http_client()
            .post(&base_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!("{status}: {text}")));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_sse(response, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn build_request_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = request
        .tools
        .iter()
        .map(|tool| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect();

    let messages: Vec<serde_json::Value> = request.messages.iter().map(wire_message).collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(tools);
    }
    body
}

fn wire_message(message: &ChatMessage) -> serde_json::Value {
    match message {
        ChatMessage::System { content } => {
            serde_json::json!({ "role": "system", "content": content })
        }
        ChatMessage::User { content } => {
            serde_json::json!({ "role": "user", "content": content })
        }
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = serde_json::json!({ "role": "assistant", "content": content });
            if !tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = tool_calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                value["tool_calls"] = serde_json::Value::Array(calls);
            }
            value
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => serde_json::json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    /// DeepSeek-style reasoning channel; absent on providers without one.
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Read the SSE body and translate chunks into events. Ends the stream after
/// `Completed` or the first error.
async fn pump_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<LlmEvent, LlmError>>,
) {
    let mut bytes = response.bytes_stream();
    let mut buffer = String::new();
    let mut in_reasoning = false;
    let mut pending_calls: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
    let mut usage = TokenUsage::default();
    let mut completed = false;

    'read: while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx
                    .send(Err(LlmError::StreamInterrupted(err.to_string())))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer.drain(..=line_end);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break 'read;
            }

            let parsed: StreamChunk = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping undecodable stream chunk");
                    continue;
                }
            };

            if let Some(wire_usage) = parsed.usage {
                usage = TokenUsage {
                    input_tokens: wire_usage.prompt_tokens,
                    output_tokens: wire_usage.completion_tokens,
                };
            }

            for choice in parsed.choices {
                if let Some(reasoning) = choice.delta.reasoning_content
                    && !reasoning.is_empty()
                {
                    in_reasoning = true;
                    if tx.send(Ok(LlmEvent::ReasoningDelta(reasoning))).await.is_err() {
                        return;
                    }
                }
                if let Some(content) = choice.delta.content
                    && !content.is_empty()
                {
                    if in_reasoning {
                        in_reasoning = false;
                        if tx.send(Ok(LlmEvent::ReasoningComplete)).await.is_err() {
                            return;
                        }
                    }
                    if tx.send(Ok(LlmEvent::TextDelta(content))).await.is_err() {
                        return;
                    }
                }
                for delta in choice.delta.tool_calls {
                    let pending = pending_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        pending.id = id;
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            pending.name = name;
                        }
                        if let Some(arguments) = function.arguments {
                            pending.arguments.push_str(&arguments);
                        }
                    }
                }
                if choice.finish_reason.is_some() {
                    completed = true;
                }
            }
        }
    }

    if in_reasoning && tx.send(Ok(LlmEvent::ReasoningComplete)).await.is_err() {
        return;
    }

    if !completed && pending_calls.is_empty() && usage == TokenUsage::default() {
        let _ = tx
            .send(Err(LlmError::StreamInterrupted(
                "provider closed the stream before finishing".into(),
            )))
            .await;
        return;
    }

    for (_, pending) in pending_calls {
        let arguments = serde_json::from_str(&pending.arguments)
            .unwrap_or(serde_json::Value::Null);
        let event = LlmEvent::ToolCall(ToolCallRequest {
            id: pending.id,
            name: pending.name,
            arguments,
        });
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }

    let _ = tx
        .send(Ok(LlmEvent::Completed {
            usage,
            followups: Vec::new(),
        }))
        .await;
}
