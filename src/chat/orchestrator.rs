//! Chat streaming orchestrator.
//!
//! Drives one turn per conversation through the phase machine
//! `thinking -> (reasoning)? -> streaming_tokens -> (tool_call: executing ->
//! streaming_tokens)* -> complete | error`, multiplexing every phase onto the
//! event bus as it happens. A turn suspends token emission only while its own
//! tool result is pending; turns in other conversations stream concurrently.

use crate::chat::store::MessageStore;
use crate::chat::stream::{StreamState, merge_chart_specs};
use crate::chat::tools::{self, ToolInvocation};
use crate::error::{Error, PoolError};
use crate::events::{QueryStatus, SqlExecution, UsageSummary, WsEvent};
use crate::limiter::{RateLimitStatus, RateLimiter};
use crate::llm::{
    ChatMessage, CompletionClient, CompletionRequest, LlmEvent, TokenUsage, ToolCallRequest,
};
use crate::pool::protocol::{ExecutionResult, QueryErrorKind};
use crate::pool::{JobOutcome, PoolHandle, QueryJob};
use crate::realtime::EventBus;
use crate::{ConversationId, DatasetRef, MessageId, UserId};
use async_trait::async_trait;
use futures::StreamExt as _;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Rows included in the tool result fed back to the model. The client gets
/// the full page via the completion event; the model only needs enough to
/// narrate.
const TOOL_RESULT_ROW_CAP: usize = 50;

/// Executes SQL jobs for the orchestrator. Implemented by [`PoolHandle`];
/// tests substitute a stub so turn logic is exercised without worker
/// processes.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, job: QueryJob) -> Result<ExecutionResult, PoolError>;
}

#[async_trait]
impl QueryExecutor for PoolHandle {
    async fn execute(&self, job: QueryJob) -> Result<ExecutionResult, PoolError> {
        match self.submit(job).await? {
            JobOutcome::Result(result) => Ok(result),
            other => unreachable!("query job answered with {other:?}"),
        }
    }
}

/// One inbound chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub message: String,
    pub datasets: Vec<DatasetRef>,
}

/// Admission decision for a turn.
#[derive(Debug)]
pub enum TurnAdmission {
    /// The turn is streaming; events carry this message id at completion.
    Accepted { message_id: MessageId },
    /// Rolling-window limit reached; no LLM call was made.
    Denied(RateLimitStatus),
    /// The conversation already has a streaming turn.
    Busy,
}

/// Tunables the orchestrator reads per turn.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub max_tool_rounds: usize,
    pub query_timeout_ms: u64,
}

pub struct ChatOrchestrator {
    llm: Arc<dyn CompletionClient>,
    executor: Arc<dyn QueryExecutor>,
    limiter: RateLimiter,
    bus: EventBus,
    store: MessageStore,
    settings: ChatSettings,
    /// Conversations with a streaming turn; one turn at a time per
    /// conversation.
    active: Mutex<HashSet<ConversationId>>,
}

impl ChatOrchestrator {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        executor: Arc<dyn QueryExecutor>,
        limiter: RateLimiter,
        bus: EventBus,
        store: MessageStore,
        settings: ChatSettings,
    ) -> Self {
        Self {
            llm,
            executor,
            limiter,
            bus,
            store,
            settings,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Admission-check a turn and, if allowed, start streaming it in the
    /// background. Denial happens before any LLM cost is incurred.
    pub async fn begin_turn(self: Arc<Self>, request: TurnRequest) -> crate::Result<TurnAdmission> {
        let status = self.limiter.check_limit(&request.user_id).await?;
        if !status.allowed {
            tracing::info!(
                user_id = %request.user_id,
                usage_tokens = status.usage_tokens,
                "turn denied by rate limiter"
            );
            self.bus.publish(WsEvent::RateLimitExceeded {
                conversation_id: request.conversation_id.clone(),
                resets_in_seconds: status.resets_in_seconds,
                usage_percent: status.usage_percent.min(100.0),
            });
            return Ok(TurnAdmission::Denied(status));
        }

        {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !active.insert(request.conversation_id.clone()) {
                return Ok(TurnAdmission::Busy);
            }
        }

        if let Err(error) = self
            .store
            .insert_user_message(&request.conversation_id, &request.message)
            .await
        {
            tracing::warn!(%error, "failed to persist user message");
        }

        let state = StreamState::new(request.conversation_id.clone());
        let message_id = state.streaming_message_id;

        tokio::spawn(async move {
            self.run_turn(request, state).await;
        });

        Ok(TurnAdmission::Accepted { message_id })
    }

    #[tracing::instrument(skip(self, request, state), fields(conversation_id = %request.conversation_id))]
    async fn run_turn(self: Arc<Self>, request: TurnRequest, mut state: StreamState) {
        let outcome = self.drive_turn(&request, &mut state).await;
        match outcome {
            Ok((usage, followups)) => {
                self.finalize_complete(&request, state, usage, followups)
                    .await;
            }
            Err(error) => {
                tracing::error!(%error, "turn failed");
                self.finalize_error(state, &error).await;
            }
        }
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request.conversation_id);
    }

    /// The LLM tool loop: stream a completion, execute any tool calls, feed
    /// the results back, repeat until the model answers without tools.
    async fn drive_turn(
        &self,
        request: &TurnRequest,
        state: &mut StreamState,
    ) -> crate::Result<(TokenUsage, Vec<String>)> {
        let conversation_id = &request.conversation_id;
        let mut messages = vec![
            ChatMessage::System {
                content: system_prompt(&request.datasets),
            },
            ChatMessage::User {
                content: request.message.clone(),
            },
        ];
        let mut total_usage = TokenUsage::default();
        let mut followups = Vec::new();

        for round in 0..=self.settings.max_tool_rounds {
            let mut stream = self
                .llm
                .stream_turn(CompletionRequest {
                    model: self.settings.model.clone(),
                    messages: messages.clone(),
                    tools: tools::definitions(),
                })
                .await
                .map_err(Error::Llm)?;

            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
            let mut round_text = String::new();
            let mut completed = false;

            while let Some(event) = stream.next().await {
                match event.map_err(Error::Llm)? {
                    LlmEvent::ReasoningDelta(text) => {
                        state.is_reasoning = true;
                        state.accumulated_reasoning.push_str(&text);
                        self.bus.publish(WsEvent::ReasoningToken {
                            conversation_id: conversation_id.clone(),
                            text,
                        });
                    }
                    LlmEvent::ReasoningComplete => {
                        if state.is_reasoning {
                            state.is_reasoning = false;
                            self.bus.publish(WsEvent::ReasoningComplete {
                                conversation_id: conversation_id.clone(),
                            });
                        }
                    }
                    LlmEvent::TextDelta(text) => {
                        if state.is_reasoning {
                            state.is_reasoning = false;
                            self.bus.publish(WsEvent::ReasoningComplete {
                                conversation_id: conversation_id.clone(),
                            });
                        }
                        state.accumulated_tokens.push_str(&text);
                        round_text.push_str(&text);
                        self.bus.publish(WsEvent::AnswerToken {
                            conversation_id: conversation_id.clone(),
                            text,
                        });
                    }
                    LlmEvent::ToolCall(call) => tool_calls.push(call),
                    LlmEvent::Completed {
                        usage,
                        followups: suggested,
                    } => {
                        total_usage.input_tokens += usage.input_tokens;
                        total_usage.output_tokens += usage.output_tokens;
                        if !suggested.is_empty() {
                            followups = suggested;
                        }
                        completed = true;
                    }
                }
            }

            if !completed {
                return Err(Error::Llm(crate::error::LlmError::StreamInterrupted(
                    "completion stream ended without finishing".into(),
                )));
            }

            if tool_calls.is_empty() {
                return Ok((total_usage, followups));
            }

            messages.push(ChatMessage::Assistant {
                content: (!round_text.is_empty()).then(|| round_text.clone()),
                tool_calls: tool_calls.clone(),
            });
            for call in tool_calls {
                let content = self.dispatch_tool(request, state, &call).await;
                messages.push(ChatMessage::Tool {
                    tool_call_id: call.id.clone(),
                    content,
                });
            }

            tracing::debug!(round, "tool round complete");
        }

        tracing::warn!(
            max_tool_rounds = self.settings.max_tool_rounds,
            "turn hit the tool round cap, finalizing with accumulated content"
        );
        Ok((total_usage, followups))
    }

    /// Decode and execute one tool call; the returned string is the tool
    /// result message for the model.
    async fn dispatch_tool(
        &self,
        request: &TurnRequest,
        state: &mut StreamState,
        call: &ToolCallRequest,
    ) -> String {
        state.pending_tool_call = Some(call.name.clone());
        let content = match ToolInvocation::parse(&call.name, &call.arguments) {
            Ok(ToolInvocation::RunSql(args)) => self.run_sql(request, state, args).await,
            Ok(ToolInvocation::CreateChart(args)) => self.create_chart(state, args),
            Err(message) => {
                tracing::warn!(tool = %call.name, %message, "tool call rejected");
                serde_json::json!({ "error": message }).to_string()
            }
        };
        state.pending_tool_call = None;
        content
    }

    /// Execute SQL through the pool. Pool-level failures (crash, timeout)
    /// become inline execution errors scoped to this one execution, so the
    /// model can still narrate around them.
    async fn run_sql(
        &self,
        request: &TurnRequest,
        state: &mut StreamState,
        args: tools::RunSqlArgs,
    ) -> String {
        let conversation_id = &request.conversation_id;
        let index = state.next_execution_index();
        self.bus.publish(WsEvent::ToolCallStart {
            conversation_id: conversation_id.clone(),
            tool: tools::RUN_SQL.into(),
            execution_index: index,
        });

        let job = QueryJob::query(
            Some(conversation_id.clone()),
            args.query.clone(),
            request.datasets.clone(),
            args.page,
            args.page_size,
            self.settings.query_timeout_ms,
        );
        let job_id = job.id;
        self.bus.publish(WsEvent::QueryProgress {
            conversation_id: conversation_id.clone(),
            job_id,
            execution_index: index,
            status: QueryStatus::Queued,
        });

        let result = match self.executor.execute(job).await {
            Ok(result) => result,
            Err(PoolError::QueryTimeout { timeout_ms }) => ExecutionResult::failed(
                QueryErrorKind::Timeout,
                format!("Query timed out after {timeout_ms}ms"),
                timeout_ms,
            ),
            Err(PoolError::WorkerCrash) => ExecutionResult::failed(
                QueryErrorKind::Crash,
                "The query worker crashed while executing this query",
                0,
            ),
            Err(error) => ExecutionResult::failed(
                QueryErrorKind::Internal,
                format!("Query could not be executed: {error}"),
                0,
            ),
        };

        let status = match &result.error {
            None => QueryStatus::Succeeded,
            Some(error) if error.kind == QueryErrorKind::Timeout => QueryStatus::TimedOut,
            Some(_) => QueryStatus::Failed,
        };
        self.bus.publish(WsEvent::QueryProgress {
            conversation_id: conversation_id.clone(),
            job_id,
            execution_index: index,
            status,
        });

        let summary = tool_result_summary(&result);
        state.executions.push(SqlExecution {
            index,
            query_text: args.query,
            result,
            chart_spec: None,
        });
        summary
    }

    /// Pure passthrough: forward the spec to the client, hold it for the
    /// finalization merge, report success to the model.
    fn create_chart(&self, state: &mut StreamState, args: tools::CreateChartArgs) -> String {
        let spec = crate::events::ChartSpecPayload {
            chart_type: args.chart_type,
            title: args.title,
            config: args.config,
        };
        self.bus.publish(WsEvent::ChartSpec {
            conversation_id: state.conversation_id.clone(),
            execution_index: args.execution_index,
            spec: spec.clone(),
        });
        state.pending_chart_specs.insert(args.execution_index, spec);
        serde_json::json!({ "ok": true }).to_string()
    }

    /// Finalize a successful turn: merge chart specs, persist the message,
    /// record usage, re-check the limiter for the warning band, emit
    /// completion.
    async fn finalize_complete(
        &self,
        request: &TurnRequest,
        mut state: StreamState,
        usage: TokenUsage,
        followups: Vec<String>,
    ) {
        let executions = merge_chart_specs(
            std::mem::take(&mut state.executions),
            std::mem::take(&mut state.pending_chart_specs),
        );

        if let Err(error) = self
            .store
            .insert_assistant_message(
                state.streaming_message_id,
                &state.conversation_id,
                &state.accumulated_tokens,
                &executions,
                None,
            )
            .await
        {
            tracing::error!(%error, "failed to persist assistant message");
        }

        if let Err(error) = self
            .limiter
            .record_usage(
                &request.user_id,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
            )
            .await
        {
            tracing::error!(%error, "failed to record token usage");
        }

        let warning = match self.limiter.check_limit(&request.user_id).await {
            Ok(status) => {
                self.bus.publish(WsEvent::UsageUpdate {
                    usage_tokens: status.usage_tokens,
                    limit_tokens: status.limit_tokens,
                    usage_percent: status.usage_percent,
                    remaining_tokens: status.remaining_tokens,
                });
                if status.warning {
                    self.bus.publish(WsEvent::RateLimitWarning {
                        usage_tokens: status.usage_tokens,
                        limit_tokens: status.limit_tokens,
                        usage_percent: status.usage_percent,
                    });
                    Some(UsageSummary {
                        usage_tokens: status.usage_tokens,
                        limit_tokens: status.limit_tokens,
                        usage_percent: status.usage_percent,
                    })
                } else {
                    None
                }
            }
            Err(error) => {
                tracing::warn!(%error, "post-turn limit check failed");
                None
            }
        };

        if !followups.is_empty() {
            self.bus.publish(WsEvent::FollowupSuggestions {
                conversation_id: state.conversation_id.clone(),
                suggestions: followups,
            });
        }

        self.bus.publish(WsEvent::ChatComplete {
            conversation_id: state.conversation_id.clone(),
            message_id: state.streaming_message_id,
            content: state.accumulated_tokens.clone(),
            executions,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            warning,
        });

        tracing::info!(
            conversation_id = %state.conversation_id,
            message_id = %state.streaming_message_id,
            "turn complete"
        );
    }

    /// Finalize a failed turn. Partial content is never discarded: whatever
    /// accumulated is flushed into the message store before the error event
    /// goes out. The same path runs when the stream dies mid-turn.
    async fn finalize_error(&self, mut state: StreamState, error: &Error) {
        let has_partial =
            !state.accumulated_tokens.is_empty() || !state.executions.is_empty();
        let partial_message_id = if has_partial {
            let executions = merge_chart_specs(
                std::mem::take(&mut state.executions),
                std::mem::take(&mut state.pending_chart_specs),
            );
            match self
                .store
                .insert_assistant_message(
                    state.streaming_message_id,
                    &state.conversation_id,
                    &state.accumulated_tokens,
                    &executions,
                    Some(&error.to_string()),
                )
                .await
            {
                Ok(()) => Some(state.streaming_message_id),
                Err(store_error) => {
                    tracing::error!(%store_error, "failed to flush partial content");
                    None
                }
            }
        } else {
            None
        };

        self.bus.publish(WsEvent::ChatError {
            conversation_id: state.conversation_id.clone(),
            message: error.to_string(),
            partial_message_id,
        });
    }
}

fn system_prompt(datasets: &[DatasetRef]) -> String {
    let mut prompt = String::from(
        "You are a data analyst. Answer questions by querying the user's datasets \
         with the run_sql tool, then explain the results. Attach visualizations with \
         the create_chart tool, referencing the execution index of the query to chart. \
         Queries are read-only SQL.",
    );
    if datasets.is_empty() {
        prompt.push_str("\n\nNo datasets are attached to this conversation.");
    } else {
        prompt.push_str("\n\nAttached datasets (query tables as <alias>.<table>):\n");
        for dataset in datasets {
            prompt.push_str(&format!("- {} (alias: {})\n", dataset.id, dataset.alias()));
        }
    }
    prompt
}

/// Compact tool result for the model: column names, a capped row sample, the
/// total count, and the inline error when one occurred.
fn tool_result_summary(result: &ExecutionResult) -> String {
    let columns: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    let rows: Vec<&Vec<serde_json::Value>> =
        result.rows.iter().take(TOOL_RESULT_ROW_CAP).collect();
    let truncated = result.rows.len() > TOOL_RESULT_ROW_CAP;

    match &result.error {
        Some(error) => serde_json::json!({
            "error": { "kind": error.kind, "message": error.message },
            "execution_time_ms": result.execution_time_ms,
        })
        .to_string(),
        None => serde_json::json!({
            "columns": columns,
            "rows": rows,
            "total_rows": result.total_rows,
            "rows_truncated": truncated,
            "execution_time_ms": result.execution_time_ms,
        })
        .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::events::WsEvent;
    use crate::llm::LlmEventStream;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Plays back scripted event rounds, one per `stream_turn` call.
    struct ScriptedClient {
        rounds: Mutex<VecDeque<Vec<Result<LlmEvent, LlmError>>>>,
    }

    impl ScriptedClient {
        fn new(rounds: Vec<Vec<Result<LlmEvent, LlmError>>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_turn(
            &self,
            _request: CompletionRequest,
        ) -> Result<LlmEventStream, LlmError> {
            let round = self
                .rounds
                .lock()
                .expect("rounds lock")
                .pop_front()
                .expect("scripted client ran out of rounds");
            Ok(Box::pin(futures::stream::iter(round)))
        }
    }

    /// Returns a canned execution result (or pool error) for every job.
    struct StubExecutor {
        outcome: Result<ExecutionResult, PoolError>,
    }

    #[async_trait]
    impl QueryExecutor for StubExecutor {
        async fn execute(&self, _job: QueryJob) -> Result<ExecutionResult, PoolError> {
            self.outcome.clone()
        }
    }

    fn one_row_result() -> ExecutionResult {
        ExecutionResult {
            columns: vec![crate::pool::protocol::Column {
                name: "n".into(),
                decl_type: Some("INTEGER".into()),
            }],
            rows: vec![vec![serde_json::json!(4)]],
            total_rows: 1,
            error: None,
            execution_time_ms: 3,
        }
    }

    fn completed(input: u64, output: u64) -> Result<LlmEvent, LlmError> {
        Ok(LlmEvent::Completed {
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
            followups: Vec::new(),
        })
    }

    fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Result<LlmEvent, LlmError> {
        Ok(LlmEvent::ToolCall(ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        }))
    }

    async fn build(
        rounds: Vec<Vec<Result<LlmEvent, LlmError>>>,
        executor_outcome: Result<ExecutionResult, PoolError>,
        token_limit: i64,
    ) -> Arc<ChatOrchestrator> {
        let pool = crate::db::test_pool().await;
        Arc::new(ChatOrchestrator::new(
            Arc::new(ScriptedClient::new(rounds)),
            Arc::new(StubExecutor {
                outcome: executor_outcome,
            }),
            RateLimiter::new(pool.clone(), token_limit, 80.0),
            EventBus::new(),
            MessageStore::new(pool),
            ChatSettings {
                model: "openai/test-model".into(),
                max_tool_rounds: 4,
                query_timeout_ms: 5_000,
            },
        ))
    }

    fn request(conversation: &str) -> TurnRequest {
        TurnRequest {
            user_id: "user-1".into(),
            conversation_id: conversation.into(),
            message: "how many rows?".into(),
            datasets: Vec::new(),
        }
    }

    /// Collect events for one conversation until the terminal event.
    async fn collect_turn(rx: &mut broadcast::Receiver<WsEvent>) -> Vec<WsEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event bus closed");
            let terminal = matches!(
                event,
                WsEvent::ChatComplete { .. } | WsEvent::ChatError { .. }
            );
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn plain_answer_streams_and_completes() {
        let orchestrator = build(
            vec![vec![
                Ok(LlmEvent::TextDelta("Four ".into())),
                Ok(LlmEvent::TextDelta("rows.".into())),
                completed(12, 7),
            ]],
            Ok(one_row_result()),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        let admission = orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let TurnAdmission::Accepted { message_id } = admission else {
            panic!("expected acceptance, got {admission:?}");
        };

        let events = collect_turn(&mut rx).await;
        let tokens: String = events
            .iter()
            .filter_map(|event| match event {
                WsEvent::AnswerToken { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, "Four rows.");

        match events.last().unwrap() {
            WsEvent::ChatComplete {
                message_id: completed_id,
                content,
                executions,
                input_tokens,
                output_tokens,
                warning,
                ..
            } => {
                assert_eq!(*completed_id, message_id);
                assert_eq!(content, "Four rows.");
                assert!(executions.is_empty());
                assert_eq!(*input_tokens, 12);
                assert_eq!(*output_tokens, 7);
                assert!(warning.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reasoning_phase_is_separated_from_the_answer() {
        let orchestrator = build(
            vec![vec![
                Ok(LlmEvent::ReasoningDelta("thinking...".into())),
                Ok(LlmEvent::ReasoningComplete),
                Ok(LlmEvent::TextDelta("Answer".into())),
                completed(1, 1),
            ]],
            Ok(one_row_result()),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        let kinds: Vec<&'static str> = events
            .iter()
            .map(|event| match event {
                WsEvent::ReasoningToken { .. } => "reasoning",
                WsEvent::ReasoningComplete { .. } => "reasoning_done",
                WsEvent::AnswerToken { .. } => "answer",
                WsEvent::UsageUpdate { .. } => "usage",
                WsEvent::ChatComplete { .. } => "complete",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["reasoning", "reasoning_done", "answer", "usage", "complete"]
        );
    }

    #[tokio::test]
    async fn tool_round_attaches_the_execution() {
        let orchestrator = build(
            vec![
                vec![
                    tool_call("c1", tools::RUN_SQL, serde_json::json!({ "query": "SELECT COUNT(*) AS n FROM t" })),
                    completed(10, 5),
                ],
                vec![Ok(LlmEvent::TextDelta("There are 4.".into())), completed(20, 10)],
            ],
            Ok(one_row_result()),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        assert!(events.iter().any(|event| matches!(
            event,
            WsEvent::ToolCallStart { tool, execution_index: 0, .. } if tool == tools::RUN_SQL
        )));
        let statuses: Vec<QueryStatus> = events
            .iter()
            .filter_map(|event| match event {
                WsEvent::QueryProgress { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![QueryStatus::Queued, QueryStatus::Succeeded]);

        match events.last().unwrap() {
            WsEvent::ChatComplete {
                executions,
                input_tokens,
                output_tokens,
                ..
            } => {
                assert_eq!(executions.len(), 1);
                assert_eq!(executions[0].query_text, "SELECT COUNT(*) AS n FROM t");
                assert!(executions[0].result.error.is_none());
                // Usage is summed across both LLM rounds.
                assert_eq!(*input_tokens, 30);
                assert_eq!(*output_tokens, 15);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chart_spec_merges_in_range_and_drops_out_of_range() {
        let orchestrator = build(
            vec![
                vec![
                    tool_call("c1", tools::RUN_SQL, serde_json::json!({ "query": "SELECT 1" })),
                    tool_call(
                        "c2",
                        tools::CREATE_CHART,
                        serde_json::json!({ "execution_index": 0, "chart_type": "bar" }),
                    ),
                    tool_call(
                        "c3",
                        tools::CREATE_CHART,
                        serde_json::json!({ "execution_index": 5, "chart_type": "line" }),
                    ),
                    completed(5, 5),
                ],
                vec![Ok(LlmEvent::TextDelta("Charted.".into())), completed(5, 5)],
            ],
            Ok(one_row_result()),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        // Both specs were forwarded to the client as they arrived...
        let chart_events = events
            .iter()
            .filter(|event| matches!(event, WsEvent::ChartSpec { .. }))
            .count();
        assert_eq!(chart_events, 2);

        // ...but only the in-range one is present on the finalized message.
        match events.last().unwrap() {
            WsEvent::ChatComplete { executions, .. } => {
                assert_eq!(executions.len(), 1);
                let spec = executions[0].chart_spec.as_ref().expect("merged spec");
                assert_eq!(spec.chart_type, "bar");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_execution_is_inline_not_a_turn_failure() {
        let orchestrator = build(
            vec![
                vec![
                    tool_call("c1", tools::RUN_SQL, serde_json::json!({ "query": "SELECT x" })),
                    completed(5, 5),
                ],
                vec![
                    Ok(LlmEvent::TextDelta("That column does not exist.".into())),
                    completed(5, 5),
                ],
            ],
            Err(PoolError::WorkerCrash),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        // The turn still completes; the failure is scoped to the execution.
        match events.last().unwrap() {
            WsEvent::ChatComplete { executions, .. } => {
                let error = executions[0].result.error.as_ref().expect("inline error");
                assert_eq!(error.kind, QueryErrorKind::Crash);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        let statuses: Vec<QueryStatus> = events
            .iter()
            .filter_map(|event| match event {
                WsEvent::QueryProgress { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![QueryStatus::Queued, QueryStatus::Failed]);
    }

    #[tokio::test]
    async fn denied_turn_makes_no_llm_call_and_emits_the_event() {
        // Scripted client with no rounds: any LLM call would panic.
        let orchestrator = build(vec![], Ok(one_row_result()), 1_000).await;
        orchestrator
            .limiter
            .record_usage(&"user-1".to_string(), 1_000, 0)
            .await
            .unwrap();
        let mut rx = orchestrator.bus().subscribe();

        let admission = orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        match admission {
            TurnAdmission::Denied(status) => {
                assert!(!status.allowed);
                assert_eq!(status.usage_tokens, 1_000);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WsEvent::RateLimitExceeded { usage_percent, .. } => {
                assert_eq!(usage_percent, 100.0);
            }
            other => panic!("expected rate_limit_exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_failure_flushes_partial_content_first() {
        let orchestrator = build(
            vec![vec![
                Ok(LlmEvent::TextDelta("partial answer".into())),
                Err(LlmError::StreamInterrupted("connection reset".into())),
            ]],
            Ok(one_row_result()),
            5_000_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        match events.last().unwrap() {
            WsEvent::ChatError {
                partial_message_id, ..
            } => {
                assert!(
                    partial_message_id.is_some(),
                    "partial content must be finalized before the error"
                );
            }
            other => panic!("expected chat_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_in_the_warning_band_attaches_the_warning() {
        let orchestrator = build(
            vec![vec![
                Ok(LlmEvent::TextDelta("ok".into())),
                completed(850, 0),
            ]],
            Ok(one_row_result()),
            1_000,
        )
        .await;
        let mut rx = orchestrator.bus().subscribe();

        orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        let events = collect_turn(&mut rx).await;

        assert!(events
            .iter()
            .any(|event| matches!(event, WsEvent::RateLimitWarning { .. })));
        match events.last().unwrap() {
            WsEvent::ChatComplete { warning, .. } => {
                let warning = warning.as_ref().expect("warning attached");
                assert_eq!(warning.usage_tokens, 850);
                assert!(warning.usage_percent >= 80.0);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_turn_for_a_streaming_conversation_is_busy() {
        let orchestrator = build(vec![], Ok(one_row_result()), 5_000_000).await;
        orchestrator
            .active
            .lock()
            .unwrap()
            .insert("conv-1".to_string());

        let admission = orchestrator.clone().begin_turn(request("conv-1")).await.unwrap();
        assert!(matches!(admission, TurnAdmission::Busy));
    }
}
