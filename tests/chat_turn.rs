//! End-to-end turn: scripted LLM, real worker pool, real SQLite dataset.
//!
//! The orchestrator unit tests stub the executor; this test drives the whole
//! path from tool call to worker process and back into the completion event.

use async_trait::async_trait;
use datachat::DatasetRef;
use datachat::chat::orchestrator::ChatSettings;
use datachat::chat::{ChatOrchestrator, MessageStore, TurnRequest};
use datachat::config::PoolConfig;
use datachat::error::LlmError;
use datachat::events::WsEvent;
use datachat::limiter::RateLimiter;
use datachat::llm::{
    CompletionClient, CompletionRequest, LlmEvent, LlmEventStream, TokenUsage, ToolCallRequest,
};
use datachat::pool::{ProcessSpawner, WorkerPool};
use datachat::realtime::EventBus;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedClient {
    rounds: Mutex<VecDeque<Vec<Result<LlmEvent, LlmError>>>>,
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn stream_turn(&self, _request: CompletionRequest) -> Result<LlmEventStream, LlmError> {
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected extra LLM round");
        Ok(Box::pin(futures::stream::iter(round)))
    }
}

#[tokio::test]
async fn a_turn_with_a_real_query_round_trips_through_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let dataset_path = dir.path().join("sales.db");
    let conn = rusqlite::Connection::open(&dataset_path).unwrap();
    conn.execute_batch(
        "CREATE TABLE orders (region TEXT, amount REAL);
         INSERT INTO orders VALUES ('east', 10.0), ('east', 5.0), ('west', 2.0);",
    )
    .unwrap();
    drop(conn);

    let pool_config = PoolConfig {
        pool_size: 1,
        queue_capacity: 8,
        memory_limit_mb: 8192,
        query_timeout_ms: 30_000,
        max_crash_requeues: 1,
        shutdown_grace_ms: 2_000,
        worker_path: None,
    };
    let pool = WorkerPool::start(
        pool_config,
        Arc::new(ProcessSpawner::new(env!("CARGO_BIN_EXE_datachat").into())),
    )
    .await
    .unwrap();

    let db = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&db).await.unwrap();

    let rounds = vec![
        vec![
            Ok(LlmEvent::ToolCall(ToolCallRequest {
                id: "call-1".into(),
                name: "run_sql".into(),
                arguments: serde_json::json!({
                    "query": "SELECT region, SUM(amount) AS total FROM sales.orders \
                              GROUP BY region ORDER BY region"
                }),
            })),
            Ok(LlmEvent::Completed {
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
                followups: Vec::new(),
            }),
        ],
        vec![
            Ok(LlmEvent::TextDelta("East leads with 15.".into())),
            Ok(LlmEvent::Completed {
                usage: TokenUsage {
                    input_tokens: 150,
                    output_tokens: 30,
                },
                followups: vec!["Break it down by month?".into()],
            }),
        ],
    ];

    let bus = EventBus::new();
    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::new(ScriptedClient {
            rounds: Mutex::new(rounds.into()),
        }),
        Arc::new(pool.clone()),
        RateLimiter::new(db.clone(), 5_000_000, 80.0),
        bus.clone(),
        MessageStore::new(db),
        ChatSettings {
            model: "openai/test".into(),
            max_tool_rounds: 4,
            query_timeout_ms: 30_000,
        },
    ));

    let mut rx = bus.subscribe();
    orchestrator
        .clone()
        .begin_turn(TurnRequest {
            user_id: "user-1".into(),
            conversation_id: "conv-e2e".into(),
            message: "Which region sells the most?".into(),
            datasets: vec![DatasetRef {
                id: "sales".into(),
                path: dataset_path,
            }],
        })
        .await
        .unwrap();

    let mut followups_seen = false;
    let complete = loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("turn timed out")
            .expect("bus closed");
        match event {
            WsEvent::FollowupSuggestions { suggestions, .. } => {
                assert_eq!(suggestions, vec!["Break it down by month?".to_string()]);
                followups_seen = true;
            }
            complete @ WsEvent::ChatComplete { .. } => break complete,
            WsEvent::ChatError { message, .. } => panic!("turn failed: {message}"),
            _ => {}
        }
    };

    assert!(followups_seen, "followup suggestions should precede completion");
    let WsEvent::ChatComplete {
        content,
        executions,
        input_tokens,
        output_tokens,
        ..
    } = complete
    else {
        unreachable!()
    };
    assert_eq!(content, "East leads with 15.");
    assert_eq!(input_tokens, 250);
    assert_eq!(output_tokens, 50);

    assert_eq!(executions.len(), 1);
    let result = &executions[0].result;
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.total_rows, 2);
    assert_eq!(result.rows[0][0], serde_json::json!("east"));
    assert_eq!(result.rows[0][1], serde_json::json!(15.0));

    pool.shutdown(Duration::from_secs(2)).await;
}
