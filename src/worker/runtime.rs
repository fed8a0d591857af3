//! Worker main loop: framed requests on stdin, framed replies on stdout.
//!
//! The worker is synchronous and single-threaded: it executes
//! exactly one job at a time and the pool manager owns all scheduling,
//! deadlines, and process lifecycle. Cancellation is the manager killing this
//! process; there is no in-worker cancellation path.

use crate::pool::protocol::{self, ExecutionResult, WorkerReply, WorkerRequest};
use crate::worker::engine::Engine;
use anyhow::Context as _;
use std::io::{self, Write as _};

/// Run the worker loop until stdin closes (clean shutdown) or a protocol
/// error occurs (the manager sees the exit and treats it as a crash).
pub fn run() -> anyhow::Result<()> {
    let mut engine = Engine::new()
        .map_err(|err| anyhow::anyhow!(err.message))
        .context("failed to initialize query engine")?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    tracing::info!(pid = std::process::id(), "query worker ready");

    while let Some(frame) = protocol::read_frame(&mut reader).context("reading request frame")? {
        let request: WorkerRequest =
            serde_json::from_slice(&frame).context("decoding request frame")?;
        let reply = handle_request(&mut engine, request);
        let payload = serde_json::to_vec(&reply).context("encoding reply frame")?;
        protocol::write_frame(&mut writer, &payload).context("writing reply frame")?;
    }

    writer.flush().ok();
    tracing::info!("stdin closed, worker exiting");
    Ok(())
}

fn handle_request(engine: &mut Engine, request: WorkerRequest) -> WorkerReply {
    match request {
        WorkerRequest::Query {
            job_id,
            query_text,
            dataset_refs,
            page,
            page_size,
        } => {
            tracing::debug!(%job_id, page, page_size, "executing query");
            let result = engine.execute_query(&query_text, &dataset_refs, page, page_size);
            WorkerReply::Result { job_id, result }
        }
        WorkerRequest::Schema { job_id, dataset } => match engine.schema(&dataset) {
            Ok(schema) => WorkerReply::Schema { job_id, schema },
            Err(error) => WorkerReply::Result {
                job_id,
                result: ExecutionResult::failed(error.kind, error.message, 0),
            },
        },
        WorkerRequest::Profile {
            job_id,
            dataset,
            table,
        } => match engine.profile(&dataset, &table) {
            Ok(profile) => WorkerReply::Profile { job_id, profile },
            Err(error) => WorkerReply::Result {
                job_id,
                result: ExecutionResult::failed(error.kind, error.message, 0),
            },
        },
    }
}
