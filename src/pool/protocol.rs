//! Wire protocol between the pool manager and worker processes.
//!
//! Frames are length-prefixed JSON: a u32 little-endian byte length followed
//! by the payload. The worker side reads synchronously from stdin and writes
//! to stdout; the manager side uses the async variants against the child's
//! pipes. Frames are capped so a malformed length header cannot trigger an
//! unbounded allocation.

use crate::{DatasetRef, JobId};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Result pages are bounded by pagination, so
/// anything larger than this is a protocol violation, not data.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One request sent to a worker. The worker executes exactly one request at a
/// time and always answers with a [`WorkerReply`] carrying the same `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Execute a read-only SQL query against the attached datasets.
    Query {
        job_id: JobId,
        query_text: String,
        dataset_refs: Vec<DatasetRef>,
        page: u32,
        page_size: u32,
    },
    /// List tables and columns for a dataset.
    Schema {
        job_id: JobId,
        dataset: DatasetRef,
    },
    /// Profile the columns of one table (null/distinct counts, min/max).
    Profile {
        job_id: JobId,
        dataset: DatasetRef,
        table: String,
    },
}

impl WorkerRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerRequest::Query { job_id, .. }
            | WorkerRequest::Schema { job_id, .. }
            | WorkerRequest::Profile { job_id, .. } => *job_id,
        }
    }
}

/// Worker answer, correlated by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerReply {
    Result {
        job_id: JobId,
        result: ExecutionResult,
    },
    Schema {
        job_id: JobId,
        schema: DatasetSchema,
    },
    Profile {
        job_id: JobId,
        profile: TableProfile,
    },
}

impl WorkerReply {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerReply::Result { job_id, .. }
            | WorkerReply::Schema { job_id, .. }
            | WorkerReply::Profile { job_id, .. } => *job_id,
        }
    }
}

/// The outcome of one query execution. Immutable once produced.
///
/// Semantic failures ride inline in `error` rather than failing the job: the
/// orchestrator surfaces them on that one execution so the model can narrate
/// around a bad query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<Column>,
    /// One page of rows; cells are typed JSON values, SQL NULL maps to JSON
    /// null and stays distinct from `0` and `""`.
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: u64,
    pub error: Option<QueryError>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// An execution that failed before producing any rows.
    pub fn failed(kind: QueryErrorKind, message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            error: Some(QueryError {
                kind,
                message: message.into(),
            }),
            execution_time_ms: elapsed_ms,
            ..Self::default()
        }
    }
}

/// A result column with its engine-native declared type, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// SQLite declared type of the source column; `None` for expressions.
    pub decl_type: Option<String>,
}

/// Stable, user-facing query error carried inline on the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

/// Error taxonomy visible on execution results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// Engine-reported problem with the query itself (unknown column, type
    /// mismatch, syntax error). Terminal for this execution, never retried.
    Semantic,
    /// The job hit its deadline and the worker was killed.
    Timeout,
    /// The worker process died while executing the job.
    Crash,
    /// Anything else: attach failure, I/O, protocol violation.
    Internal,
}

/// Dataset schema listing returned by the `schema` op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub dataset_id: String,
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub row_count: u64,
}

/// Column-level profile returned by the `profile` op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProfile {
    pub dataset_id: String,
    pub table: String,
    pub columns: Vec<ColumnProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub null_count: u64,
    pub distinct_count: u64,
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
}

/// Read one frame from a synchronous reader. `Ok(None)` means clean EOF
/// before a header; EOF mid-frame is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Write one frame to a synchronous writer and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = payload.len() as u32;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Async variant of [`read_frame`] for the manager side of a child's stdout.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Async variant of [`write_frame`] for the manager side of a child's stdin.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> io::Result<()> {
    let size = payload.len() as u32;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
