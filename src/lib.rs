//! datachat: chat with tabular datasets.
//!
//! The backbone is a pool of process-isolated query workers plus a chat
//! orchestrator that drives the LLM tool-calling loop and streams events to
//! connected clients over a single realtime channel per session.

pub mod api;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod limiter;
pub mod llm;
pub mod pool;
pub mod realtime;
pub mod worker;

pub use error::{Error, Result};

use uuid::Uuid;

/// Identifies one query job submitted to the worker pool.
pub type JobId = Uuid;

/// Identifies a persisted chat message.
pub type MessageId = Uuid;

/// Conversation ids are opaque strings minted by the client/session layer.
pub type ConversationId = String;

/// User ids are opaque strings owned by the (out of scope) auth layer.
pub type UserId = String;

/// Reference to an uploaded dataset the worker can attach.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatasetRef {
    /// Stable dataset id, also used as the SQL schema alias.
    pub id: String,
    /// Path to the dataset's SQLite file on local disk.
    pub path: std::path::PathBuf,
}

impl DatasetRef {
    /// The alias a dataset is attached under. Aliases must be valid SQLite
    /// identifiers; the worker sanitizes on its side of the process boundary
    /// rather than trusting the ingestion layer to have done so.
    pub fn alias(&self) -> String {
        let mut alias: String = self
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if alias.chars().next().is_none_or(|c| c.is_ascii_digit()) {
            alias.insert(0, 'd');
        }
        alias
    }
}
