//! Finalized-message persistence.
//!
//! Only completed turns land here: the full accumulated content with its
//! resolved executions, or the partial content flushed when a turn errors
//! out. In-flight streaming state never touches the database.

use crate::error::DbError;
use crate::events::SqlExecution;
use crate::{ConversationId, MessageId, Result};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a finalized assistant message. `error` is set when the turn
    /// ended in `chat_error` and this row holds the flushed partial content.
    pub async fn insert_assistant_message(
        &self,
        message_id: MessageId,
        conversation_id: &ConversationId,
        content: &str,
        executions: &[SqlExecution],
        error: Option<&str>,
    ) -> Result<()> {
        let executions_json = if executions.is_empty() {
            None
        } else {
            Some(serde_json::to_string(executions).map_err(anyhow::Error::from)?)
        };

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, executions, error, created_at) \
             VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6)",
        )
        .bind(message_id.to_string())
        .bind(conversation_id)
        .bind(content)
        .bind(executions_json)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(())
    }

    /// Persist a user message for the conversation record.
    pub async fn insert_user_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<MessageId> {
        let message_id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) \
             VALUES (?1, ?2, 'user', ?3, ?4)",
        )
        .bind(message_id.to_string())
        .bind(conversation_id)
        .bind(content)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(message_id)
    }
}
