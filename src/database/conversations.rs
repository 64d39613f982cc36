// ABOUTME: Conversation and message storage consumed by the chat orchestrator
// ABOUTME: Messages carry extracted SQL query/results alongside the raw content
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

use super::Database;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

// ============================================================================
// Record Types
// ============================================================================

/// Database representation of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Unique conversation ID
    pub id: String,
    /// User who owns the conversation
    pub user_id: String,
    /// Pharmacy code the conversation is scoped to
    pub pharmacy_id: String,
    /// Conversation title (derived from the first message)
    pub title: String,
    /// Model used for this conversation
    pub model: String,
    /// Lifecycle status (active, archived)
    pub status: String,
    /// When the conversation was created (ISO 8601)
    pub created_at: String,
    /// When the conversation last saw activity (ISO 8601)
    pub updated_at: String,
}

/// Database representation of a chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message ID
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Role of the sender (user, assistant)
    pub role: String,
    /// Message content
    pub content: String,
    /// Extracted SQL query, for assistant messages that produced one
    pub sql_query: Option<String>,
    /// Structured SQL results as JSON text
    pub sql_results: Option<String>,
    /// Credits charged for this exchange
    pub credits_cost: Option<i64>,
    /// Wall-clock processing time of the agent call
    pub processing_time_ms: Option<i64>,
    /// When the message was created (ISO 8601)
    pub created_at: String,
}

/// Summary of a conversation for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation ID
    pub id: String,
    /// Conversation title
    pub title: String,
    /// Model used
    pub model: String,
    /// Lifecycle status
    pub status: String,
    /// Number of messages
    pub message_count: i64,
    /// When the conversation was created
    pub created_at: String,
    /// When the conversation last saw activity
    pub updated_at: String,
}

/// Fields of a message about to be appended
#[derive(Debug, Clone, Default)]
pub struct NewMessage<'a> {
    /// Sender role (user, assistant)
    pub role: &'a str,
    /// Message content
    pub content: &'a str,
    /// Extracted SQL query, if any
    pub sql_query: Option<&'a str>,
    /// Structured SQL results, if any
    pub sql_results: Option<&'a serde_json::Value>,
    /// Credits charged for the exchange, if settled
    pub credits_cost: Option<i64>,
    /// Agent processing time, if measured
    pub processing_time_ms: Option<i64>,
}

// ============================================================================
// Operations
// ============================================================================

impl Database {
    /// Create conversation and message tables
    pub(super) async fn migrate_conversations(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                pharmacy_id TEXT NOT NULL,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversations: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sql_query TEXT,
                sql_results TEXT,
                credits_cost INTEGER,
                processing_time_ms INTEGER,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create messages: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at)",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to index conversations: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to index messages: {e}")))?;

        Ok(())
    }

    /// Create a new conversation
    ///
    /// # Errors
    ///
    /// Returns `ConversationCreateFailed` - the one persistence failure the
    /// orchestrator treats as fatal, because without a conversation id the
    /// client cannot continue the thread.
    pub async fn create_conversation(
        &self,
        user_id: &str,
        pharmacy_id: &str,
        title: &str,
        model: &str,
    ) -> AppResult<ConversationRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO conversations (id, user_id, pharmacy_id, title, model, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $6)
            ",
        )
        .bind(&id)
        .bind(user_id)
        .bind(pharmacy_id)
        .bind(title)
        .bind(model)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            AppError::new(
                crate::errors::ErrorCode::ConversationCreateFailed,
                format!("Failed to create conversation: {e}"),
            )
            .with_user_id(user_id)
        })?;

        Ok(ConversationRecord {
            id,
            user_id: user_id.to_owned(),
            pharmacy_id: pharmacy_id.to_owned(),
            title: title.to_owned(),
            model: model.to_owned(),
            status: "active".to_owned(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a conversation by ID with ownership check
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Option<ConversationRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, pharmacy_id, title, model, status, created_at, updated_at
            FROM conversations
            WHERE id = $1 AND user_id = $2
            ",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to get conversation: {e}")))?;

        Ok(row.map(|r| ConversationRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            pharmacy_id: r.get("pharmacy_id"),
            title: r.get("title"),
            model: r.get("model"),
            status: r.get("status"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// List a user's conversations with pagination, most recent first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r"
            SELECT c.id, c.title, c.model, c.status, c.created_at, c.updated_at,
                   COUNT(m.id) as message_count
            FROM conversations c
            LEFT JOIN messages m ON m.conversation_id = c.id
            WHERE c.user_id = $1
            GROUP BY c.id
            ORDER BY c.updated_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list conversations: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| ConversationSummary {
                id: r.get("id"),
                title: r.get("title"),
                model: r.get("model"),
                status: r.get("status"),
                message_count: r.get("message_count"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Append a message and touch the conversation's activity timestamp
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        message: NewMessage<'_>,
    ) -> AppResult<MessageRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let sql_results_text = message.sql_results.map(ToString::to_string);

        sqlx::query(
            r"
            INSERT INTO messages
                (id, conversation_id, role, content, sql_query, sql_results,
                 credits_cost, processing_time_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(message.role)
        .bind(message.content)
        .bind(message.sql_query)
        .bind(sql_results_text.as_deref())
        .bind(message.credits_cost)
        .bind(message.processing_time_ms)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to add message: {e}")))?;

        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(&now)
            .bind(conversation_id)
            .execute(self.pool())
            .await
            .map_err(|e| {
                AppError::database(format!("Failed to update conversation timestamp: {e}"))
            })?;

        Ok(MessageRecord {
            id,
            conversation_id: conversation_id.to_owned(),
            role: message.role.to_owned(),
            content: message.content.to_owned(),
            sql_query: message.sql_query.map(ToOwned::to_owned),
            sql_results: sql_results_text,
            credits_cost: message.credits_cost,
            processing_time_ms: message.processing_time_ms,
            created_at: now,
        })
    }

    /// All messages of a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_messages(&self, conversation_id: &str) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, sql_query, sql_results,
                   credits_cost, processing_time_ms, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to get messages: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| MessageRecord {
                id: r.get("id"),
                conversation_id: r.get("conversation_id"),
                role: r.get("role"),
                content: r.get("content"),
                sql_query: r.get("sql_query"),
                sql_results: r.get("sql_results"),
                credits_cost: r.get("credits_cost"),
                processing_time_ms: r.get("processing_time_ms"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Message count for a conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_messages(&self, conversation_id: &str) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| AppError::database(format!("Failed to count messages: {e}")))?;

        Ok(row.get("count"))
    }
}
