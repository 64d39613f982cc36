// ABOUTME: Credit ledger storage - balance rows, conditional atomic debits, transaction log
// ABOUTME: The WHERE-guarded UPDATE is what keeps balances non-negative under concurrency
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

use super::{parse_timestamp, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{CreditTransaction, OperationType, SubscriptionType, UserCredits};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

impl Database {
    /// Create ledger tables
    pub(super) async fn migrate_credits(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS user_credits (
                user_id TEXT PRIMARY KEY,
                total_credits INTEGER NOT NULL DEFAULT 0,
                used_credits INTEGER NOT NULL DEFAULT 0,
                remaining_credits INTEGER NOT NULL DEFAULT 0,
                demo_credits INTEGER NOT NULL DEFAULT 0,
                demo_used INTEGER NOT NULL DEFAULT 0,
                subscription_type TEXT NOT NULL DEFAULT 'demo'
                    CHECK (subscription_type IN ('free', 'demo', 'basic', 'premium', 'enterprise')),
                credits_expire_at TEXT,
                last_reset_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create user_credits: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS credit_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                conversation_id TEXT,
                message_id TEXT,
                credits_used INTEGER NOT NULL CHECK (credits_used > 0),
                operation_type TEXT NOT NULL
                    CHECK (operation_type IN ('chat', 'sql_query', 'analysis', 'export')),
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create credit_transactions: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credit_tx_user ON credit_transactions(user_id, created_at)",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to index credit_transactions: {e}")))?;

        Ok(())
    }

    /// Load a ledger row
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn get_user_credits(&self, user_id: &str) -> AppResult<Option<UserCredits>> {
        let row = sqlx::query(
            r"
            SELECT user_id, total_credits, used_credits, remaining_credits,
                   demo_credits, demo_used, subscription_type, credits_expire_at,
                   last_reset_at, created_at, updated_at
            FROM user_credits
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to load user credits: {e}")))?;

        row.map(|r| map_credits_row(&r)).transpose()
    }

    /// Load the ledger row, creating a fresh demo row when absent
    ///
    /// Creation uses `INSERT OR IGNORE` so two concurrent first requests for
    /// the same user cannot race into a constraint error.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert or the follow-up load fails.
    pub async fn get_or_create_user_credits(&self, user_id: &str) -> AppResult<UserCredits> {
        if let Some(credits) = self.get_user_credits(user_id).await? {
            return Ok(credits);
        }

        let fresh = UserCredits::new_demo(user_id);
        sqlx::query(
            r"
            INSERT OR IGNORE INTO user_credits
                (user_id, total_credits, used_credits, remaining_credits,
                 demo_credits, demo_used, subscription_type, credits_expire_at,
                 last_reset_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ",
        )
        .bind(&fresh.user_id)
        .bind(fresh.total_credits)
        .bind(fresh.used_credits)
        .bind(fresh.remaining_credits)
        .bind(fresh.demo_credits)
        .bind(fresh.demo_used)
        .bind(fresh.subscription_type.as_str())
        .bind(fresh.credits_expire_at.map(|t| t.to_rfc3339()))
        .bind(fresh.last_reset_at.to_rfc3339())
        .bind(fresh.created_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create user credits: {e}")))?;

        self.get_user_credits(user_id)
            .await?
            .ok_or_else(|| AppError::database("User credits row vanished after creation"))
    }

    /// Conditionally debit the paid balance
    ///
    /// The guard clause makes check-and-decrement a single statement: when
    /// two requests race, at most one UPDATE matches and the balance can
    /// never go negative. Expired credits never match.
    ///
    /// Returns `true` when the debit was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement itself fails.
    pub async fn try_consume_paid_credits(&self, user_id: &str, cost: u32) -> AppResult<bool> {
        let now = Utc::now().to_rfc3339();
        let cost = i64::from(cost);

        let result = sqlx::query(
            r"
            UPDATE user_credits
            SET used_credits = used_credits + $1,
                remaining_credits = remaining_credits - $1,
                updated_at = $2
            WHERE user_id = $3
              AND remaining_credits >= $1
              AND (credits_expire_at IS NULL OR credits_expire_at > $2)
            ",
        )
        .bind(cost)
        .bind(&now)
        .bind(user_id)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to consume credits: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Conditionally debit the demo counters
    ///
    /// Same single-statement guard as the paid path, against
    /// `demo_credits - demo_used`.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement itself fails.
    pub async fn try_consume_demo_credits(&self, user_id: &str, cost: u32) -> AppResult<bool> {
        let now = Utc::now().to_rfc3339();
        let cost = i64::from(cost);

        let result = sqlx::query(
            r"
            UPDATE user_credits
            SET demo_used = demo_used + $1,
                updated_at = $2
            WHERE user_id = $3
              AND demo_credits - demo_used >= $1
            ",
        )
        .bind(cost)
        .bind(&now)
        .bind(user_id)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to consume demo credits: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a transaction record to the audit log
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails. Callers treat this as
    /// best-effort: the ledger counters stay authoritative.
    pub async fn record_transaction(&self, transaction: &CreditTransaction) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO credit_transactions
                (id, user_id, conversation_id, message_id, credits_used,
                 operation_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&transaction.id)
        .bind(&transaction.user_id)
        .bind(transaction.conversation_id.as_deref())
        .bind(transaction.message_id.as_deref())
        .bind(transaction.credits_used)
        .bind(transaction.operation_type.as_str())
        .bind(transaction.metadata.to_string())
        .bind(transaction.created_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to record transaction: {e}")))?;

        Ok(())
    }

    /// Recent transactions for a user, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, conversation_id, message_id, credits_used,
                   operation_type, metadata, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list transactions: {e}")))?;

        rows.iter().map(map_transaction_row).collect()
    }

    /// Number of transactions for a user since an instant
    ///
    /// Used for the demo daily quota: the transaction log doubles as the
    /// message counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_transactions_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) as count
            FROM credit_transactions
            WHERE user_id = $1 AND created_at >= $2
            ",
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_one(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to count transactions: {e}")))?;

        Ok(row.get("count"))
    }

    /// Sum of debits for a user since an instant
    ///
    /// Offline reconciliation helper: for any user this must equal
    /// `used_credits` (paid) or `demo_used` (demo) since `last_reset_at`,
    /// modulo best-effort log appends that were lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn sum_credits_used_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(credits_used), 0) as total
            FROM credit_transactions
            WHERE user_id = $1 AND created_at >= $2
            ",
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_one(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to sum transactions: {e}")))?;

        Ok(row.get("total"))
    }

    /// Admin/test helper: replace a ledger row wholesale
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert_user_credits(&self, credits: &UserCredits) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO user_credits
                (user_id, total_credits, used_credits, remaining_credits,
                 demo_credits, demo_used, subscription_type, credits_expire_at,
                 last_reset_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT(user_id) DO UPDATE SET
                total_credits = excluded.total_credits,
                used_credits = excluded.used_credits,
                remaining_credits = excluded.remaining_credits,
                demo_credits = excluded.demo_credits,
                demo_used = excluded.demo_used,
                subscription_type = excluded.subscription_type,
                credits_expire_at = excluded.credits_expire_at,
                last_reset_at = excluded.last_reset_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&credits.user_id)
        .bind(credits.total_credits)
        .bind(credits.used_credits)
        .bind(credits.remaining_credits)
        .bind(credits.demo_credits)
        .bind(credits.demo_used)
        .bind(credits.subscription_type.as_str())
        .bind(credits.credits_expire_at.map(|t| t.to_rfc3339()))
        .bind(credits.last_reset_at.to_rfc3339())
        .bind(credits.created_at.to_rfc3339())
        .bind(credits.updated_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to upsert user credits: {e}")))?;

        Ok(())
    }
}

fn map_credits_row(row: &SqliteRow) -> AppResult<UserCredits> {
    let subscription: String = row.get("subscription_type");
    let expire_at: Option<String> = row.get("credits_expire_at");

    Ok(UserCredits {
        user_id: row.get("user_id"),
        total_credits: row.get("total_credits"),
        used_credits: row.get("used_credits"),
        remaining_credits: row.get("remaining_credits"),
        demo_credits: row.get("demo_credits"),
        demo_used: row.get("demo_used"),
        subscription_type: SubscriptionType::parse(&subscription),
        credits_expire_at: expire_at.as_deref().map(parse_timestamp).transpose()?,
        last_reset_at: parse_timestamp(row.get::<String, _>("last_reset_at").as_str())?,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_timestamp(row.get::<String, _>("updated_at").as_str())?,
    })
}

fn map_transaction_row(row: &SqliteRow) -> AppResult<CreditTransaction> {
    let operation: String = row.get("operation_type");
    let metadata: String = row.get("metadata");

    Ok(CreditTransaction {
        id: row.get("id"),
        user_id: row.get("user_id"),
        conversation_id: row.get("conversation_id"),
        message_id: row.get("message_id"),
        credits_used: row.get("credits_used"),
        operation_type: OperationType::parse(&operation),
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| AppError::database(format!("Corrupt transaction metadata: {e}")))?,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
    })
}
