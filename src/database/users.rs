// ABOUTME: Profile and pharmacy-secret lookups consumed by the orchestrator
// ABOUTME: Maps a pharmacy code to the credential bundle the agent call carries
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

use super::Database;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// User profile row (external collaborator's schema, consumed not owned)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Opaque user identifier
    pub user_id: String,
    /// Account email
    pub email: String,
    /// Pharmacy onboarding status (active, pending, suspended)
    pub pharmacy_status: String,
    /// Demo credits surfaced to the UI
    pub demo_credits_remaining: i64,
    /// Pharmacy code linking the user to their pharmacy
    pub code_ps: String,
}

/// Per-pharmacy agent credential bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PharmacySecret {
    /// Pharmacy code (lookup key)
    pub code_ps: String,
    /// Agent-side database identifier for this pharmacy
    pub db_id: String,
    /// Virtual LLM key the agent bills against
    pub litellm_virtual_key: String,
    /// Shared secret for gateway/agent communication
    pub agent_comm_jwt_secret: String,
}

impl Database {
    /// Create profile and secret tables
    pub(super) async fn migrate_profiles(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                pharmacy_status TEXT NOT NULL DEFAULT 'pending',
                demo_credits_remaining INTEGER NOT NULL DEFAULT 0,
                code_ps TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create profiles: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS pharmacy_secrets (
                code_ps TEXT PRIMARY KEY,
                db_id TEXT NOT NULL,
                litellm_virtual_key TEXT NOT NULL,
                agent_comm_jwt_secret TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create pharmacy_secrets: {e}")))?;

        Ok(())
    }

    /// Load a profile by user id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        let row = sqlx::query(
            r"
            SELECT user_id, email, pharmacy_status, demo_credits_remaining, code_ps
            FROM profiles
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to load profile: {e}")))?;

        Ok(row.map(|r| Profile {
            user_id: r.get("user_id"),
            email: r.get("email"),
            pharmacy_status: r.get("pharmacy_status"),
            demo_credits_remaining: r.get("demo_credits_remaining"),
            code_ps: r.get("code_ps"),
        }))
    }

    /// Create or replace a profile
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert_profile(&self, profile: &Profile) -> AppResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r"
            INSERT INTO profiles
                (user_id, email, pharmacy_status, demo_credits_remaining, code_ps, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                pharmacy_status = excluded.pharmacy_status,
                demo_credits_remaining = excluded.demo_credits_remaining,
                code_ps = excluded.code_ps,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&profile.user_id)
        .bind(&profile.email)
        .bind(&profile.pharmacy_status)
        .bind(profile.demo_credits_remaining)
        .bind(&profile.code_ps)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to upsert profile: {e}")))?;

        Ok(())
    }

    /// Resolve the agent credential bundle for a pharmacy code
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_pharmacy_secret(&self, code_ps: &str) -> AppResult<Option<PharmacySecret>> {
        let row = sqlx::query(
            r"
            SELECT code_ps, db_id, litellm_virtual_key, agent_comm_jwt_secret
            FROM pharmacy_secrets
            WHERE code_ps = $1
            ",
        )
        .bind(code_ps)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to load pharmacy secret: {e}")))?;

        Ok(row.map(|r| PharmacySecret {
            code_ps: r.get("code_ps"),
            db_id: r.get("db_id"),
            litellm_virtual_key: r.get("litellm_virtual_key"),
            agent_comm_jwt_secret: r.get("agent_comm_jwt_secret"),
        }))
    }

    /// Create or replace a pharmacy credential bundle
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert_pharmacy_secret(&self, secret: &PharmacySecret) -> AppResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r"
            INSERT INTO pharmacy_secrets
                (code_ps, db_id, litellm_virtual_key, agent_comm_jwt_secret, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(code_ps) DO UPDATE SET
                db_id = excluded.db_id,
                litellm_virtual_key = excluded.litellm_virtual_key,
                agent_comm_jwt_secret = excluded.agent_comm_jwt_secret
            ",
        )
        .bind(&secret.code_ps)
        .bind(&secret.db_id)
        .bind(&secret.litellm_virtual_key)
        .bind(&secret.agent_comm_jwt_secret)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to upsert pharmacy secret: {e}")))?;

        Ok(())
    }
}
