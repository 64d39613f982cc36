// ABOUTME: Credits status and transaction history endpoints
// ABOUTME: Read-only views over the ledger for the account screen and reconciliation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Credits routes

use crate::errors::AppResult;
use crate::models::CreditsStatusResponse;
use crate::resources::GatewayResources;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

/// Query parameters for the transaction history
#[derive(Debug, Deserialize, Default)]
pub struct TransactionsQuery {
    /// Maximum number of transactions to return
    #[serde(default = "default_limit")]
    pub limit: i64,
}

const fn default_limit() -> i64 {
    50
}

/// Credits routes handler
pub struct CreditsRoutes;

impl CreditsRoutes {
    /// Create all credits routes
    pub fn routes(resources: Arc<GatewayResources>) -> Router {
        Router::new()
            .route("/api/credits", get(Self::status))
            .route("/api/credits/transactions", get(Self::transactions))
            .with_state(resources)
    }

    /// Current balance for the authenticated user
    async fn status(
        State(resources): State<Arc<GatewayResources>>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let auth = resources.auth_manager.authenticate_request(&headers)?;

        let credits = resources
            .database
            .get_or_create_user_credits(&auth.user_id)
            .await?;

        let response = CreditsStatusResponse {
            subscription_type: credits.subscription_type,
            remaining_credits: credits.effective_remaining(Utc::now()),
            demo_credits_remaining: credits.demo_remaining(),
            credits_expire_at: credits.credits_expire_at,
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Recent transactions for the authenticated user, newest first
    async fn transactions(
        State(resources): State<Arc<GatewayResources>>,
        headers: HeaderMap,
        Query(query): Query<TransactionsQuery>,
    ) -> AppResult<Response> {
        let auth = resources.auth_manager.authenticate_request(&headers)?;

        let transactions = resources
            .database
            .list_transactions(&auth.user_id, query.limit)
            .await?;

        Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "transactions": transactions })),
        )
            .into_response())
    }
}
