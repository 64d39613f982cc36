// ABOUTME: Liveness endpoint with a database ping
// ABOUTME: Unauthenticated by design - load balancers call it
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Health route

use crate::constants::service_names;
use crate::resources::GatewayResources;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

/// Create the health route
pub fn routes(resources: Arc<GatewayResources>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(resources)
}

async fn health(State(resources): State<Arc<GatewayResources>>) -> impl IntoResponse {
    let database = match resources.database.ping().await {
        Ok(()) => "up",
        Err(_) => "down",
    };
    let status = if database == "up" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if database == "up" { "ok" } else { "degraded" },
            "service": service_names::CHIFA_GATEWAY,
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
        })),
    )
}
