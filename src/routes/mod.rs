// ABOUTME: HTTP route assembly for the gateway
// ABOUTME: Merges chat, credits, and health routers under shared middleware layers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! HTTP routes

pub mod chat;
pub mod credits;
pub mod health;

use crate::resources::GatewayResources;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Build the full application router
#[must_use]
pub fn router(resources: Arc<GatewayResources>) -> Router {
    Router::new()
        .merge(chat::ChatRoutes::routes(Arc::clone(&resources)))
        .merge(credits::CreditsRoutes::routes(Arc::clone(&resources)))
        .merge(health::routes(resources))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}
