// ABOUTME: Chat route handlers - the buffered and streaming faces of the orchestrator
// ABOUTME: Accepts current and legacy body shapes, normalized before any business logic
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Chat routes
//!
//! `POST /api/chat` runs one exchange with the agent, buffered or streamed.
//! The read-only conversation endpoints let clients rebuild their thread
//! list. All handlers require JWT authentication.

use crate::auth::AuthResult;
use crate::errors::{AppError, AppResult};
use crate::models::{ChatApiResponse, ChatRequestBody, NormalizedChatRequest};
use crate::resources::GatewayResources;
use crate::streaming::error_event;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Header carrying the conversation id on streamed responses
const CONVERSATION_ID_HEADER: &str = "X-Conversation-Id";

/// Query parameters for listing conversations
#[derive(Debug, Deserialize, Default)]
pub struct ListConversationsQuery {
    /// Maximum number of conversations to return
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

const fn default_limit() -> i64 {
    20
}

/// Chat routes handler
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create all chat routes
    pub fn routes(resources: Arc<GatewayResources>) -> Router {
        Router::new()
            .route("/api/chat", post(Self::chat))
            .route("/api/chat/conversations", get(Self::list_conversations))
            .route(
                "/api/chat/conversations/:conversation_id/messages",
                get(Self::get_messages),
            )
            .with_state(resources)
    }

    // ========================================================================
    // POST /api/chat
    // ========================================================================

    /// One chat exchange: authenticate, normalize, dispatch buffered/stream
    async fn chat(
        State(resources): State<Arc<GatewayResources>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Result<Response, AppError> {
        let auth = resources.auth_manager.authenticate_request(&headers)?;

        let body: ChatRequestBody = serde_json::from_value(body)
            .map_err(|_| AppError::bad_request("Invalid messages format"))?;
        let request = body.normalize()?;

        info!(
            user_id = %auth.user_id,
            pharmacy = %request.pharmacy_id,
            stream = request.stream,
            messages = request.messages.len(),
            "chat request received"
        );

        if request.stream {
            Self::chat_stream(resources, auth, request).await
        } else {
            let outcome = resources.orchestrator.handle_buffered(&auth, &request).await?;
            let response = ChatApiResponse {
                response: outcome.response,
                sql_query: outcome.sql_query,
                sql_results: outcome.sql_results,
                conversation_id: Some(outcome.conversation_id),
            };
            Ok((StatusCode::OK, Json(response)).into_response())
        }
    }

    /// Streaming path: relay agent bytes while bookkeeping runs at drain
    async fn chat_stream(
        resources: Arc<GatewayResources>,
        auth: AuthResult,
        request: NormalizedChatRequest,
    ) -> Result<Response, AppError> {
        let permit = resources.stream_pool.try_acquire()?;
        let context = resources.orchestrator.prepare_stream(&auth, &request).await?;

        let started = Instant::now();
        let (upstream, retry_count) = resources
            .streamer
            .connect_with_retry(|| {
                resources
                    .orchestrator
                    .open_agent_stream(&request, &context.credentials)
            })
            .await?;

        // Upstream refused: forward its payload as one SSE-style event and
        // close. No bytes of an answer went out, no bookkeeping runs.
        let status = upstream.status();
        if !status.is_success() {
            let payload = upstream.text().await.unwrap_or_default();
            info!(status = status.as_u16(), "agent stream refused, forwarding error event");
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(CONVERSATION_ID_HEADER, context.conversation.id.clone())
                .body(Body::from(error_event(&payload)))
                .map_err(|e| AppError::internal(format!("Failed to build response: {e}")));
        }

        // A dead body means there is nothing to relay; fail the whole
        // request before the client sees a 200
        if upstream.content_length() == Some(0) {
            return Err(
                AppError::agent_unavailable("Failed to connect to Chifa agent service")
                    .with_user_id(&auth.user_id),
            );
        }

        let conversation_id = context.conversation.id.clone();
        let orchestrator = resources.orchestrator.clone();
        let relay = resources.streamer.relay(upstream, retry_count, {
            let auth = auth.clone();
            let request = request.clone();
            move |full_text, metrics| async move {
                let processing_ms = started.elapsed().as_millis() as u64;
                info!(
                    user_id = %auth.user_id,
                    bytes = metrics.bytes_transferred,
                    chunks = metrics.chunk_count,
                    retries = metrics.retry_count,
                    processing_ms,
                    "stream drained, running settlement"
                );
                orchestrator
                    .settle_stream(&auth, &request, &context, &full_text, processing_ms)
                    .await;
            }
        });

        // The pool permit lives exactly as long as the relayed body
        let guarded = async_stream::stream! {
            let _permit = permit;
            futures_util::pin_mut!(relay);
            while let Some(item) = relay.next().await {
                yield item;
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(CONVERSATION_ID_HEADER, conversation_id)
            .body(Body::from_stream(guarded))
            .map_err(|e| AppError::internal(format!("Failed to build response: {e}")))
    }

    // ========================================================================
    // Read-only conversation endpoints
    // ========================================================================

    /// List the caller's conversations
    async fn list_conversations(
        State(resources): State<Arc<GatewayResources>>,
        headers: HeaderMap,
        Query(query): Query<ListConversationsQuery>,
    ) -> AppResult<Response> {
        let auth = resources.auth_manager.authenticate_request(&headers)?;

        let conversations = resources
            .database
            .list_conversations(&auth.user_id, query.limit, query.offset)
            .await?;

        let total = conversations.len();
        Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "conversations": conversations,
                "total": total,
            })),
        )
            .into_response())
    }

    /// Fetch one conversation's messages, with ownership check
    async fn get_messages(
        State(resources): State<Arc<GatewayResources>>,
        headers: HeaderMap,
        Path(conversation_id): Path<String>,
    ) -> AppResult<Response> {
        let auth = resources.auth_manager.authenticate_request(&headers)?;

        resources
            .database
            .get_conversation(&conversation_id, &auth.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        let messages = resources.database.get_messages(&conversation_id).await?;

        Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "messages": messages })),
        )
            .into_response())
    }
}
