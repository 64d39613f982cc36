// ABOUTME: Streaming relay tests - byte forwarding, failure contracts, deferred settlement
// ABOUTME: Drives the full router plus the OptimizedStreamer against a mock agent

mod support;

use axum::http::StatusCode;
use chifa_gateway::errors::ErrorCode;
use chifa_gateway::streaming::{OptimizedStreamer, StreamerConfig};
use futures_util::StreamExt;
use std::time::Duration;
use support::{chat_body, spawn_app, wait_for};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn app_with_stream_body(body: &str) -> (support::TestApp, MockServer) {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chifa"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;
    (spawn_app(&mock_server.uri()).await, mock_server)
}

#[tokio::test]
async fn test_streaming_happy_path_relays_bytes_and_settles() {
    let answer = "Voici la situation du stock de votre officine.";
    let (app, _server) = app_with_stream_body(answer).await;
    let token = app.token("u1");

    let response = app
        .post_chat_raw(Some(&token), &chat_body("Etat du stock ?", true))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let conversation_id = response
        .headers()
        .get("X-Conversation-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    assert!(!conversation_id.is_empty());

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&bytes), answer);

    // Bookkeeping runs after the drain, concurrently with the relay's end.
    // The assistant message is the last step, so its presence implies the
    // debit landed too.
    wait_for(|| async {
        app.resources
            .database
            .count_messages(&conversation_id)
            .await
            .map(|n| n == 2)
            .unwrap_or(false)
    })
    .await;

    let transactions = app.resources.database.list_transactions("u1", 10).await.unwrap();
    assert_eq!(transactions[0].credits_used, 1);
    assert_eq!(transactions[0].metadata["streaming"], true);
    assert!(transactions[0].metadata["authorization_id"].is_string());
    assert_eq!(
        transactions[0].conversation_id.as_deref(),
        Some(conversation_id.as_str())
    );

    let messages = app
        .resources
        .database
        .get_messages(&conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, answer);
}

#[tokio::test]
async fn test_streaming_sql_answer_gets_surcharge() {
    let answer = "```sql\nSELECT COUNT(*) FROM ventes;\n```";
    let (app, _server) = app_with_stream_body(answer).await;
    let token = app.token("u1");

    let response = app
        .post_chat_raw(Some(&token), &chat_body("Nombre de ventes ?", true))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let conversation_id = response
        .headers()
        .get("X-Conversation-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    // Drain the body so the relay completes
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    wait_for(|| async {
        app.resources
            .database
            .count_messages(&conversation_id)
            .await
            .map(|n| n == 2)
            .unwrap_or(false)
    })
    .await;

    let transactions = app.resources.database.list_transactions("u1", 10).await.unwrap();
    assert_eq!(
        transactions[0].operation_type,
        chifa_gateway::models::OperationType::SqlQuery
    );
    // 1 streaming base + 2 SQL surcharge
    assert_eq!(transactions[0].credits_used, 3);

    let messages = app
        .resources
        .database
        .get_messages(&conversation_id)
        .await
        .unwrap();
    assert!(messages[1].sql_query.as_deref().unwrap().starts_with("SELECT"));
}

#[tokio::test]
async fn test_streaming_empty_upstream_body_fails_before_bytes() {
    // Scenario: the agent accepts the request but sends no body at all
    let (app, _server) = app_with_stream_body("").await;
    let token = app.token("u1");

    let (status, body) = app.post_chat(Some(&token), &chat_body("Bonjour", true)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to connect to Chifa agent service");

    // No bookkeeping ran
    tokio::time::sleep(Duration::from_millis(200)).await;
    let transactions = app.resources.database.list_transactions("u1", 10).await.unwrap();
    assert!(transactions.is_empty());
}

#[tokio::test]
async fn test_streaming_upstream_error_is_forwarded_as_event() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chifa"))
        .respond_with(
            ResponseTemplate::new(503).set_body_string(r#"{"detail":"agent surcharge"}"#),
        )
        .mount(&mock_server)
        .await;
    let app = spawn_app(&mock_server.uri()).await;
    let token = app.token("u1");

    let response = app
        .post_chat_raw(Some(&token), &chat_body("Bonjour", true))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("data: "));
    assert!(text.contains("agent surcharge"));
    assert!(text.ends_with("\n\n"));

    // Bookkeeping skipped entirely
    tokio::time::sleep(Duration::from_millis(200)).await;
    let transactions = app.resources.database.list_transactions("u1", 10).await.unwrap();
    assert!(transactions.is_empty());
    let messages = app
        .resources
        .database
        .list_conversations("u1", 10, 0)
        .await
        .unwrap();
    // The conversation was created up front (its id already went out in the
    // header contract), but no messages were written into it
    assert!(messages.iter().all(|c| c.message_count == 0));
}

#[tokio::test]
async fn test_demo_streaming_message_length_policy() {
    let (app, _server) = app_with_stream_body("ok").await;
    let token = app.token("u1");

    let long_message = "x".repeat(1001);
    let (status, _body) = app
        .post_chat(Some(&token), &chat_body(&long_message, true))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let transactions = app.resources.database.list_transactions("u1", 10).await.unwrap();
    assert!(transactions.is_empty());
}

// ============================================================================
// OptimizedStreamer internals against a live upstream
// ============================================================================

#[tokio::test]
async fn test_relay_buffers_chunks_and_reports_metrics() {
    let payload = "a".repeat(3000);
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(payload.clone()))
        .mount(&mock_server)
        .await;

    let upstream = reqwest::get(format!("{}/stream", mock_server.uri()))
        .await
        .unwrap();

    let streamer = OptimizedStreamer::new(StreamerConfig {
        chunk_buffer_bytes: 1024,
        max_retries: 0,
        retry_backoff: Duration::from_millis(1),
    });

    let (tx, rx) = tokio::sync::oneshot::channel();
    let relay = streamer.relay(upstream, 2, move |full_text, metrics| async move {
        let _ = tx.send((full_text, metrics));
    });

    futures_util::pin_mut!(relay);
    let mut collected = Vec::new();
    while let Some(chunk) = relay.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8_lossy(&collected), payload);

    let (full_text, metrics) = rx.await.unwrap();
    assert_eq!(full_text, payload);
    assert_eq!(metrics.bytes_transferred, 3000);
    assert!(metrics.chunk_count >= 1);
    assert_eq!(metrics.retry_count, 2);
    assert!(metrics.duration > Duration::ZERO);
}

#[tokio::test]
async fn test_connect_retry_recovers_from_transient_failures() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string("late success"))
        .mount(&mock_server)
        .await;

    let streamer = OptimizedStreamer::new(StreamerConfig {
        chunk_buffer_bytes: 1024,
        max_retries: 3,
        retry_backoff: Duration::from_millis(10),
    });

    let uri = mock_server.uri();
    let mut attempts = 0u32;
    let (response, retries) = streamer
        .connect_with_retry(|| {
            attempts += 1;
            let uri = uri.clone();
            let fail = attempts <= 2;
            async move {
                if fail {
                    Err(chifa_gateway::errors::AppError::agent_unavailable(
                        "transient",
                    ))
                } else {
                    reqwest::get(format!("{uri}/stream")).await.map_err(|e| {
                        chifa_gateway::errors::AppError::agent_unavailable(e.to_string())
                    })
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(retries, 2);
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_last_error() {
    let streamer = OptimizedStreamer::new(StreamerConfig {
        chunk_buffer_bytes: 1024,
        max_retries: 2,
        retry_backoff: Duration::from_millis(5),
    });

    let mut attempts = 0u32;
    let result = streamer
        .connect_with_retry(|| {
            attempts += 1;
            async move {
                Err::<reqwest::Response, _>(chifa_gateway::errors::AppError::agent_unavailable(
                    "down",
                ))
            }
        })
        .await;

    let error = result.unwrap_err();
    assert_eq!(error.code, ErrorCode::AgentUnavailable);
    assert_eq!(attempts, 3);
}
