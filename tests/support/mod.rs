// ABOUTME: Shared test harness - in-memory gateway wired to a mock agent server
// ABOUTME: Seeds a pharmacy profile/secret pair and issues test bearer tokens

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chifa_gateway::agent::{AgentClient, AgentConfig};
use chifa_gateway::auth::AuthManager;
use chifa_gateway::database::{Database, PharmacySecret, Profile};
use chifa_gateway::resources::GatewayResources;
use chifa_gateway::routes;
use chifa_gateway::streaming::StreamerConfig;
use std::sync::Arc;
use tower::ServiceExt;

/// Pharmacy code every seeded test user belongs to
pub const TEST_PHARMACY: &str = "PS123";

/// Gateway wired to an in-memory store and a mock agent
pub struct TestApp {
    pub router: Router,
    pub resources: Arc<GatewayResources>,
    pub auth: AuthManager,
}

/// Build a gateway instance pointed at `agent_url`
pub async fn spawn_app(agent_url: &str) -> TestApp {
    let database = Database::new("sqlite::memory:").await.unwrap();

    database
        .upsert_profile(&Profile {
            user_id: "u1".to_owned(),
            email: "pharmacien@example.fr".to_owned(),
            pharmacy_status: "active".to_owned(),
            demo_credits_remaining: 10,
            code_ps: TEST_PHARMACY.to_owned(),
        })
        .await
        .unwrap();
    database
        .upsert_pharmacy_secret(&PharmacySecret {
            code_ps: TEST_PHARMACY.to_owned(),
            db_id: "db-ps123".to_owned(),
            litellm_virtual_key: "vk-test".to_owned(),
            agent_comm_jwt_secret: "agent-secret".to_owned(),
        })
        .await
        .unwrap();

    let auth = AuthManager::with_default_expiry(b"test-secret".to_vec());
    let agent = AgentClient::new(AgentConfig {
        base_url: agent_url.to_owned(),
        connect_timeout_secs: 2,
        request_timeout_secs: 5,
    })
    .unwrap();

    let resources = Arc::new(GatewayResources::new(
        database,
        auth.clone(),
        agent,
        StreamerConfig::default(),
        4,
    ));

    TestApp {
        router: routes::router(Arc::clone(&resources)),
        resources,
        auth,
    }
}

impl TestApp {
    /// Issue a bearer token for a user
    pub fn token(&self, user_id: &str) -> String {
        self.auth
            .generate_token(user_id, "pharmacien@example.fr")
            .unwrap()
    }

    /// POST /api/chat and return the raw response
    pub async fn post_chat_raw(
        &self,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Response<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        self.router.clone().oneshot(request).await.unwrap()
    }

    /// POST /api/chat and decode the JSON body
    pub async fn post_chat(
        &self,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = self.post_chat_raw(token, body).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    /// GET a path with a bearer token and decode the JSON body
    pub async fn get_json(&self, token: &str, path: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

/// Current-shape chat body for one user message
pub fn chat_body(content: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "messages": [{"role": "user", "content": content}],
        "user_id": "u1",
        "pharmacy_id": TEST_PHARMACY,
        "stream": stream,
    })
}

/// Wait until `predicate` returns true, for post-stream bookkeeping
pub async fn wait_for<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}
