// ABOUTME: HTTP client for the external Chifa agent service (buffered and streaming)
// ABOUTME: Carries the per-pharmacy credential bundle on every outbound call
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Agent Client
//!
//! Outbound HTTP client for the model-serving agent. One call per chat
//! request: either buffered (await the full JSON answer) or streaming
//! (return the byte stream for the relay to forward).
//!
//! ## Configuration
//!
//! - `CHIFA_AGENT_URL`: Base URL of the agent service
//! - `CHIFA_AGENT_CONNECT_TIMEOUT_SECS` / `CHIFA_AGENT_TIMEOUT_SECS`

use crate::constants::limits::AGENT_TIMEOUT_SECS;
use crate::database::PharmacySecret;
use crate::errors::{AppError, AppResult};
use crate::models::IncomingMessage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Environment variable for the agent base URL
const AGENT_URL_ENV: &str = "CHIFA_AGENT_URL";

/// Environment variable for the connection timeout
const AGENT_CONNECT_TIMEOUT_ENV: &str = "CHIFA_AGENT_CONNECT_TIMEOUT_SECS";

/// Environment variable for the request timeout
const AGENT_TIMEOUT_ENV: &str = "CHIFA_AGENT_TIMEOUT_SECS";

/// Default agent endpoint for local development
const DEFAULT_AGENT_URL: &str = "http://localhost:8001";

/// Connection timeout default
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the agent client
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the agent service
    pub base_url: String,
    /// Connection timeout
    pub connect_timeout_secs: u64,
    /// End-to-end request timeout (also the server-side stream bound)
    pub request_timeout_secs: u64,
}

impl AgentConfig {
    /// Read configuration from the environment
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = env::var(AGENT_URL_ENV).unwrap_or_else(|_| DEFAULT_AGENT_URL.to_owned());
        let connect_timeout_secs = env::var(AGENT_CONNECT_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        let request_timeout_secs = env::var(AGENT_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(AGENT_TIMEOUT_SECS);

        Self {
            base_url,
            connect_timeout_secs,
            request_timeout_secs,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_AGENT_URL.to_owned(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: AGENT_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Per-pharmacy credential bundle carried on every agent call
#[derive(Debug, Clone, Serialize)]
pub struct AgentCredentials {
    /// Agent-side database identifier
    pub db_id: String,
    /// Virtual LLM key the agent bills against
    pub litellm_virtual_key: String,
    /// Shared secret for gateway/agent communication
    pub agent_comm_jwt_secret: String,
}

impl From<PharmacySecret> for AgentCredentials {
    fn from(secret: PharmacySecret) -> Self {
        Self {
            db_id: secret.db_id,
            litellm_virtual_key: secret.litellm_virtual_key,
            agent_comm_jwt_secret: secret.agent_comm_jwt_secret,
        }
    }
}

/// Outbound request body for the agent service
#[derive(Debug, Serialize)]
struct AgentWireRequest<'a> {
    messages: &'a [IncomingMessage],
    db_id: &'a str,
    litellm_virtual_key: &'a str,
    agent_comm_jwt_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

/// Model parameters forwarded verbatim from the inbound request
#[derive(Debug, Clone, Default)]
pub struct AgentCallParams {
    /// Model override
    pub model: Option<String>,
    /// Sampling temperature override
    pub temperature: Option<f32>,
    /// Completion length cap override
    pub max_tokens: Option<u32>,
}

/// Buffered answer from the agent service
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    /// Assistant answer text
    pub response: String,
    /// SQL the agent generated/executed, when applicable
    #[serde(default)]
    pub sql_query: Option<String>,
    /// Structured SQL results, when applicable
    #[serde(default)]
    pub results: Option<serde_json::Value>,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the external agent service
#[derive(Clone)]
pub struct AgentClient {
    client: Client,
    config: AgentConfig,
}

impl AgentClient {
    /// Create a client with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: AgentConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Create a client from environment configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_env() -> AppResult<Self> {
        Self::new(AgentConfig::from_env())
    }

    /// The chat endpoint URL
    #[must_use]
    pub fn chat_url(&self) -> String {
        format!("{}/chifa", self.config.base_url.trim_end_matches('/'))
    }

    fn connect_error(e: &reqwest::Error) -> AppError {
        error!("agent request failed: {e}");
        if e.is_timeout() {
            AppError::new(
                crate::errors::ErrorCode::StreamTimeout,
                "Agent request timed out",
            )
        } else {
            // The fixed body text is part of the client contract
            AppError::agent_unavailable("Failed to connect to Chifa agent service")
        }
    }

    /// Buffered chat completion
    ///
    /// # Errors
    ///
    /// `AgentUnavailable` on network/timeout failure, `AgentError` carrying
    /// the status and body on a non-2xx response, `StreamParseError` when
    /// the 2xx body is not the expected JSON.
    #[instrument(skip_all, fields(pharmacy = %credentials.db_id))]
    pub async fn complete(
        &self,
        messages: &[IncomingMessage],
        credentials: &AgentCredentials,
        params: &AgentCallParams,
    ) -> AppResult<AgentResponse> {
        let body = AgentWireRequest {
            messages,
            db_id: &credentials.db_id,
            litellm_virtual_key: &credentials.litellm_virtual_key,
            agent_comm_jwt_secret: &credentials.agent_comm_jwt_secret,
            model: params.model.as_deref(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: false,
        };

        debug!(messages = messages.len(), "sending buffered agent request");

        let response = self
            .client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::connect_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::agent_unavailable(format!("Failed to read agent response: {e}")))?;

        if !status.is_success() {
            return Err(AppError::agent_error(status.as_u16(), text));
        }

        serde_json::from_str(&text).map_err(|e| {
            AppError::new(
                crate::errors::ErrorCode::StreamParseError,
                format!("Failed to parse agent response: {e}"),
            )
        })
    }

    /// Streaming chat completion
    ///
    /// Returns the raw HTTP response once the connection is established; the
    /// streaming relay owns status handling and byte forwarding from there.
    ///
    /// # Errors
    ///
    /// `AgentUnavailable` on network/timeout failure only - a non-2xx
    /// response is returned, not raised, so the relay can forward the error
    /// payload downstream.
    #[instrument(skip_all, fields(pharmacy = %credentials.db_id))]
    pub async fn complete_stream(
        &self,
        messages: &[IncomingMessage],
        credentials: &AgentCredentials,
        params: &AgentCallParams,
    ) -> AppResult<reqwest::Response> {
        let body = AgentWireRequest {
            messages,
            db_id: &credentials.db_id,
            litellm_virtual_key: &credentials.litellm_virtual_key,
            agent_comm_jwt_secret: &credentials.agent_comm_jwt_secret,
            model: params.model.as_deref(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: true,
        };

        debug!(messages = messages.len(), "sending streaming agent request");

        self.client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::connect_error(&e))
    }
}
