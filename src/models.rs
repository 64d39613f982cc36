// ABOUTME: Core domain models for credits, transactions, and chat request/response shapes
// ABOUTME: Normalizes the two accepted inbound body shapes into one canonical request
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Domain Models
//!
//! Data structures shared across the gateway: the credit ledger rows, the
//! transaction log entries, and the inbound/outbound chat API shapes.
//!
//! The chat endpoint accepts two body shapes - the current one (full message
//! history) and a legacy one (single `query` string). Both are modeled as an
//! untagged union discriminated by the presence of a `messages` array and
//! normalized at the boundary before any business logic runs.

use crate::constants::limits::DEMO_TRIAL_CREDITS;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Subscription & Operation Kinds
// ============================================================================

/// Subscription plan of a pharmacy account
///
/// Determines which counter pair (demo vs paid) governs authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Registered, no plan yet
    Free,
    /// Trial account metered on the demo counters
    Demo,
    /// Paid entry plan
    Basic,
    /// Paid mid plan
    Premium,
    /// Paid top plan
    Enterprise,
}

impl SubscriptionType {
    /// String form stored in the ledger row
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Demo => "demo",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "free" => Self::Free,
            "basic" => Self::Basic,
            "premium" => Self::Premium,
            "enterprise" => Self::Enterprise,
            _ => Self::Demo,
        }
    }

    /// Whether the demo counter pair governs this account
    #[must_use]
    pub const fn is_demo(self) -> bool {
        matches!(self, Self::Demo)
    }
}

/// Kind of billable operation recorded in the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Plain chat exchange
    Chat,
    /// Exchange that produced or executed SQL
    SqlQuery,
    /// Analytics computation
    Analysis,
    /// Data export
    Export,
}

impl OperationType {
    /// String form stored in the transaction row
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::SqlQuery => "sql_query",
            Self::Analysis => "analysis",
            Self::Export => "export",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "sql_query" => Self::SqlQuery,
            "analysis" => Self::Analysis,
            "export" => Self::Export,
            _ => Self::Chat,
        }
    }
}

// ============================================================================
// Credit Ledger Rows
// ============================================================================

/// Credit balance row, one per user
///
/// For paid accounts `remaining_credits = total_credits - used_credits` at
/// all times; for demo accounts `demo_used <= demo_credits`. Both invariants
/// are enforced by the consumption transaction, never by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredits {
    /// Opaque user identifier (ledger key)
    pub user_id: String,
    /// Credits ever granted to the paid balance
    pub total_credits: i64,
    /// Credits consumed from the paid balance since last reset
    pub used_credits: i64,
    /// Paid credits still available
    pub remaining_credits: i64,
    /// Demo allotment granted at account creation
    pub demo_credits: i64,
    /// Demo credits consumed since last reset
    pub demo_used: i64,
    /// Which counter pair governs authorization
    pub subscription_type: SubscriptionType,
    /// Paid credits expire at this instant (expired = zero remaining)
    pub credits_expire_at: Option<DateTime<Utc>>,
    /// Last admin reset
    pub last_reset_at: DateTime<Utc>,
    /// Row creation
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl UserCredits {
    /// Fresh demo ledger row created lazily on first authorization check
    #[must_use]
    pub fn new_demo(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_owned(),
            total_credits: 0,
            used_credits: 0,
            remaining_credits: 0,
            demo_credits: DEMO_TRIAL_CREDITS,
            demo_used: 0,
            subscription_type: SubscriptionType::Demo,
            credits_expire_at: None,
            last_reset_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Demo credits still available
    #[must_use]
    pub const fn demo_remaining(&self) -> i64 {
        self.demo_credits - self.demo_used
    }

    /// Paid credits usable right now (zero once expired)
    #[must_use]
    pub fn effective_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.credits_expire_at {
            Some(expires_at) if expires_at <= now => 0,
            _ => self.remaining_credits,
        }
    }
}

/// Append-only record of a single credit debit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique id, generated at write time
    pub id: String,
    /// Debited user
    pub user_id: String,
    /// Conversation correlation, when known
    pub conversation_id: Option<String>,
    /// Message correlation, when known
    pub message_id: Option<String>,
    /// Amount actually debited (positive)
    pub credits_used: i64,
    /// Kind of billable operation
    pub operation_type: OperationType,
    /// Informational bag (model, timing, streaming flag) - never read for
    /// authorization
    pub metadata: serde_json::Value,
    /// Append time
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Build a transaction record ready for appending
    #[must_use]
    pub fn new(
        user_id: &str,
        credits_used: u32,
        operation_type: OperationType,
        metadata: serde_json::Value,
        conversation_id: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            conversation_id,
            message_id,
            credits_used: i64::from(credits_used),
            operation_type,
            metadata,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Inbound Chat API Shapes
// ============================================================================

/// Role of an inbound conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user message
    User,
    /// Assistant reply
    Assistant,
    /// System instruction
    System,
    /// Legacy function-call result
    Function,
    /// Tool-call result
    Tool,
}

impl MessageRole {
    /// String form for persistence and the agent wire format
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Function => "function",
            Self::Tool => "tool",
        }
    }
}

/// A single message in the inbound history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Sender role
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

/// Current chat request body
#[derive(Debug, Clone, Deserialize)]
pub struct ChatApiRequest {
    /// Full conversation history, oldest first
    pub messages: Vec<IncomingMessage>,
    /// Existing conversation to continue, if any
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Caller-declared user identity (must match the bearer token)
    pub user_id: String,
    /// Pharmacy code the conversation is scoped to
    pub pharmacy_id: String,
    /// Stream the answer instead of buffering it
    #[serde(default)]
    pub stream: bool,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature override
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion length cap override
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Legacy chat request body, still accepted from older clients
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyChatRequest {
    /// Single user query
    pub query: String,
    /// Caller-declared user identity
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Pharmacy code
    #[serde(rename = "codePs")]
    pub code_ps: String,
    /// Existing conversation to continue, if any
    #[serde(rename = "conversationId", default)]
    pub conversation_id: Option<String>,
}

/// The two accepted body shapes, discriminated by the `messages` array
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatRequestBody {
    /// Current shape
    Current(ChatApiRequest),
    /// Legacy shape
    Legacy(LegacyChatRequest),
}

/// Canonical internal chat request every handler works with
#[derive(Debug, Clone)]
pub struct NormalizedChatRequest {
    /// Conversation history, oldest first
    pub messages: Vec<IncomingMessage>,
    /// Existing conversation to continue, if any
    pub conversation_id: Option<String>,
    /// Caller-declared user identity
    pub user_id: String,
    /// Pharmacy code
    pub pharmacy_id: String,
    /// Stream the answer
    pub stream: bool,
    /// Model override
    pub model: Option<String>,
    /// Sampling temperature override
    pub temperature: Option<f32>,
    /// Completion length cap override
    pub max_tokens: Option<u32>,
}

impl ChatRequestBody {
    /// Normalize either accepted shape into the canonical request
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when the message list is empty or contains no
    /// user message (the product's `"Invalid messages format"` /
    /// `"No user message found"` contract).
    pub fn normalize(self) -> AppResult<NormalizedChatRequest> {
        let normalized = match self {
            Self::Current(request) => NormalizedChatRequest {
                messages: request.messages,
                conversation_id: request.conversation_id,
                user_id: request.user_id,
                pharmacy_id: request.pharmacy_id,
                stream: request.stream,
                model: request.model,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            },
            Self::Legacy(request) => NormalizedChatRequest {
                messages: vec![IncomingMessage {
                    role: MessageRole::User,
                    content: request.query,
                }],
                conversation_id: request.conversation_id,
                user_id: request.user_id,
                pharmacy_id: request.code_ps,
                stream: false,
                model: None,
                temperature: None,
                max_tokens: None,
            },
        };

        if normalized.messages.is_empty() {
            return Err(AppError::bad_request("Invalid messages format"));
        }
        if normalized.last_user_message().is_none() {
            return Err(AppError::bad_request("No user message found"));
        }

        Ok(normalized)
    }
}

impl NormalizedChatRequest {
    /// The most recent user message, the one being answered
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

// ============================================================================
// Outbound Chat API Shapes
// ============================================================================

/// Buffered chat response returned to the caller
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    /// Assistant answer text
    pub response: String,
    /// Extracted SQL query, when the exchange involved one
    #[serde(rename = "sqlQuery")]
    pub sql_query: Option<String>,
    /// Structured SQL results, when present
    #[serde(rename = "sqlResults")]
    pub sql_results: Option<serde_json::Value>,
    /// Conversation the exchange was recorded under
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<String>,
}

/// Balance snapshot returned by `GET /api/credits`
#[derive(Debug, Serialize, Deserialize)]
pub struct CreditsStatusResponse {
    /// Governing plan
    pub subscription_type: SubscriptionType,
    /// Paid credits usable right now
    pub remaining_credits: i64,
    /// Demo credits usable right now
    pub demo_credits_remaining: i64,
    /// Paid balance expiry, if any
    pub credits_expire_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_current_shape() {
        let body: ChatRequestBody = serde_json::from_value(serde_json::json!({
            "messages": [
                {"role": "user", "content": "Bonjour"},
                {"role": "assistant", "content": "Bonjour!"},
                {"role": "user", "content": "Stock de doliprane ?"}
            ],
            "user_id": "u1",
            "pharmacy_id": "PS123",
            "stream": true
        }))
        .unwrap();

        let normalized = body.normalize().unwrap();
        assert_eq!(normalized.user_id, "u1");
        assert_eq!(normalized.pharmacy_id, "PS123");
        assert!(normalized.stream);
        assert_eq!(
            normalized.last_user_message(),
            Some("Stock de doliprane ?")
        );
    }

    #[test]
    fn test_normalize_legacy_shape() {
        let body: ChatRequestBody = serde_json::from_value(serde_json::json!({
            "query": "ventes du mois",
            "userId": "u2",
            "codePs": "PS456",
            "conversationId": "c9"
        }))
        .unwrap();

        let normalized = body.normalize().unwrap();
        assert_eq!(normalized.user_id, "u2");
        assert_eq!(normalized.pharmacy_id, "PS456");
        assert_eq!(normalized.conversation_id.as_deref(), Some("c9"));
        assert!(!normalized.stream);
        assert_eq!(normalized.messages.len(), 1);
        assert_eq!(normalized.last_user_message(), Some("ventes du mois"));
    }

    #[test]
    fn test_normalize_rejects_empty_messages() {
        let body: ChatRequestBody = serde_json::from_value(serde_json::json!({
            "messages": [],
            "user_id": "u1",
            "pharmacy_id": "PS123"
        }))
        .unwrap();

        let err = body.normalize().unwrap_err();
        assert_eq!(err.message, "Invalid messages format");
    }

    #[test]
    fn test_normalize_rejects_missing_user_message() {
        let body: ChatRequestBody = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "assistant", "content": "hello"}],
            "user_id": "u1",
            "pharmacy_id": "PS123"
        }))
        .unwrap();

        let err = body.normalize().unwrap_err();
        assert_eq!(err.message, "No user message found");
    }

    #[test]
    fn test_demo_ledger_defaults() {
        let credits = UserCredits::new_demo("u1");
        assert_eq!(credits.demo_credits, DEMO_TRIAL_CREDITS);
        assert_eq!(credits.demo_used, 0);
        assert_eq!(credits.demo_remaining(), DEMO_TRIAL_CREDITS);
        assert!(credits.subscription_type.is_demo());
    }

    #[test]
    fn test_expired_credits_count_as_zero() {
        let mut credits = UserCredits::new_demo("u1");
        credits.subscription_type = SubscriptionType::Basic;
        credits.total_credits = 100;
        credits.remaining_credits = 40;
        credits.used_credits = 60;

        let now = Utc::now();
        assert_eq!(credits.effective_remaining(now), 40);

        credits.credits_expire_at = Some(now - chrono::Duration::hours(1));
        assert_eq!(credits.effective_remaining(now), 0);

        credits.credits_expire_at = Some(now + chrono::Duration::hours(1));
        assert_eq!(credits.effective_remaining(now), 40);
    }
}
