// ABOUTME: Unified error handling with standard error codes and HTTP response formatting
// ABOUTME: Maps every failure kind of the gateway to a status code and a client-safe body
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Unified Error Handling System
//!
//! Centralized error handling for the Chifa gateway. Defines the error
//! taxonomy, the HTTP status mapping, and the response bodies clients see.
//!
//! User-facing messages are French (the product surface language); log
//! messages stay English. Credits denials serialize with a structured
//! `{type, code, message}` body so a client can distinguish "upgrade needed"
//! from "try again later".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Standard error codes used throughout the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Authentication & Authorization (1000-1999)
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized = 1000,
    #[serde(rename = "FORBIDDEN")]
    Forbidden = 1001,

    // Input validation (2000-2999)
    #[serde(rename = "BAD_REQUEST")]
    BadRequest = 2000,

    // Credits / usage policy (3000-3999)
    #[serde(rename = "CREDITS_EXHAUSTED")]
    CreditsExhausted = 3000,
    #[serde(rename = "INSUFFICIENT_CREDITS")]
    InsufficientCredits = 3001,
    #[serde(rename = "DEMO_LIMIT_REACHED")]
    DemoLimitReached = 3002,
    #[serde(rename = "DAILY_LIMIT_REACHED")]
    DailyLimitReached = 3003,
    #[serde(rename = "CREDITS_UNAVAILABLE")]
    CreditsUnavailable = 3004,

    // Upstream agent service (4000-4999)
    #[serde(rename = "AGENT_UNAVAILABLE")]
    AgentUnavailable = 4000,
    #[serde(rename = "AGENT_ERROR")]
    AgentError = 4001,

    // Persistence (5000-5999)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError = 5000,
    #[serde(rename = "CONVERSATION_CREATE_FAILED")]
    ConversationCreateFailed = 5001,
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    NotFound = 5002,

    // Streaming (6000-6999)
    #[serde(rename = "STREAM_INTERRUPTED")]
    StreamInterrupted = 6000,
    #[serde(rename = "STREAM_TIMEOUT")]
    StreamTimeout = 6001,
    #[serde(rename = "STREAM_PARSE_ERROR")]
    StreamParseError = 6002,
    #[serde(rename = "STREAM_LIMIT_REACHED")]
    StreamLimitReached = 6003,

    // Configuration (7000-7999)
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError = 7000,

    // Internal (9000-9999)
    #[serde(rename = "INTERNAL_ERROR")]
    Unknown = 9000,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Unauthorized => 401,

            Self::Forbidden => 403,

            Self::BadRequest => 400,

            // Payment Required: the credits gate denied the request
            Self::CreditsExhausted
            | Self::InsufficientCredits
            | Self::DemoLimitReached
            | Self::DailyLimitReached => 402,

            Self::NotFound => 404,

            // Too many concurrent outbound streams
            Self::StreamLimitReached => 503,

            // Upstream agent failures surface as 500 to match the product
            // contract ("Failed to connect to ... service")
            Self::AgentUnavailable
            | Self::AgentError
            | Self::CreditsUnavailable
            | Self::DatabaseError
            | Self::ConversationCreateFailed
            | Self::StreamInterrupted
            | Self::StreamTimeout
            | Self::StreamParseError
            | Self::ConfigError
            | Self::Unknown => 500,
        }
    }

    /// User-facing description (French, the product surface language)
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unauthorized => "Authentification requise ou session expirée",
            Self::Forbidden => "Vous n'avez pas accès à cette ressource",
            Self::BadRequest => "La requête est invalide",
            Self::CreditsExhausted => "Vos crédits sont épuisés",
            Self::InsufficientCredits => "Crédits insuffisants pour cette opération",
            Self::DemoLimitReached => {
                "Limite de messages de démonstration atteinte. Passez à un abonnement payant"
            }
            Self::DailyLimitReached => "Limite quotidienne atteinte. Réessayez demain",
            Self::CreditsUnavailable => "Impossible de vérifier vos crédits",
            Self::AgentUnavailable => "Impossible de contacter le service d'assistant Chifa",
            Self::AgentError => "Le service d'assistant Chifa a renvoyé une erreur",
            Self::DatabaseError => "Erreur de base de données",
            Self::ConversationCreateFailed => "Impossible de créer la conversation",
            Self::NotFound => "Ressource introuvable",
            Self::StreamInterrupted => "Le flux de réponse a été interrompu",
            Self::StreamTimeout => "Le flux de réponse a expiré",
            Self::StreamParseError => "Le flux de réponse est illisible",
            Self::StreamLimitReached => "Trop de flux simultanés. Réessayez dans un instant",
            Self::ConfigError => "Erreur de configuration du serveur",
            Self::Unknown => "Erreur interne du serveur",
        }
    }

    /// Whether this code belongs to the credits/usage-policy family
    ///
    /// Credits denials get the structured `{type:"CREDITS_ERROR", ...}` body
    /// so clients can route the user to the right remediation.
    #[must_use]
    pub const fn is_credits_error(self) -> bool {
        matches!(
            self,
            Self::CreditsExhausted
                | Self::InsufficientCredits
                | Self::DemoLimitReached
                | Self::DailyLimitReached
        )
    }
}

/// Additional context attached to errors for offline reconciliation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// User ID if available
    pub user_id: Option<String>,
    /// Conversation ID if applicable
    pub conversation_id: Option<String>,
    /// Additional key-value context
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Unified error type for the gateway
#[derive(Debug, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context
    pub context: ErrorContext,
    /// Source error for error chaining
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Attach the user ID for reconciliation logs
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.context.user_id = Some(user_id.into());
        self
    }

    /// Attach the conversation ID for reconciliation logs
    #[must_use]
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.context.conversation_id = Some(conversation_id.into());
        self
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.context.details = details;
        self
    }

    /// Attach a source error for error chaining
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

static SENSITIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // "password=...", "token: ...", "api_key=..." and similar pairs
    Regex::new(r#"(?i)([\w-]*(?:password|token|key|secret)[\w-]*)\s*[:=]\s*[^\s,;"']+"#)
        .unwrap_or_else(|e| unreachable!("invalid redaction pattern: {e}"))
});

/// Redact sensitive substrings before a message reaches a user-facing surface
///
/// Replaces the value of any `password`/`token`/`key`/`secret`-named pair
/// with `[REDACTED]`. Applied to every message serialized into an HTTP body.
#[must_use]
pub fn redact_sensitive(message: &str) -> String {
    SENSITIVE_PATTERN
        .replace_all(message, "$1=[REDACTED]")
        .into_owned()
}

/// Structured body for credits denials
#[derive(Debug, Serialize, Deserialize)]
pub struct CreditsErrorBody {
    /// Always `CREDITS_ERROR`
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable code (which remediation applies)
    pub code: ErrorCode,
    /// Human-readable message (French)
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = redact_sensitive(&self.message);

        tracing::error!(
            code = ?self.code,
            user_id = self.context.user_id.as_deref(),
            conversation_id = self.context.conversation_id.as_deref(),
            "request failed: {message}"
        );

        if self.code.is_credits_error() {
            let body = CreditsErrorBody {
                error_type: "CREDITS_ERROR".to_owned(),
                code: self.code,
                message,
            };
            return (status, Json(body)).into_response();
        }

        // Plain `{error}` shape for everything else; 401 keeps the fixed
        // "Unauthorized" body the clients pattern-match on.
        let error_text = if self.code == ErrorCode::Unauthorized {
            "Unauthorized".to_owned()
        } else {
            message
        };
        (status, Json(serde_json::json!({ "error": error_text }))).into_response()
    }
}

/// Convenience constructors for common errors
impl AppError {
    /// Missing/invalid/expired bearer credential
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Identity/ownership mismatch
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Malformed input
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Resource not found
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} introuvable", resource.into()),
        )
    }

    /// Ledger or conversation store failure
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Upstream agent network/timeout failure
    pub fn agent_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AgentUnavailable, message)
    }

    /// Upstream agent non-2xx response
    ///
    /// The user-visible body keeps the fixed connect-failure text clients
    /// pattern-match on; status and payload go into the details for logs.
    pub fn agent_error(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::AgentError,
            "Failed to connect to Chifa agent service",
        )
        .with_details(serde_json::json!({ "status": status, "body": body.into() }))
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Paid balance too low for the requested operation
    pub fn insufficient_credits(required: u32, available: i64) -> Self {
        Self::new(
            ErrorCode::InsufficientCredits,
            ErrorCode::InsufficientCredits.description(),
        )
        .with_details(serde_json::json!({
            "required": required,
            "available": available
        }))
    }

    /// Demo allotment exhausted
    pub fn demo_limit_reached() -> Self {
        Self::new(
            ErrorCode::DemoLimitReached,
            ErrorCode::DemoLimitReached.description(),
        )
    }

    /// Demo daily quota exhausted
    pub fn daily_limit_reached() -> Self {
        Self::new(
            ErrorCode::DailyLimitReached,
            ErrorCode::DailyLimitReached.description(),
        )
    }

    /// Ledger row could not be loaded at all
    pub fn credits_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CreditsUnavailable, message)
    }
}

/// Conversion from `anyhow::Error` at the binary boundary
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        match error.source() {
            Some(source) => {
                Self::new(ErrorCode::Unknown, error.to_string()).with_details(serde_json::json!({
                    "source": source.to_string()
                }))
            }
            None => Self::new(ErrorCode::Unknown, error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::BadRequest.http_status(), 400);
        assert_eq!(ErrorCode::Forbidden.http_status(), 403);
        assert_eq!(ErrorCode::InsufficientCredits.http_status(), 402);
        assert_eq!(ErrorCode::DemoLimitReached.http_status(), 402);
        assert_eq!(ErrorCode::AgentUnavailable.http_status(), 500);
        assert_eq!(ErrorCode::ConversationCreateFailed.http_status(), 500);
    }

    #[test]
    fn test_credits_error_family() {
        assert!(ErrorCode::InsufficientCredits.is_credits_error());
        assert!(ErrorCode::DemoLimitReached.is_credits_error());
        assert!(ErrorCode::DailyLimitReached.is_credits_error());
        assert!(!ErrorCode::Unauthorized.is_credits_error());
        assert!(!ErrorCode::DatabaseError.is_credits_error());
    }

    #[test]
    fn test_app_error_context() {
        let error = AppError::database("insert failed")
            .with_user_id("user-1")
            .with_conversation_id("conv-1");

        assert_eq!(error.code, ErrorCode::DatabaseError);
        assert_eq!(error.context.user_id.as_deref(), Some("user-1"));
        assert_eq!(error.context.conversation_id.as_deref(), Some("conv-1"));
    }

    #[test]
    fn test_redact_sensitive_pairs() {
        let redacted = redact_sensitive("connect failed: api_key=sk-12345 host=db");
        assert!(redacted.contains("api_key=[REDACTED]"));
        assert!(!redacted.contains("sk-12345"));
        assert!(redacted.contains("host=db"));

        let redacted = redact_sensitive("bad token: abc.def.ghi");
        assert!(!redacted.contains("abc.def.ghi"));

        // Messages without sensitive pairs pass through untouched
        assert_eq!(redact_sensitive("plain message"), "plain message");
    }

    #[test]
    fn test_insufficient_credits_details() {
        let error = AppError::insufficient_credits(3, 1);
        assert_eq!(error.context.details["required"], 3);
        assert_eq!(error.context.details["available"], 1);
    }
}
