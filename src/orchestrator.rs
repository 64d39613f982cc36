// ABOUTME: End-to-end chat request flow - authorize, call agent, settle credits, persist
// ABOUTME: Post-response failures are logged, never unwound; conversation creation is the exception
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Chat Orchestrator
//!
//! One inbound chat request walks the states
//! `Received → Authenticated → Authorized → AgentInFlight → ResponseReceived
//! → CreditsSettled → Persisted → Completed`, failing out of any step with a
//! typed error. Authentication happens in the route layer; everything after
//! lives here.
//!
//! ## Post-response side-effect policy
//!
//! Once the agent's answer exists, the user gets it. Each bookkeeping step
//! returns a [`SideEffectOutcome`]; this table is the whole policy:
//!
//! | step                    | on failure          |
//! |-------------------------|---------------------|
//! | credit settlement       | `FailedNonFatal` - logged, uncollected debt accepted |
//! | conversation creation   | `FailedFatal` - without an id the client cannot continue the thread |
//! | user message append     | `FailedNonFatal` - logged |
//! | assistant message append| `FailedNonFatal` - logged |
//!
//! Requests are not deduplicated: a client retry after a timeout produces a
//! duplicate user message and a duplicate debit. Known gap, not a bug.

use crate::agent::{AgentCallParams, AgentClient, AgentCredentials, AgentResponse};
use crate::auth::AuthResult;
use crate::credits::cost::{calculate_chat_credits, calculate_streaming_credits, detect_sql};
use crate::credits::{CreditsManager, StreamingPreAuth};
use crate::database::{ConversationRecord, Database, NewMessage};
use crate::errors::{AppError, AppResult};
use crate::models::{NormalizedChatRequest, OperationType};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{info, warn};

/// Default model recorded on auto-created conversations
const DEFAULT_MODEL: &str = "chifa-agent";

/// Longest auto-derived conversation title
const TITLE_MAX_CHARS: usize = 50;

static SQL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```sql\s*\n?([\s\S]*?)```")
        .unwrap_or_else(|e| unreachable!("invalid SQL block pattern: {e}"))
});

/// Outcome of one post-response bookkeeping step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectOutcome {
    /// Step completed
    Committed,
    /// Step failed; the already-delivered response stands
    FailedNonFatal(String),
    /// Step failed and the request must surface an error
    FailedFatal(String),
}

impl SideEffectOutcome {
    fn log(&self, step: &str, user_id: &str) {
        match self {
            Self::Committed => {}
            Self::FailedNonFatal(reason) => {
                warn!(user_id, step, "post-response step failed (non-fatal): {reason}");
            }
            Self::FailedFatal(reason) => {
                warn!(user_id, step, "post-response step failed (fatal): {reason}");
            }
        }
    }
}

/// Successful end of the state machine
#[derive(Debug)]
pub struct ChatOutcome {
    /// Assistant answer text
    pub response: String,
    /// Extracted SQL query, when the exchange involved one
    pub sql_query: Option<String>,
    /// Structured SQL results, when present
    pub sql_results: Option<serde_json::Value>,
    /// Conversation the exchange belongs to
    pub conversation_id: String,
}

/// Everything a streaming request needs before the first byte goes out
#[derive(Debug)]
pub struct StreamContext {
    /// Per-pharmacy agent credentials
    pub credentials: AgentCredentials,
    /// Conversation created/reused up front (its id goes in the header)
    pub conversation: ConversationRecord,
    /// Soft pre-flight estimate correlating the eventual debit
    pub pre_auth: StreamingPreAuth,
}

/// End-to-end flow for one inbound chat request
#[derive(Clone)]
pub struct ChatOrchestrator {
    database: Database,
    credits: CreditsManager,
    agent: AgentClient,
}

impl ChatOrchestrator {
    /// Wire the orchestrator to its collaborators
    #[must_use]
    pub const fn new(database: Database, credits: CreditsManager, agent: AgentClient) -> Self {
        Self {
            database,
            credits,
            agent,
        }
    }

    /// The credits manager (shared with the streaming monitor)
    #[must_use]
    pub const fn credits(&self) -> &CreditsManager {
        &self.credits
    }

    // ========================================================================
    // Authorized
    // ========================================================================

    /// `Authenticated → Authorized`: identity match + estimated-cost check
    ///
    /// Request shape was already validated during normalization. Returns the
    /// estimated cost the authorization ran against.
    ///
    /// # Errors
    ///
    /// `Forbidden` when the caller-declared identity does not match the
    /// authenticated one, a credits-family error when the authorizer denies,
    /// `BadRequest` when streaming policy blocks the message.
    pub async fn authorize(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
    ) -> AppResult<u32> {
        if request.user_id != auth.user_id {
            return Err(AppError::forbidden(
                "L'identité déclarée ne correspond pas à la session",
            )
            .with_user_id(&auth.user_id));
        }

        // Accounts with a profile must be in good standing and scoped to
        // the pharmacy they claim; accounts without one (fresh demo) pass.
        if let Some(profile) = self.database.get_profile(&auth.user_id).await? {
            if profile.pharmacy_status == "suspended" {
                return Err(
                    AppError::forbidden("Compte pharmacie suspendu").with_user_id(&auth.user_id)
                );
            }
            if profile.code_ps != request.pharmacy_id {
                return Err(AppError::forbidden(format!(
                    "Pharmacie non associée au compte: {}",
                    request.pharmacy_id
                ))
                .with_user_id(&auth.user_id));
            }
        }

        let message = request
            .last_user_message()
            .ok_or_else(|| AppError::bad_request("No user message found"))?;

        let estimated = calculate_chat_credits(message, detect_sql(message), request.stream);
        let check = self
            .credits
            .check_credits_available(&auth.user_id, estimated)
            .await;
        if !check.available {
            return Err(check
                .error
                .unwrap_or_else(|| AppError::credits_unavailable("Credits check failed")));
        }

        if request.stream {
            let permission = self
                .credits
                .validate_streaming_permissions(&auth.user_id, message)
                .await?;
            if !permission.allowed {
                let code = permission
                    .code
                    .unwrap_or(crate::errors::ErrorCode::DemoLimitReached);
                let reason = permission
                    .reason
                    .unwrap_or_else(|| "Diffusion non autorisée".to_owned());
                let suggestion = permission.suggestion.unwrap_or_default();
                return Err(AppError::new(code, reason)
                    .with_user_id(&auth.user_id)
                    .with_details(serde_json::json!({ "suggestion": suggestion })));
            }
        }

        Ok(estimated)
    }

    /// Resolve the per-pharmacy agent credential bundle
    ///
    /// # Errors
    ///
    /// `Forbidden` when no credentials exist for the pharmacy code.
    pub async fn resolve_credentials(&self, pharmacy_id: &str) -> AppResult<AgentCredentials> {
        self.database
            .get_pharmacy_secret(pharmacy_id)
            .await?
            .map(Into::into)
            .ok_or_else(|| {
                AppError::forbidden(format!("Pharmacie inconnue: {pharmacy_id}"))
            })
    }

    // ========================================================================
    // Buffered flow
    // ========================================================================

    /// Run the whole state machine for a buffered (non-streaming) request
    ///
    /// # Errors
    ///
    /// Any pre-response failure propagates with its own status; after the
    /// agent answered, only conversation creation can fail the request.
    pub async fn handle_buffered(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
    ) -> AppResult<ChatOutcome> {
        let estimated = self.authorize(auth, request).await?;
        let credentials = self.resolve_credentials(&request.pharmacy_id).await?;

        // AgentInFlight: exactly one outbound call. A failure here leaves no
        // side effects behind - nothing was consumed or persisted yet.
        let params = call_params(request);
        let started = Instant::now();
        let agent_response = self
            .agent
            .complete(&request.messages, &credentials, &params)
            .await
            .map_err(|e| e.with_user_id(&auth.user_id))?;
        let processing_ms = started.elapsed().as_millis() as u64;

        info!(
            user_id = %auth.user_id,
            estimated,
            processing_ms,
            "agent answered, settling exchange"
        );

        self.finish_buffered_exchange(auth, request, agent_response, processing_ms)
            .await
    }

    /// `ResponseReceived → CreditsSettled → Persisted → Completed`
    async fn finish_buffered_exchange(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
        agent_response: AgentResponse,
        processing_ms: u64,
    ) -> AppResult<ChatOutcome> {
        let user_message = request.last_user_message().unwrap_or_default().to_owned();
        let sql_query = agent_response
            .sql_query
            .clone()
            .or_else(|| extract_sql_block(&agent_response.response));
        let has_sql = sql_query.is_some() || detect_sql(&agent_response.response);

        // CreditsSettled: actual cost from the real response; a failure here
        // is an accepted uncollected debt, never a retracted answer.
        let actual_cost = calculate_chat_credits(&user_message, has_sql, false);
        let operation = if has_sql {
            OperationType::SqlQuery
        } else {
            OperationType::Chat
        };
        let settlement = self
            .settle_credits(
                &auth.user_id,
                actual_cost,
                operation,
                request.conversation_id.as_deref(),
                processing_ms,
                false,
            )
            .await;
        settlement.log("credit settlement", &auth.user_id);

        // Persisted: conversation creation is the one fatal step.
        let conversation = match self.ensure_conversation(auth, request).await {
            Ok(conversation) => conversation,
            Err(e) => {
                SideEffectOutcome::FailedFatal(e.to_string())
                    .log("conversation creation", &auth.user_id);
                return Err(e);
            }
        };

        let user_persist = self
            .persist_message(
                &conversation.id,
                NewMessage {
                    role: "user",
                    content: &user_message,
                    ..NewMessage::default()
                },
            )
            .await;
        user_persist.log("user message append", &auth.user_id);

        let assistant_persist = self
            .persist_message(
                &conversation.id,
                NewMessage {
                    role: "assistant",
                    content: &agent_response.response,
                    sql_query: sql_query.as_deref(),
                    sql_results: agent_response.results.as_ref(),
                    credits_cost: Some(i64::from(actual_cost)),
                    processing_time_ms: Some(processing_ms as i64),
                },
            )
            .await;
        assistant_persist.log("assistant message append", &auth.user_id);

        Ok(ChatOutcome {
            response: agent_response.response,
            sql_query,
            sql_results: agent_response.results,
            conversation_id: conversation.id,
        })
    }

    // ========================================================================
    // Streaming flow
    // ========================================================================

    /// Everything that must succeed before the first streamed byte
    ///
    /// The conversation is created up front because its id travels in the
    /// response headers; creation failure is fatal here exactly as in the
    /// buffered path.
    ///
    /// # Errors
    ///
    /// Same pre-response failures as [`Self::handle_buffered`].
    pub async fn prepare_stream(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
    ) -> AppResult<StreamContext> {
        self.authorize(auth, request).await?;
        let credentials = self.resolve_credentials(&request.pharmacy_id).await?;
        let conversation = self.ensure_conversation(auth, request).await?;

        let message = request.last_user_message().unwrap_or_default();
        let pre_auth = self
            .credits
            .pre_authorize_streaming_credits(&auth.user_id, message)
            .await;

        Ok(StreamContext {
            credentials,
            conversation,
            pre_auth,
        })
    }

    /// Issue the streaming agent call
    ///
    /// # Errors
    ///
    /// `AgentUnavailable` on network/timeout failure. Non-2xx responses are
    /// returned for the relay to forward.
    pub async fn open_agent_stream(
        &self,
        request: &NormalizedChatRequest,
        credentials: &AgentCredentials,
    ) -> AppResult<reqwest::Response> {
        let params = call_params(request);
        self.agent
            .complete_stream(&request.messages, credentials, &params)
            .await
    }

    /// Bookkeeping once the upstream stream has fully drained
    ///
    /// Runs concurrently with the tail of the relay; every step is
    /// best-effort because the bytes already reached the client.
    pub async fn settle_stream(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
        context: &StreamContext,
        full_response: &str,
        processing_ms: u64,
    ) {
        let user_message = request.last_user_message().unwrap_or_default().to_owned();
        let sql_query = extract_sql_block(full_response);
        let has_sql = sql_query.is_some() || detect_sql(full_response);

        let actual_cost =
            calculate_streaming_credits(&user_message, full_response, has_sql, processing_ms);
        let operation = if has_sql {
            OperationType::SqlQuery
        } else {
            OperationType::Chat
        };

        let consumption = self
            .credits
            .consume_streaming_credits(
                &auth.user_id,
                actual_cost,
                operation,
                &context.pre_auth.authorization_id,
                Some(serde_json::json!({
                    "model": request.model.as_deref().unwrap_or(DEFAULT_MODEL),
                    "processing_time_ms": processing_ms,
                    "response_chars": full_response.len(),
                })),
                Some(context.conversation.id.as_str()),
                None,
            )
            .await;
        let settlement = if consumption.success {
            SideEffectOutcome::Committed
        } else {
            SideEffectOutcome::FailedNonFatal(
                consumption
                    .error
                    .map_or_else(|| "unknown settlement failure".to_owned(), |e| e.to_string()),
            )
        };
        settlement.log("streaming credit settlement", &auth.user_id);

        let user_persist = self
            .persist_message(
                &context.conversation.id,
                NewMessage {
                    role: "user",
                    content: &user_message,
                    ..NewMessage::default()
                },
            )
            .await;
        user_persist.log("user message append", &auth.user_id);

        let assistant_persist = self
            .persist_message(
                &context.conversation.id,
                NewMessage {
                    role: "assistant",
                    content: full_response,
                    sql_query: sql_query.as_deref(),
                    sql_results: None,
                    credits_cost: Some(i64::from(actual_cost)),
                    processing_time_ms: Some(processing_ms as i64),
                },
            )
            .await;
        assistant_persist.log("assistant message append", &auth.user_id);
    }

    // ========================================================================
    // Side-effect steps
    // ========================================================================

    async fn settle_credits(
        &self,
        user_id: &str,
        cost: u32,
        operation: OperationType,
        conversation_id: Option<&str>,
        processing_ms: u64,
        streaming: bool,
    ) -> SideEffectOutcome {
        let consumption = self
            .credits
            .consume_credits(
                user_id,
                cost,
                operation,
                Some(serde_json::json!({
                    "processing_time_ms": processing_ms,
                    "streaming": streaming,
                })),
                conversation_id,
                None,
            )
            .await;

        if consumption.success {
            SideEffectOutcome::Committed
        } else {
            SideEffectOutcome::FailedNonFatal(
                consumption
                    .error
                    .map_or_else(|| "unknown settlement failure".to_owned(), |e| e.to_string()),
            )
        }
    }

    async fn persist_message(
        &self,
        conversation_id: &str,
        message: NewMessage<'_>,
    ) -> SideEffectOutcome {
        match self.database.add_message(conversation_id, message).await {
            Ok(_) => SideEffectOutcome::Committed,
            Err(e) => SideEffectOutcome::FailedNonFatal(e.to_string()),
        }
    }

    /// Create the conversation, or match-and-reuse a supplied one the caller
    /// owns. A supplied id that resolves to nothing falls through to
    /// creation rather than leaking another user's thread.
    async fn ensure_conversation(
        &self,
        auth: &AuthResult,
        request: &NormalizedChatRequest,
    ) -> AppResult<ConversationRecord> {
        if let Some(id) = &request.conversation_id {
            if let Some(conversation) = self.database.get_conversation(id, &auth.user_id).await? {
                return Ok(conversation);
            }
        }

        let title = derive_title(request.last_user_message().unwrap_or_default());
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        self.database
            .create_conversation(&auth.user_id, &request.pharmacy_id, &title, model)
            .await
    }
}

fn call_params(request: &NormalizedChatRequest) -> AgentCallParams {
    AgentCallParams {
        model: request.model.clone(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

/// First fenced ```` ```sql ```` block of a response, trimmed
#[must_use]
pub fn extract_sql_block(text: &str) -> Option<String> {
    SQL_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_owned())
        .filter(|sql| !sql.is_empty())
}

fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "Nouvelle conversation".to_owned();
    }
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sql_block() {
        let text = "Voici la requête:\n```sql\nSELECT * FROM ventes;\n```\nEt les résultats.";
        assert_eq!(
            extract_sql_block(text).as_deref(),
            Some("SELECT * FROM ventes;")
        );
    }

    #[test]
    fn test_extract_sql_block_absent() {
        assert!(extract_sql_block("pas de requête ici").is_none());
        assert!(extract_sql_block("```sql\n```").is_none());
    }

    #[test]
    fn test_derive_title_truncates() {
        let title = derive_title(&"a".repeat(120));
        assert_eq!(title.chars().count(), 50);
        assert_eq!(derive_title("   "), "Nouvelle conversation");
        assert_eq!(derive_title("Stock ?"), "Stock ?");
    }
}
