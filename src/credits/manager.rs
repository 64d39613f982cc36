// ABOUTME: Usage authorizer and credit consumption transaction over the ledger store
// ABOUTME: Re-checks balance at debit time and treats the audit log as best-effort
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

use crate::constants::limits;
use crate::credits::cost::{calculate_chat_credits, detect_sql};
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CreditTransaction, OperationType, UserCredits};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a read-only credits availability check
#[derive(Debug)]
pub struct CreditCheck {
    /// Whether the user may proceed with the proposed cost
    pub available: bool,
    /// The ledger row the decision was made against, when loadable
    pub credits: Option<UserCredits>,
    /// Denial reason, when not available
    pub error: Option<AppError>,
}

/// Result of a credit consumption transaction
#[derive(Debug)]
pub struct CreditConsumption {
    /// Whether the full amount was debited
    pub success: bool,
    /// Balance after the debit (0 on failure)
    pub remaining_credits: i64,
    /// Denial or storage failure, when unsuccessful
    pub error: Option<AppError>,
}

/// Streaming policy decision with user-facing remediation
#[derive(Debug, Clone)]
pub struct StreamingPermission {
    /// Whether the stream may start
    pub allowed: bool,
    /// Denial code when blocked
    pub code: Option<crate::errors::ErrorCode>,
    /// Human-readable reason when blocked (French)
    pub reason: Option<String>,
    /// Suggested remediation (upgrade / wait / shorten)
    pub suggestion: Option<String>,
}

impl StreamingPermission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            code: None,
            reason: None,
            suggestion: None,
        }
    }

    fn blocked(
        code: crate::errors::ErrorCode,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            code: Some(code),
            reason: Some(reason.into()),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// Soft pre-flight estimate for a streamed exchange
///
/// Reserves nothing; the `authorization_id` only correlates the estimate
/// with the post-hoc debit in the transaction metadata.
#[derive(Debug)]
pub struct StreamingPreAuth {
    /// Whether the estimate passed the availability check
    pub authorized: bool,
    /// Correlation tag injected into the eventual debit's metadata
    pub authorization_id: String,
    /// Estimated cost the check ran against
    pub estimated_credits: u32,
    /// Denial reason when not authorized
    pub denial: Option<AppError>,
}

/// Usage authorizer and consumption transaction over the ledger store
#[derive(Clone)]
pub struct CreditsManager {
    database: Database,
}

impl CreditsManager {
    /// Create a manager over the given store
    #[must_use]
    pub const fn new(database: Database) -> Self {
        Self { database }
    }

    // ========================================================================
    // Usage Authorizer (read-only)
    // ========================================================================

    /// Check whether a user may spend `required_credits`
    ///
    /// Lazily creates the ledger row on first contact. Never mutates state,
    /// so it is safe to call repeatedly and speculatively. A passing check
    /// is advisory only - the consumption transaction re-checks.
    pub async fn check_credits_available(&self, user_id: &str, required_credits: u32) -> CreditCheck {
        let credits = match self.database.get_or_create_user_credits(user_id).await {
            Ok(credits) => credits,
            Err(e) => {
                warn!(user_id, "credits check failed to load ledger: {e}");
                return CreditCheck {
                    available: false,
                    credits: None,
                    error: Some(
                        AppError::credits_unavailable("Impossible de vérifier vos crédits")
                            .with_user_id(user_id),
                    ),
                };
            }
        };

        let required = i64::from(required_credits);

        if credits.subscription_type.is_demo() {
            let demo_remaining = credits.demo_remaining();
            if demo_remaining >= required {
                return CreditCheck {
                    available: true,
                    credits: Some(credits),
                    error: None,
                };
            }
            return CreditCheck {
                available: false,
                credits: Some(credits),
                error: Some(AppError::demo_limit_reached().with_user_id(user_id)),
            };
        }

        let remaining = credits.effective_remaining(Utc::now());
        if remaining >= required {
            CreditCheck {
                available: true,
                credits: Some(credits),
                error: None,
            }
        } else {
            CreditCheck {
                available: false,
                credits: Some(credits),
                error: Some(
                    AppError::insufficient_credits(required_credits, remaining)
                        .with_user_id(user_id),
                ),
            }
        }
    }

    /// Streaming policy layered on top of the raw balance
    ///
    /// Demo accounts are blocked once their total or daily message quota is
    /// exhausted, and may not stream messages longer than the demo cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or transaction log cannot be read.
    pub async fn validate_streaming_permissions(
        &self,
        user_id: &str,
        message_content: &str,
    ) -> AppResult<StreamingPermission> {
        let credits = self.database.get_or_create_user_credits(user_id).await?;

        if !credits.subscription_type.is_demo() {
            return Ok(StreamingPermission::allowed());
        }

        if credits.demo_remaining() <= 0 {
            return Ok(StreamingPermission::blocked(
                crate::errors::ErrorCode::DemoLimitReached,
                "Limite de messages de démonstration atteinte",
                "Passez à un abonnement payant pour continuer",
            ));
        }

        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or_else(Utc::now, |t| t.and_utc());
        let sent_today = self
            .database
            .count_transactions_since(user_id, start_of_day)
            .await?;
        if sent_today >= limits::DEMO_DAILY_MESSAGE_LIMIT {
            return Ok(StreamingPermission::blocked(
                crate::errors::ErrorCode::DailyLimitReached,
                "Limite quotidienne de messages atteinte",
                "Réessayez demain ou passez à un abonnement payant",
            ));
        }

        if message_content.len() > limits::DEMO_MAX_MESSAGE_CHARS {
            return Ok(StreamingPermission::blocked(
                crate::errors::ErrorCode::BadRequest,
                "Message trop long pour un compte de démonstration",
                format!(
                    "Raccourcissez votre message ({} caractères maximum)",
                    limits::DEMO_MAX_MESSAGE_CHARS
                ),
            ));
        }

        Ok(StreamingPermission::allowed())
    }

    // ========================================================================
    // Credit Consumption Transaction
    // ========================================================================

    /// Debit credits and append a transaction record
    ///
    /// The availability check is re-run here - a prior check is never
    /// trusted, because the balance may have changed in between. The debit
    /// itself is a single guarded UPDATE, so even two racing consumptions
    /// cannot drive the balance negative: one of them matches zero rows and
    /// fails cleanly.
    ///
    /// The log append is best-effort by design: a debited ledger with a lost
    /// audit row beats an audit row for a debit that never happened.
    pub async fn consume_credits(
        &self,
        user_id: &str,
        credits_to_consume: u32,
        operation_type: OperationType,
        metadata: Option<serde_json::Value>,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
    ) -> CreditConsumption {
        let check = self.check_credits_available(user_id, credits_to_consume).await;
        if !check.available {
            return CreditConsumption {
                success: false,
                remaining_credits: 0,
                error: check.error,
            };
        }
        let Some(credits) = check.credits else {
            // available=true always carries the row; keep the failure path
            // total anyway
            return CreditConsumption {
                success: false,
                remaining_credits: 0,
                error: Some(AppError::credits_unavailable("Ledger row missing after check")),
            };
        };

        let is_demo = credits.subscription_type.is_demo();
        let applied = if is_demo {
            self.database
                .try_consume_demo_credits(user_id, credits_to_consume)
                .await
        } else {
            self.database
                .try_consume_paid_credits(user_id, credits_to_consume)
                .await
        };

        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                return CreditConsumption {
                    success: false,
                    remaining_credits: 0,
                    error: Some(e),
                };
            }
        };

        if !applied {
            // Raced: the balance moved between the check and the debit.
            let error = if is_demo {
                AppError::demo_limit_reached().with_user_id(user_id)
            } else {
                AppError::insufficient_credits(
                    credits_to_consume,
                    credits.effective_remaining(Utc::now()),
                )
                .with_user_id(user_id)
            };
            return CreditConsumption {
                success: false,
                remaining_credits: 0,
                error: Some(error),
            };
        }

        let transaction = CreditTransaction::new(
            user_id,
            credits_to_consume,
            operation_type,
            metadata.unwrap_or_else(|| serde_json::json!({})),
            conversation_id.map(ToOwned::to_owned),
            message_id.map(ToOwned::to_owned),
        );
        if let Err(e) = self.database.record_transaction(&transaction).await {
            // Balance correctness takes priority over audit completeness
            warn!(
                user_id,
                transaction_id = %transaction.id,
                "transaction log append failed after successful debit: {e}"
            );
        }

        // Derived from the pre-check value; no second round trip
        let before = if is_demo {
            credits.demo_remaining()
        } else {
            credits.effective_remaining(Utc::now())
        };
        let remaining = before - i64::from(credits_to_consume);

        debug!(
            user_id,
            cost = credits_to_consume,
            remaining,
            operation = operation_type.as_str(),
            "credits consumed"
        );

        CreditConsumption {
            success: true,
            remaining_credits: remaining,
            error: None,
        }
    }

    /// Streaming variant of [`Self::consume_credits`]
    ///
    /// Same transaction with `streaming: true` and the pre-flight
    /// `authorization_id` injected into the metadata.
    pub async fn consume_streaming_credits(
        &self,
        user_id: &str,
        credits_to_consume: u32,
        operation_type: OperationType,
        authorization_id: &str,
        metadata: Option<serde_json::Value>,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
    ) -> CreditConsumption {
        let mut metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = metadata.as_object_mut() {
            map.insert("streaming".to_owned(), serde_json::Value::Bool(true));
            map.insert(
                "authorization_id".to_owned(),
                serde_json::Value::String(authorization_id.to_owned()),
            );
        }

        self.consume_credits(
            user_id,
            credits_to_consume,
            operation_type,
            Some(metadata),
            conversation_id,
            message_id,
        )
        .await
    }

    /// Pre-flight estimate for a streamed exchange
    ///
    /// Performs the same availability check as the authorizer but reserves
    /// nothing - a soft, non-blocking advisory whose `authorization_id`
    /// later links the estimate to the actual debit.
    pub async fn pre_authorize_streaming_credits(
        &self,
        user_id: &str,
        message_content: &str,
    ) -> StreamingPreAuth {
        let estimated =
            calculate_chat_credits(message_content, detect_sql(message_content), true);
        let check = self.check_credits_available(user_id, estimated).await;

        StreamingPreAuth {
            authorized: check.available,
            authorization_id: Uuid::new_v4().to_string(),
            estimated_credits: estimated,
            denial: check.error,
        }
    }

    /// Access the underlying store (used by the streaming monitor)
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.database
    }
}
