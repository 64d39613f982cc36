// ABOUTME: In-memory per-stream credit monitor advising early termination of long streams
// ABOUTME: Advisory only - the consumption transaction at stream end stays authoritative
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

use crate::credits::CreditsManager;

/// Per-request counter tracking credits consumed during an open stream
///
/// Owned by the single request-handling task; nothing here is persisted or
/// shared. Lets a long-lived stream decide to self-terminate before it would
/// overdraw the account, without a database round-trip on every chunk. The
/// authoritative check remains the consumption transaction at stream end.
pub struct StreamingCreditsMonitor {
    manager: CreditsManager,
    user_id: String,
    estimated_cap: u32,
    consumed: u32,
}

impl StreamingCreditsMonitor {
    /// Create a monitor for one stream with an estimated cost cap
    #[must_use]
    pub const fn new(manager: CreditsManager, user_id: String, estimated_cap: u32) -> Self {
        Self {
            manager,
            user_id,
            estimated_cap,
            consumed: 0,
        }
    }

    /// Record credits attributed to the stream so far
    pub fn record_credits_consumed(&mut self, credits: u32) {
        self.consumed = self.consumed.saturating_add(credits);
    }

    /// Credits attributed so far
    #[must_use]
    pub const fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Whether the stream may keep going
    ///
    /// Checks the local cap first (free), then the live balance (one read).
    pub async fn can_continue_streaming(&self) -> bool {
        if self.consumed >= self.estimated_cap {
            return false;
        }

        self.manager
            .check_credits_available(&self.user_id, 1)
            .await
            .available
    }

    /// Whether consumption has crossed `threshold` (0.0..=1.0) of the cap
    #[must_use]
    pub fn is_approaching_limit(&self, threshold: f32) -> bool {
        if self.estimated_cap == 0 {
            return true;
        }
        (self.consumed as f32 / self.estimated_cap as f32) >= threshold
    }
}
