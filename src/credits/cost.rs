// ABOUTME: Pure credit cost calculators and SQL detection for chat exchanges
// ABOUTME: No I/O - turns message/response characteristics into an integer cost
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Cost Calculator
//!
//! Pure functions turning message and response characteristics into integer
//! credit costs. The constants come from the production pricing table
//! (`constants::costs`); they are product decisions and stay as-is.

use crate::constants::costs;
use regex::Regex;
use std::sync::LazyLock;

// Uppercase keywords only: detection is case-sensitive on purpose, matching
// the behavior clients were billed under.
static SQL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(SELECT|INSERT|UPDATE|DELETE)\b")
        .unwrap_or_else(|e| unreachable!("invalid SQL keyword pattern: {e}"))
});

/// Whether content counts as SQL-bearing for billing
///
/// A fenced ```` ```sql ```` block or any bare SELECT/INSERT/UPDATE/DELETE
/// keyword qualifies.
#[must_use]
pub fn detect_sql(content: &str) -> bool {
    content.contains("```sql") || SQL_KEYWORDS.is_match(content)
}

/// Cost of a chat request, estimated before the response exists
///
/// Base cost plus the SQL surcharge and, for long inputs, the complexity
/// surcharge. Streaming adds nothing today - a deliberate pricing decision,
/// kept as an explicit parameter so the call sites read the same as the
/// post-hoc variant.
#[must_use]
pub fn calculate_chat_credits(message_content: &str, has_sql: bool, _is_streaming: bool) -> u32 {
    let mut cost = costs::SIMPLE_CHAT;

    if has_sql {
        cost += costs::SQL_SURCHARGE;
    }

    if message_content.len() > costs::LONG_MESSAGE_THRESHOLD {
        cost += costs::COMPLEXITY_SURCHARGE;
    }

    cost.max(costs::SIMPLE_CHAT)
}

/// Cost of a streamed exchange, computed once the full response is known
///
/// Adds one credit per started block of response text beyond the first
/// kilobyte, the SQL surcharge, the complexity surcharge for slow agent
/// calls, and one credit for long inputs. Floored at the streaming base.
#[must_use]
pub fn calculate_streaming_credits(
    message_content: &str,
    response_content: &str,
    has_sql: bool,
    processing_time_ms: u64,
) -> u32 {
    let mut cost = costs::STREAMING_CHAT;

    let response_len = response_content.len();
    if response_len > costs::LONG_RESPONSE_THRESHOLD {
        cost += response_len.div_ceil(costs::RESPONSE_BLOCK_CHARS) as u32;
    }

    if has_sql {
        cost += costs::SQL_SURCHARGE;
    }

    if processing_time_ms > costs::SLOW_RESPONSE_MS {
        cost += costs::COMPLEXITY_SURCHARGE;
    }

    if message_content.len() > costs::LONG_MESSAGE_THRESHOLD {
        cost += 1;
    }

    cost.max(costs::STREAMING_CHAT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_plain_message_costs_base() {
        assert_eq!(calculate_chat_credits("Bonjour", false, false), 1);
        assert_eq!(calculate_chat_credits("Bonjour", false, true), 1);
    }

    #[test]
    fn test_sql_surcharge() {
        assert_eq!(calculate_chat_credits("SELECT * FROM x", true, false), 3);
    }

    #[test]
    fn test_long_sql_message() {
        let long_msg = "x".repeat(600);
        assert_eq!(calculate_chat_credits(&long_msg, true, false), 6);
    }

    #[test]
    fn test_long_message_without_sql() {
        let long_msg = "x".repeat(501);
        assert_eq!(calculate_chat_credits(&long_msg, false, false), 4);

        let boundary_msg = "x".repeat(500);
        assert_eq!(calculate_chat_credits(&boundary_msg, false, false), 1);
    }

    #[test]
    fn test_streaming_adds_nothing_to_estimate() {
        // Documented no-op, not a bug
        assert_eq!(
            calculate_chat_credits("question", false, true),
            calculate_chat_credits("question", false, false)
        );
    }

    #[test]
    fn test_streaming_cost_short_response() {
        assert_eq!(calculate_streaming_credits("q", "short answer", false, 100), 1);
    }

    #[test]
    fn test_streaming_cost_per_response_block() {
        // 2500 chars => ceil(2500/1000) = 3 extra credits
        let response = "y".repeat(2500);
        assert_eq!(calculate_streaming_credits("q", &response, false, 100), 4);

        // Exactly 1000 chars stays under the threshold
        let response = "y".repeat(1000);
        assert_eq!(calculate_streaming_credits("q", &response, false, 100), 1);
    }

    #[test]
    fn test_streaming_cost_slow_processing() {
        assert_eq!(calculate_streaming_credits("q", "a", false, 10_001), 4);
        assert_eq!(calculate_streaming_credits("q", "a", false, 10_000), 1);
    }

    #[test]
    fn test_streaming_cost_stacks_surcharges() {
        let long_msg = "x".repeat(600);
        let long_response = "y".repeat(1500);
        // 1 base + 2 blocks + 2 sql + 3 slow + 1 long input
        assert_eq!(
            calculate_streaming_credits(&long_msg, &long_response, true, 12_000),
            9
        );
    }

    #[test]
    fn test_detect_sql_fenced_block() {
        assert!(detect_sql("Voici la requête:\n```sql\nSELECT 1;\n```"));
        assert!(detect_sql("```sql\nselect * from ventes\n```"));
    }

    #[test]
    fn test_detect_sql_keywords() {
        assert!(detect_sql("SELECT * FROM stock"));
        assert!(detect_sql("on va INSERT les lignes"));
        assert!(detect_sql("UPDATE produits SET prix = 2"));
        assert!(detect_sql("DELETE FROM ventes"));
    }

    #[test]
    fn test_detect_sql_is_case_sensitive() {
        // Lowercase keywords do not trigger billing (source behavior)
        assert!(!detect_sql("select * from stock"));
        assert!(!detect_sql("merci pour la mise à jour"));
    }

    #[test]
    fn test_detect_sql_requires_word_boundary() {
        assert!(!detect_sql("SELECTED items"));
        assert!(!detect_sql("UPDATES disponibles"));
    }
}
