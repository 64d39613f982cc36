// ABOUTME: Application constants for credit costs, usage limits, and service identity
// ABOUTME: Central place for every magic number the metering and streaming layers rely on
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Application constants
//!
//! The credit cost constants mirror the production pricing table exactly.
//! They look arbitrary because they are product decisions, not derivations;
//! do not fold them together.

/// Credit cost table
pub mod costs {
    /// Base cost of a buffered chat completion
    pub const SIMPLE_CHAT: u32 = 1;

    /// Base cost of a streamed chat completion
    pub const STREAMING_CHAT: u32 = 1;

    /// Surcharge when the exchange involves SQL
    pub const SQL_SURCHARGE: u32 = 2;

    /// Surcharge for complex requests (long input or slow processing)
    pub const COMPLEXITY_SURCHARGE: u32 = 3;

    /// Input length above which the complexity surcharge applies (chars)
    pub const LONG_MESSAGE_THRESHOLD: usize = 500;

    /// Response length above which per-kilobyte billing starts (chars)
    pub const LONG_RESPONSE_THRESHOLD: usize = 1000;

    /// One extra credit per started block of this many response chars
    pub const RESPONSE_BLOCK_CHARS: usize = 1000;

    /// Processing time above which the complexity surcharge applies
    pub const SLOW_RESPONSE_MS: u64 = 10_000;
}

/// Usage limits for demo and streaming policy
pub mod limits {
    /// Credits granted to a new demo account
    pub const DEMO_TRIAL_CREDITS: i64 = 10;

    /// Messages a demo account may send per UTC day
    pub const DEMO_DAILY_MESSAGE_LIMIT: i64 = 10;

    /// Longest message a demo account may send (chars)
    pub const DEMO_MAX_MESSAGE_CHARS: usize = 1000;

    /// Upper bound on a single agent exchange
    pub const AGENT_TIMEOUT_SECS: u64 = 60;

    /// Concurrent outbound streaming connections per process
    pub const MAX_CONCURRENT_STREAMS: usize = 64;

    /// JWT lifetime issued/accepted by the gateway
    pub const SESSION_EXPIRY_HOURS: u64 = 24;
}

/// Streaming relay tuning
pub mod streaming {
    /// Accumulate this many bytes before forwarding a chunk downstream
    pub const CHUNK_BUFFER_BYTES: usize = 1024;

    /// Retries on initial connection failure (never mid-stream)
    pub const CONNECT_MAX_RETRIES: u32 = 3;

    /// Base backoff between connection retries
    pub const CONNECT_RETRY_BACKOFF_MS: u64 = 250;
}

/// Service identity strings
pub mod service_names {
    /// This service
    pub const CHIFA_GATEWAY: &str = "chifa-gateway";

    /// The external model-serving agent
    pub const AGENT_SERVICE: &str = "Chifa Agent";

    /// Audience claim on gateway-issued JWTs
    pub const JWT_AUDIENCE: &str = "chifa-gateway";
}
