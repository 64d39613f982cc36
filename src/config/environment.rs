// ABOUTME: Environment-based server configuration with sane development defaults
// ABOUTME: One required secret, everything else defaulted and overridable
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Server Configuration
//!
//! Environment-only configuration. Every knob has a development default
//! except the JWT signing secret, which must be provided.
//!
//! | Variable | Default |
//! |---|---|
//! | `CHIFA_HTTP_PORT` | `8080` |
//! | `DATABASE_URL` | `sqlite:data/chifa-gateway.db` |
//! | `CHIFA_JWT_SECRET` | required |
//! | `CHIFA_JWT_EXPIRY_HOURS` | `24` |
//! | `CHIFA_AGENT_URL` | `http://localhost:8001` |
//! | `CHIFA_STREAM_BUFFER_BYTES` | `1024` |
//! | `CHIFA_STREAM_MAX_RETRIES` | `3` |
//! | `CHIFA_STREAM_RETRY_BACKOFF_MS` | `250` |
//! | `CHIFA_MAX_CONCURRENT_STREAMS` | `64` |

use crate::agent::AgentConfig;
use crate::constants::{limits, streaming};
use crate::errors::{AppError, AppResult};
use crate::streaming::StreamerConfig;
use std::env;
use std::time::Duration;

/// Database connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
}

/// Authentication settings
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared JWT signing secret (never logged)
    pub jwt_secret: String,
    /// Token lifetime accepted/issued
    pub jwt_expiry_hours: u64,
}

/// Streaming relay settings
#[derive(Debug, Clone)]
pub struct StreamingSettings {
    /// Coalescing threshold before forwarding a chunk
    pub chunk_buffer_bytes: usize,
    /// Initial-connection retries
    pub max_retries: u32,
    /// Base backoff between retries
    pub retry_backoff_ms: u64,
    /// Concurrent outbound stream cap
    pub max_concurrent_streams: usize,
}

impl StreamingSettings {
    /// Convert to the relay's tuning struct
    #[must_use]
    pub const fn to_streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            chunk_buffer_bytes: self.chunk_buffer_bytes,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Database settings
    pub database: DatabaseConfig,
    /// Auth settings
    pub auth: AuthConfig,
    /// Outbound agent settings
    pub agent: AgentConfig,
    /// Streaming relay settings
    pub streaming: StreamingSettings,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns an error when `CHIFA_JWT_SECRET` is missing or empty.
    pub fn from_env() -> AppResult<Self> {
        let jwt_secret = env::var("CHIFA_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::config("CHIFA_JWT_SECRET must be set"))?;

        Ok(Self {
            http_port: env_parse("CHIFA_HTTP_PORT", 8080),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/chifa-gateway.db".to_owned()),
            },
            auth: AuthConfig {
                jwt_secret,
                jwt_expiry_hours: env_parse("CHIFA_JWT_EXPIRY_HOURS", limits::SESSION_EXPIRY_HOURS),
            },
            agent: AgentConfig::from_env(),
            streaming: StreamingSettings {
                chunk_buffer_bytes: env_parse(
                    "CHIFA_STREAM_BUFFER_BYTES",
                    streaming::CHUNK_BUFFER_BYTES,
                ),
                max_retries: env_parse("CHIFA_STREAM_MAX_RETRIES", streaming::CONNECT_MAX_RETRIES),
                retry_backoff_ms: env_parse(
                    "CHIFA_STREAM_RETRY_BACKOFF_MS",
                    streaming::CONNECT_RETRY_BACKOFF_MS,
                ),
                max_concurrent_streams: env_parse(
                    "CHIFA_MAX_CONCURRENT_STREAMS",
                    limits::MAX_CONCURRENT_STREAMS,
                ),
            },
        })
    }

    /// One-line startup summary (no secrets)
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "http_port={} database={} agent={} streams(max={}, buffer={}B, retries={})",
            self.http_port,
            self.database.url,
            self.agent.base_url,
            self.streaming.max_concurrent_streams,
            self.streaming.chunk_buffer_bytes,
            self.streaming.max_retries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_never_contains_secret() {
        let config = ServerConfig {
            http_port: 8080,
            database: DatabaseConfig {
                url: "sqlite::memory:".to_owned(),
            },
            auth: AuthConfig {
                jwt_secret: "super-secret-value".to_owned(),
                jwt_expiry_hours: 24,
            },
            agent: AgentConfig::default(),
            streaming: StreamingSettings {
                chunk_buffer_bytes: 1024,
                max_retries: 3,
                retry_backoff_ms: 250,
                max_concurrent_streams: 64,
            },
        };
        assert!(!config.summary().contains("super-secret-value"));
    }

    #[test]
    fn test_streamer_config_conversion() {
        let settings = StreamingSettings {
            chunk_buffer_bytes: 2048,
            max_retries: 5,
            retry_backoff_ms: 100,
            max_concurrent_streams: 8,
        };
        let streamer = settings.to_streamer_config();
        assert_eq!(streamer.chunk_buffer_bytes, 2048);
        assert_eq!(streamer.max_retries, 5);
        assert_eq!(streamer.retry_backoff, Duration::from_millis(100));
    }
}
