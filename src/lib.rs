// ABOUTME: Main library entry point for the Chifa gateway
// ABOUTME: Chat orchestration and credit metering for the Chifa pharmacy assistant
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

#![deny(unsafe_code)]

//! # Chifa Gateway
//!
//! The service between pharmacy clients and the Chifa agent: every chat
//! request is authenticated, authorized against a credit ledger, forwarded
//! to the external agent (buffered or streamed), billed according to what
//! the answer actually cost, and recorded as a conversation.
//!
//! ## Architecture
//!
//! - **credits** - cost calculation, usage authorization, atomic consumption
//! - **orchestrator** - the per-request state machine tying it all together
//! - **streaming** - byte relay with concurrent bookkeeping
//! - **agent** - outbound HTTP client for the model-serving service
//! - **database** - SQLite persistence for ledger, conversations, profiles
//! - **routes** - the HTTP surface (axum)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chifa_gateway::config::ServerConfig;
//! use chifa_gateway::errors::AppResult;
//!
//! fn main() -> AppResult<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("Chifa gateway configured on port {}", config.http_port);
//!     Ok(())
//! }
//! ```

/// Outbound HTTP client for the external agent service
pub mod agent;

/// Bearer token authentication
pub mod auth;

/// Configuration management
pub mod config;

/// Application constants (cost table, limits, service identity)
pub mod constants;

/// Credits subsystem: cost calculation, authorization, consumption
pub mod credits;

/// SQLite persistence for ledger, conversations, and profiles
pub mod database;

/// Unified error handling with standard error codes and HTTP responses
pub mod errors;

/// Structured logging setup
pub mod logging;

/// Core domain models and API shapes
pub mod models;

/// End-to-end chat request flow
pub mod orchestrator;

/// Shared server resources for the HTTP layer
pub mod resources;

/// HTTP routes
pub mod routes;

/// Streaming relay, metrics, and connection pool
pub mod streaming;
