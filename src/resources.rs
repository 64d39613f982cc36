// ABOUTME: Shared server resources injected into every route handler
// ABOUTME: Wires database, auth, credits, orchestrator, and streaming into one Arc
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Dependency wiring for the HTTP layer

use crate::agent::AgentClient;
use crate::auth::AuthManager;
use crate::credits::CreditsManager;
use crate::database::Database;
use crate::orchestrator::ChatOrchestrator;
use crate::streaming::{OptimizedStreamer, StreamerConfig, StreamingConnectionPool};

/// Everything a request handler needs, shared behind an `Arc`
pub struct GatewayResources {
    /// Persistence
    pub database: Database,
    /// Bearer token verification
    pub auth_manager: AuthManager,
    /// Credits authorization and consumption
    pub credits: CreditsManager,
    /// End-to-end chat flow
    pub orchestrator: ChatOrchestrator,
    /// Streaming relay
    pub streamer: OptimizedStreamer,
    /// Outbound stream cap
    pub stream_pool: StreamingConnectionPool,
}

impl GatewayResources {
    /// Wire the full dependency graph
    #[must_use]
    pub fn new(
        database: Database,
        auth_manager: AuthManager,
        agent: AgentClient,
        streamer_config: StreamerConfig,
        max_concurrent_streams: usize,
    ) -> Self {
        let credits = CreditsManager::new(database.clone());
        let orchestrator = ChatOrchestrator::new(database.clone(), credits.clone(), agent);

        Self {
            database,
            auth_manager,
            credits,
            orchestrator,
            streamer: OptimizedStreamer::new(streamer_config),
            stream_pool: StreamingConnectionPool::new(max_concurrent_streams),
        }
    }
}
