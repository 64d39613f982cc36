// ABOUTME: Streaming relay - forwards the agent byte stream while buffering a copy for bookkeeping
// ABOUTME: Buffered chunking, initial-connect retry, per-stream metrics, bounded connection pool
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Streaming Relay
//!
//! Pipes the agent's response body to the HTTP client as it arrives while
//! accumulating a server-side copy. Once the upstream body is fully drained,
//! a completion callback runs the post-response bookkeeping concurrently -
//! the relay never waits on it.
//!
//! Failure handling follows the product contract: a dead upstream fails the
//! request before any bytes go out; an upstream error status is forwarded as
//! a single SSE-style `data:` event; a mid-stream read error stops the
//! relay without retracting bytes already sent (and skips bookkeeping,
//! since the body never fully drained).

use crate::constants::streaming as defaults;
use crate::errors::{AppError, AppResult, ErrorCode};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

// ============================================================================
// Configuration & Metrics
// ============================================================================

/// Tuning knobs for the relay
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Accumulate this many bytes before forwarding a chunk
    pub chunk_buffer_bytes: usize,
    /// Retries on initial connection failure only, never mid-stream
    pub max_retries: u32,
    /// Base backoff between connection retries (multiplied per attempt)
    pub retry_backoff: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            chunk_buffer_bytes: defaults::CHUNK_BUFFER_BYTES,
            max_retries: defaults::CONNECT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(defaults::CONNECT_RETRY_BACKOFF_MS),
        }
    }
}

/// Accumulated statistics for one relayed stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetrics {
    /// Bytes forwarded downstream
    pub bytes_transferred: u64,
    /// Chunks forwarded downstream (after buffering)
    pub chunk_count: u64,
    /// Connection retries before the stream opened
    pub retry_count: u32,
    /// Wall-clock duration from open to drain
    pub duration: Duration,
    /// Derived throughput over the whole stream
    pub throughput_bytes_per_sec: f64,
}

impl StreamMetrics {
    fn finalize(bytes: u64, chunks: u64, retries: u32, started: Instant) -> Self {
        let duration = started.elapsed();
        let secs = duration.as_secs_f64();
        let throughput = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        Self {
            bytes_transferred: bytes,
            chunk_count: chunks,
            retry_count: retries,
            duration,
            throughput_bytes_per_sec: throughput,
        }
    }
}

// ============================================================================
// Optimized Streamer
// ============================================================================

/// Relay with buffered chunking and initial-connect retry
#[derive(Debug, Clone, Default)]
pub struct OptimizedStreamer {
    config: StreamerConfig,
}

impl OptimizedStreamer {
    /// Create a streamer with explicit tuning
    #[must_use]
    pub const fn new(config: StreamerConfig) -> Self {
        Self { config }
    }

    /// Open the upstream connection, retrying transient failures
    ///
    /// Only connection-level failures (`AgentUnavailable`) are retried, with
    /// linear backoff; anything else aborts immediately. Returns the
    /// response together with the number of retries spent, for the metrics.
    ///
    /// # Errors
    ///
    /// The last connection error once retries are exhausted.
    pub async fn connect_with_retry<F, Fut>(
        &self,
        mut connect: F,
    ) -> AppResult<(reqwest::Response, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<reqwest::Response>>,
    {
        let mut retries = 0u32;
        loop {
            match connect().await {
                Ok(response) => return Ok((response, retries)),
                Err(e)
                    if e.code == ErrorCode::AgentUnavailable
                        && retries < self.config.max_retries =>
                {
                    retries += 1;
                    let backoff = self.config.retry_backoff * retries;
                    warn!(retries, ?backoff, "agent connect failed, retrying: {e}");
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Relay the upstream body downstream while buffering a copy
    ///
    /// Tiny network packets are coalesced until the chunk threshold before
    /// forwarding. When the upstream drains, `on_complete` is spawned with
    /// the full text and the final metrics; the relay's own completion never
    /// waits on it.
    pub fn relay<Fut>(
        &self,
        upstream: reqwest::Response,
        retry_count: u32,
        on_complete: impl FnOnce(String, StreamMetrics) -> Fut + Send + 'static,
    ) -> impl Stream<Item = Result<Bytes, AppError>> + Send
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let threshold = self.config.chunk_buffer_bytes;
        let started = Instant::now();

        async_stream::stream! {
            let mut upstream_body = upstream.bytes_stream();
            let mut pending = BytesMut::new();
            let mut full_text = String::new();
            let mut bytes_out = 0u64;
            let mut chunks_out = 0u64;

            while let Some(next) = upstream_body.next().await {
                match next {
                    Ok(bytes) => {
                        full_text.push_str(&String::from_utf8_lossy(&bytes));
                        pending.extend_from_slice(&bytes);

                        if pending.len() >= threshold {
                            let chunk = pending.split().freeze();
                            bytes_out += chunk.len() as u64;
                            chunks_out += 1;
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        // Partial content already sent is not retracted; the
                        // body never fully drained, so bookkeeping is skipped.
                        warn!("upstream read failed mid-stream: {e}");
                        yield Err(AppError::new(
                            ErrorCode::StreamInterrupted,
                            format!("Stream read error: {e}"),
                        ));
                        return;
                    }
                }
            }

            if !pending.is_empty() {
                let chunk = pending.split().freeze();
                bytes_out += chunk.len() as u64;
                chunks_out += 1;
                yield Ok(chunk);
            }

            let metrics = StreamMetrics::finalize(bytes_out, chunks_out, retry_count, started);
            debug!(
                bytes = metrics.bytes_transferred,
                chunks = metrics.chunk_count,
                retries = metrics.retry_count,
                "stream drained, spawning bookkeeping"
            );
            tokio::spawn(on_complete(full_text, metrics));
        }
    }
}

/// Format an upstream error payload as a single SSE-style event
#[must_use]
pub fn error_event(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

// ============================================================================
// Bounded Connection Pool
// ============================================================================

/// Caps concurrent outbound streaming connections
///
/// Over-cap acquisitions fail synchronously - no queueing: a caller that
/// cannot stream now should hear it now.
#[derive(Debug, Clone)]
pub struct StreamingConnectionPool {
    max: usize,
    active: Arc<AtomicUsize>,
}

impl StreamingConnectionPool {
    /// Create a pool with the given cap
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Currently active streams
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reserve a slot, or fail immediately when at capacity
    ///
    /// # Errors
    ///
    /// `StreamLimitReached` when the cap is already met.
    pub fn try_acquire(&self) -> AppResult<StreamPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return Err(AppError::new(
                    ErrorCode::StreamLimitReached,
                    ErrorCode::StreamLimitReached.description(),
                ));
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(StreamPermit {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

/// Slot held for the lifetime of one outbound stream
#[derive(Debug)]
pub struct StreamPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
