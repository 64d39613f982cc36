// ABOUTME: Configuration management for the gateway
// ABOUTME: Environment-only configuration, no config files
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! Configuration management and environment loading

pub mod environment;

pub use environment::ServerConfig;
