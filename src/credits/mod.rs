// ABOUTME: Credits subsystem - cost calculation, usage authorization, consumption, monitoring
// ABOUTME: The gate every chat request passes before and after the agent call
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Credits Subsystem
//!
//! Everything between "may this user send a message" and "the ledger now
//! reflects what it cost":
//!
//! - [`cost`] - pure cost calculators and SQL detection
//! - [`CreditsManager`] - read-only authorization checks and the atomic
//!   consumption transaction
//! - [`StreamingCreditsMonitor`] - in-memory advisory counter for open
//!   streams
//!
//! Authorization checks are speculative and repeatable; only the consumption
//! transaction mutates the ledger, and it re-checks the balance itself.

pub mod cost;
mod manager;
mod monitor;

pub use manager::{
    CreditCheck, CreditConsumption, CreditsManager, StreamingPermission, StreamingPreAuth,
};
pub use monitor::StreamingCreditsMonitor;
