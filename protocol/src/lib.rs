// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Mintbridge Protocol: Core Library
//!
//! The off-ledger half of the settlement bridge: everything between a signed
//! HTTP request and a call into the escrow ledger.
//!
//! ## Modules
//!
//! - **config**: Constants, header names, and the JSON bridge configuration.
//! - **clock**: Wall-clock abstraction so time-dependent rules are testable.
//! - **ledger**: Intent types, the error taxonomy, and the `LedgerClient` seam.
//! - **auth**: HMAC-SHA256 request authenticity, one verifier per channel.
//! - **idempotency**: Response cache with claim markers; memory and sled backends.
//! - **dead_letter**: Durable queue for settlements that exhausted retries.
//! - **settlement**: Notification payloads, retry policy, and the executor.
//! - **storage**: The sled handle the durable stores share, and the intent
//!   ledger journal.
//!
//! ## Ground Rules
//!
//! 1. Only infrastructure faults are retried. Business rejections surface
//!    on first sight.
//! 2. A side-effecting operation runs at most once per idempotency key.
//! 3. Nothing that exhausted its retries is dropped silently.

pub mod auth;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod idempotency;
pub mod ledger;
pub mod settlement;
pub mod storage;
