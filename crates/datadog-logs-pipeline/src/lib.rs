// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog Logs Pipeline
//!
//! Core data movement and lifecycle control of a log-shipping agent: records
//! travel from source collectors to remote intakes without being dropped,
//! even under sustained network failure, and every moving part is started and
//! stopped in a data-safe order.
//!
//! ## Architecture
//!
//! ```text
//!   source collectors
//!          │  bounded entry queue, blocks when full
//!          v
//!   ┌──────────── Pipeline (x pipeline_count) ────────────┐
//!   │  Processor ──> bounded queue ──> Sender ─────────────┼──> Destinations ──> intake
//!   └─────────────────────────────────────┬───────────────┘
//!                                         v
//!                                      Auditor ──> <run_path>/registry.json
//! ```
//!
//! - [`agent`]: composition root and the grace-period shutdown race
//! - [`pipeline`]: pipelines and the pool they are load-balanced in
//! - [`processor`] / [`sender`]: the two pipeline stages
//! - [`client`]: destinations, retries and the forced-drain context
//! - [`auditor`]: durable per-source offsets
//! - [`restart`]: start/stop capabilities and orchestrators
//! - [`config`], [`message`], [`health`], [`error`]: supporting types

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod auditor;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod restart;
pub mod sender;

pub use agent::Agent;
pub use error::LogsError;
