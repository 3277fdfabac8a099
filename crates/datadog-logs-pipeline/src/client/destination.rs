// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::context::DestinationsContext;
use super::http::HttpTransport;
use crate::config::Endpoint;
use crate::message::Payload;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying: network errors, timeouts, 5xx, 408 and 429.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The endpoint refused the payload, retrying cannot succeed.
    #[error("payload rejected: {0}")]
    Permanent(String),
}

/// One delivery attempt of an encoded payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<(), TransportError>;
}

/// Final outcome of [`Destination::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Permanently rejected by the endpoint.
    Dropped,
    /// Abandoned because the destinations context was stopped.
    Drained,
}

/// Exponential backoff: `min(base * 2^(errors - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `errors` consecutive failures.
    #[must_use]
    pub fn delay(&self, errors: u32) -> Duration {
        if errors == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(errors - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// A single endpoint with its own retry state.
pub struct Destination {
    name: String,
    transport: Arc<dyn Transport>,
    ctx: Arc<DestinationsContext>,
    backoff: Backoff,
    errors: u32,
}

impl Destination {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        ctx: Arc<DestinationsContext>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            ctx,
            backoff: Backoff::default(),
            errors: 0,
        }
    }

    /// HTTP destination sharing the context's connection pool.
    #[must_use]
    pub fn http(endpoint: &Endpoint, ctx: &Arc<DestinationsContext>) -> Self {
        let transport = HttpTransport::new(endpoint, ctx.client().clone());
        Self::new(endpoint.host.clone(), Arc::new(transport), Arc::clone(ctx))
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn context(&self) -> &Arc<DestinationsContext> {
        &self.ctx
    }

    /// Consecutive transient failures since the last success.
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Delivers `payload`, retrying transient failures until it is sent,
    /// rejected, or the context is stopped. Never returns an error.
    pub async fn send(&mut self, payload: &Payload) -> Delivery {
        loop {
            if self.ctx.is_stopped() {
                return Delivery::Drained;
            }

            if self.errors > 0 {
                let delay = self.backoff.delay(self.errors);
                debug!(
                    "LOGS | Retrying {} in {} ms after {} errors",
                    self.name,
                    delay.as_millis(),
                    self.errors
                );
                tokio::select! {
                    biased;
                    () = self.ctx.stopped() => return Delivery::Drained,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                () = self.ctx.stopped() => return Delivery::Drained,
                result = self.transport.send(payload) => result,
            };

            match result {
                Ok(()) => {
                    self.errors = 0;
                    return Delivery::Sent;
                }
                Err(TransportError::Permanent(reason)) => {
                    self.errors = 0;
                    error!("LOGS | {} rejected payload, dropping it: {}", self.name, reason);
                    return Delivery::Dropped;
                }
                Err(TransportError::Transient(reason)) => {
                    self.errors = self.errors.saturating_add(1);
                    warn!("LOGS | Failed to send payload to {}: {}", self.name, reason);
                }
            }
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}
