// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Composition root of the logs core.
//!
//! Start order, consumers first: destinations context, auditor, pipelines,
//! then every source collector.
//!
//! Stop order, producers first: all source collectors in parallel, then the
//! pipelines, then the auditor, then the destinations context. The whole stop
//! sequence races a grace period. When the grace period wins, the
//! destinations context is stopped early so every destination drains instead
//! of delivering, and the stop sequence still runs to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::auditor::Auditor;
use crate::client::DestinationsContext;
use crate::config::{Endpoints, LogsConfig};
use crate::error::LogsError;
use crate::health::HealthRegistry;
use crate::pipeline::PipelineProvider;
use crate::restart::{ParallelStopper, Restartable, SerialStopper, Startable, Starter, Stoppable};

/// Name the auditor registers under in the health registry.
pub const HEALTH_COMPONENT: &str = "logs-agent";

pub struct Agent {
    stop_grace_period: Duration,
    destinations_ctx: Arc<DestinationsContext>,
    auditor: Arc<Auditor>,
    pipeline_provider: Arc<PipelineProvider>,
    inputs: Vec<Arc<dyn Restartable>>,
}

impl Agent {
    /// Wires the shared context, the auditor and `config.pipeline_count`
    /// pipelines delivering to `endpoints`.
    pub fn new(
        config: &LogsConfig,
        endpoints: &Endpoints,
        health: &HealthRegistry,
    ) -> Result<Self, LogsError> {
        config.validate()?;
        let destinations_ctx = Arc::new(DestinationsContext::new(config));
        let auditor = Arc::new(Auditor::new(config, health.register(HEALTH_COMPONENT)));
        let pipeline_provider = Arc::new(PipelineProvider::new(
            config,
            endpoints,
            &destinations_ctx,
            &auditor.channel(),
        )?);
        Ok(Self::from_parts(
            config.stop_grace_period,
            destinations_ctx,
            auditor,
            pipeline_provider,
        ))
    }

    #[must_use]
    pub fn from_parts(
        stop_grace_period: Duration,
        destinations_ctx: Arc<DestinationsContext>,
        auditor: Arc<Auditor>,
        pipeline_provider: Arc<PipelineProvider>,
    ) -> Self {
        Self {
            stop_grace_period,
            destinations_ctx,
            auditor,
            pipeline_provider,
            inputs: Vec::new(),
        }
    }

    /// Registers a source collector. Collectors are started after the
    /// pipelines and stopped before them.
    pub fn add_input(&mut self, input: Arc<dyn Restartable>) -> &mut Self {
        self.inputs.push(input);
        self
    }

    #[must_use]
    pub fn pipeline_provider(&self) -> &Arc<PipelineProvider> {
        &self.pipeline_provider
    }

    #[must_use]
    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }

    #[must_use]
    pub fn destinations_context(&self) -> &Arc<DestinationsContext> {
        &self.destinations_ctx
    }

    #[must_use]
    pub fn stop_grace_period(&self) -> Duration {
        self.stop_grace_period
    }
}

#[async_trait]
impl Startable for Agent {
    async fn start(&self) {
        let mut starter = Starter::new();
        starter
            .add(Arc::clone(&self.destinations_ctx))
            .add(Arc::clone(&self.auditor))
            .add(Arc::clone(&self.pipeline_provider));
        for input in &self.inputs {
            starter.add(Arc::clone(input));
        }
        starter.start().await;
        info!("LOGS | Logs agent started with {} inputs", self.inputs.len());
    }
}

#[async_trait]
impl Stoppable for Agent {
    async fn stop(&self) {
        let mut inputs = ParallelStopper::new();
        for input in &self.inputs {
            inputs.add(Arc::clone(input));
        }
        let mut stopper = SerialStopper::new();
        stopper
            .add(inputs)
            .add(Arc::clone(&self.pipeline_provider))
            .add(Arc::clone(&self.auditor))
            .add(Arc::clone(&self.destinations_ctx));

        let stop = stopper.stop();
        tokio::pin!(stop);
        tokio::select! {
            () = &mut stop => {
                info!("LOGS | Logs agent stopped");
            }
            () = tokio::time::sleep(self.stop_grace_period) => {
                warn!(
                    "LOGS | Timed out after {}s when stopping logs agent, forcing it to stop now",
                    self.stop_grace_period.as_secs()
                );
                self.destinations_ctx.stop().await;
                stop.await;
                info!("LOGS | Logs agent force-stopped");
            }
        }
    }
}
