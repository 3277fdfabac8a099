// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipelines and the pool that load-balances sources across them.
//!
//! ```text
//!   entry queue ──> Processor ──> internal queue ──> Sender ──> output (auditor)
//!   (bounded)                      (bounded)           │
//!                                                      └──> Destinations
//! ```
//!
//! Both queues hold `pipeline_buffer_size` items. A stalled main destination
//! fills the internal queue, then the entry queue, then suspends the source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::client::{Destinations, DestinationsContext};
use crate::config::{Endpoints, LogsConfig};
use crate::error::LogsError;
use crate::message::Message;
use crate::processor::{Encoder, Processor};
use crate::restart::{ParallelStopper, Startable, Stoppable};
use crate::sender::Sender;

pub struct Pipeline {
    input: mpsc::Sender<Message>,
    processor: Processor,
    sender: Sender,
}

impl Pipeline {
    /// Pipeline delivering to HTTP destinations for `endpoints`, encoding
    /// for the main endpoint.
    pub fn new(
        config: &LogsConfig,
        endpoints: &Endpoints,
        ctx: &Arc<DestinationsContext>,
        output: mpsc::Sender<Message>,
    ) -> Result<Self, LogsError> {
        Self::from_parts(
            config,
            Destinations::from_endpoints(endpoints, ctx),
            Encoder::for_endpoint(&endpoints.main),
            output,
        )
    }

    pub fn from_parts(
        config: &LogsConfig,
        destinations: Destinations,
        encoder: Encoder,
        output: mpsc::Sender<Message>,
    ) -> Result<Self, LogsError> {
        let capacity = config.pipeline_buffer_size;
        if capacity == 0 {
            return Err(LogsError::InvalidConfig(
                "pipeline buffer size must be greater than 0".to_string(),
            ));
        }
        let (input, input_rx) = mpsc::channel(capacity);
        let (payload_tx, payload_rx) = mpsc::channel(capacity);
        let processor = Processor::new(
            input_rx,
            payload_tx,
            encoder,
            &config.processing_rules,
            config.hostname.clone(),
        )?;
        let sender = Sender::new(payload_rx, output, destinations, capacity);
        Ok(Self {
            input,
            processor,
            sender,
        })
    }

    /// Entry queue of this pipeline.
    #[must_use]
    pub fn input_chan(&self) -> mpsc::Sender<Message> {
        self.input.clone()
    }
}

#[async_trait]
impl Startable for Pipeline {
    async fn start(&self) {
        self.sender.start().await;
        self.processor.start().await;
    }
}

#[async_trait]
impl Stoppable for Pipeline {
    async fn stop(&self) {
        self.processor.stop().await;
        self.sender.stop().await;
    }
}

/// Fixed-size pool of pipelines.
pub struct PipelineProvider {
    pipelines: Vec<Arc<Pipeline>>,
    stopper: ParallelStopper,
    next: AtomicUsize,
}

impl PipelineProvider {
    /// Builds `config.pipeline_count` pipelines that all forward to `output`.
    pub fn new(
        config: &LogsConfig,
        endpoints: &Endpoints,
        ctx: &Arc<DestinationsContext>,
        output: &mpsc::Sender<Message>,
    ) -> Result<Self, LogsError> {
        let pipelines = (0..config.pipeline_count)
            .map(|_| Pipeline::new(config, endpoints, ctx, output.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_pipelines(pipelines)
    }

    pub fn from_pipelines(pipelines: Vec<Pipeline>) -> Result<Self, LogsError> {
        if pipelines.is_empty() {
            return Err(LogsError::InvalidConfig(
                "pipeline count must be greater than 0".to_string(),
            ));
        }
        let pipelines: Vec<Arc<Pipeline>> = pipelines.into_iter().map(Arc::new).collect();
        let mut stopper = ParallelStopper::new();
        for pipeline in &pipelines {
            stopper.add(Arc::clone(pipeline));
        }
        Ok(Self {
            pipelines,
            stopper,
            next: AtomicUsize::new(0),
        })
    }

    /// Entry queue of the next pipeline, round-robin.
    ///
    /// Sources call this once and keep the channel, so all records of a
    /// source stay ordered within one pipeline.
    #[must_use]
    pub fn next_pipeline_chan(&self) -> mpsc::Sender<Message> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pipelines.len();
        debug!("PIPELINE | Assigning pipeline {}", index);
        self.pipelines[index].input_chan()
    }

    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }
}

#[async_trait]
impl Startable for PipelineProvider {
    async fn start(&self) {
        join_all(self.pipelines.iter().map(|pipeline| pipeline.start())).await;
        info!("PIPELINE | Started {} pipelines", self.pipelines.len());
    }
}

#[async_trait]
impl Stoppable for PipelineProvider {
    async fn stop(&self) {
        self.stopper.stop().await;
        info!("PIPELINE | Stopped {} pipelines", self.pipelines.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Destination, Transport, TransportError};
    use crate::message::{Origin, Payload, Status};

    struct Accepting;

    #[async_trait]
    impl Transport for Accepting {
        async fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn pipeline(
        config: &LogsConfig,
        ctx: &Arc<DestinationsContext>,
        output: &mpsc::Sender<Message>,
    ) -> Pipeline {
        let destinations = Destinations::new(
            Destination::new("main", Arc::new(Accepting), Arc::clone(ctx)),
            Vec::new(),
        );
        Pipeline::from_parts(config, destinations, Encoder::Json, output.clone())
            .expect("valid pipeline")
    }

    #[test]
    fn test_round_robin_selection() {
        let config = LogsConfig::default();
        let ctx = Arc::new(DestinationsContext::new(&config));
        let (output, _rx) = mpsc::channel(1);
        let pipelines = (0..3).map(|_| pipeline(&config, &ctx, &output)).collect();
        let provider = PipelineProvider::from_pipelines(pipelines).expect("non-empty pool");
        assert_eq!(provider.len(), 3);

        let picks: Vec<_> = (0..6).map(|_| provider.next_pipeline_chan()).collect();
        for i in 0..3 {
            assert!(picks[i].same_channel(&picks[i + 3]));
            assert!(!picks[i].same_channel(&picks[(i + 1) % 3]));
        }
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(PipelineProvider::from_pipelines(Vec::new()).is_err());
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        let config = LogsConfig {
            pipeline_buffer_size: 0,
            ..Default::default()
        };
        let ctx = Arc::new(DestinationsContext::new(&config));
        let (output, _rx) = mpsc::channel(1);
        let destinations = Destinations::new(
            Destination::new("main", Arc::new(Accepting), Arc::clone(&ctx)),
            Vec::new(),
        );
        assert!(Pipeline::from_parts(&config, destinations, Encoder::Json, output).is_err());
    }

    #[tokio::test]
    async fn test_provider_forwards_everything() {
        let config = LogsConfig {
            pipeline_count: 2,
            pipeline_buffer_size: 4,
            ..Default::default()
        };
        let ctx = Arc::new(DestinationsContext::new(&config));
        let (output, mut acks) = mpsc::channel(64);
        let pipelines = (0..config.pipeline_count)
            .map(|_| pipeline(&config, &ctx, &output))
            .collect();
        drop(output);
        let provider = PipelineProvider::from_pipelines(pipelines).expect("non-empty pool");
        provider.start().await;

        let first = provider.next_pipeline_chan();
        let second = provider.next_pipeline_chan();
        for offset in 0..10 {
            let chan = if offset % 2 == 0 { &first } else { &second };
            chan.send(Message::new("x", Origin::new("src", offset), Status::Info))
                .await
                .expect("pipeline input closed");
        }
        provider.stop().await;
        drop(provider);

        let mut offsets = Vec::new();
        while let Some(message) = acks.recv().await {
            offsets.push(message.origin().offset);
        }
        offsets.sort_unstable();
        assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    }
}
