// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use datadog_logs_pipeline::client::{
    Destination, Destinations, DestinationsContext, Transport, TransportError,
};
use datadog_logs_pipeline::config::LogsConfig;
use datadog_logs_pipeline::message::{Message, Origin, Payload, Status};
use datadog_logs_pipeline::pipeline::Pipeline;
use datadog_logs_pipeline::processor::Encoder;
use tokio::sync::mpsc;

/// Accepts everything and remembers the offsets it saw.
#[derive(Default)]
pub struct RecordingTransport {
    offsets: Mutex<Vec<u64>>,
}

impl RecordingTransport {
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        self.offsets
            .lock()
            .expect("lock poisoned")
            .push(payload.message().origin().offset);
        Ok(())
    }
}

/// Never completes a send.
pub struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

pub fn message(identifier: &str, offset: u64) -> Message {
    Message::new(format!("line {offset}"), Origin::new(identifier, offset), Status::Info)
}

pub fn context() -> Arc<DestinationsContext> {
    Arc::new(DestinationsContext::new(&LogsConfig::default()))
}

/// Single pipeline delivering to `transport`, forwarding to `output`.
pub fn pipeline_with(
    buffer_size: usize,
    transport: Arc<dyn Transport>,
    ctx: &Arc<DestinationsContext>,
    output: mpsc::Sender<Message>,
) -> Pipeline {
    let config = LogsConfig {
        pipeline_buffer_size: buffer_size,
        ..Default::default()
    };
    let destinations = Destinations::new(
        Destination::new("main", transport, Arc::clone(ctx)),
        Vec::new(),
    );
    Pipeline::from_parts(&config, destinations, Encoder::Json, output).expect("valid pipeline")
}

/// Receives until every sender of `rx` is gone.
pub async fn collect_offsets(mut rx: mpsc::Receiver<Message>) -> Vec<u64> {
    let mut offsets = Vec::new();
    while let Some(message) = rx.recv().await {
        offsets.push(message.origin().offset);
    }
    offsets
}
