// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Second stage of a pipeline: hand payloads to the destinations and forward
//! each message to the auditor once the main destination is done with it.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{Delivery, Destinations};
use crate::message::{Message, Payload};
use crate::restart::{Lifecycle, Startable, State, Stoppable};

struct Worker {
    input: mpsc::Receiver<Payload>,
    output: mpsc::Sender<Message>,
    destinations: Destinations,
    mirror_capacity: usize,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) {
        self.destinations.start(self.mirror_capacity);
        loop {
            tokio::select! {
                payload = self.input.recv() => match payload {
                    Some(payload) => self.send(payload).await,
                    None => break,
                },
                () = shutdown.cancelled() => {
                    self.input.close();
                    while let Some(payload) = self.input.recv().await {
                        self.send(payload).await;
                    }
                    break;
                }
            }
        }
        self.destinations.close();
        debug!("SENDER | Input drained, exiting");
    }

    async fn send(&mut self, payload: Payload) {
        match self.destinations.send(&payload).await {
            Delivery::Sent => {}
            Delivery::Dropped => debug!("SENDER | Payload dropped by main destination"),
            Delivery::Drained => debug!("SENDER | Payload drained without delivery"),
        }
        if self.output.send(payload.into_message()).await.is_err() {
            warn!("SENDER | Auditor is gone, acknowledgment lost");
        }
    }
}

/// Delivery stage. Every payload reaches the output in input order, whatever
/// the main destination's outcome.
pub struct Sender {
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// `mirror_capacity` bounds the queue of each additional destination.
    #[must_use]
    pub fn new(
        input: mpsc::Receiver<Payload>,
        output: mpsc::Sender<Message>,
        destinations: Destinations,
        mirror_capacity: usize,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(Some(Worker {
                input,
                output,
                destinations,
                mirror_capacity,
            })),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Startable for Sender {
    async fn start(&self) {
        if !self.lifecycle.try_start() {
            debug!("SENDER | Already started or stopped");
            return;
        }
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let handle = tokio::spawn(worker.run(self.shutdown.clone()));
            *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }
}

#[async_trait]
impl Stoppable for Sender {
    async fn stop(&self) {
        match self.lifecycle.try_stop() {
            State::Running => {
                self.shutdown.cancel();
                let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handle) = handle {
                    if let Err(e) = handle.await {
                        error!("SENDER | Task failed: {}", e);
                    }
                }
            }
            State::NotStarted => {
                drop(self.worker.lock().unwrap_or_else(PoisonError::into_inner).take());
            }
            State::Stopped => debug!("SENDER | Already stopped"),
        }
    }
}
