// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use datadog_logs_pipeline::auditor::Auditor;
use datadog_logs_pipeline::message::{Message, Origin, Status};
use datadog_logs_pipeline::restart::{Startable, Stoppable};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source collector turning every non-empty line of a reader into a message.
///
/// The offset of a message is its line number, so the auditor records how
/// many lines were shipped. With an auditor attached, numbering continues
/// after the last acknowledged offset, keeping the registry entry moving
/// forward across restarts.
pub struct LinesCollector<R> {
    identifier: String,
    reader: Mutex<Option<R>>,
    output: mpsc::Sender<Message>,
    auditor: Option<Arc<Auditor>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<u64>>>,
}

impl<R> LinesCollector<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, identifier: impl Into<String>, output: mpsc::Sender<Message>) -> Self {
        Self {
            identifier: identifier.into(),
            reader: Mutex::new(Some(reader)),
            output,
            auditor: None,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_auditor(mut self, auditor: Arc<Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }
}

async fn read_lines<R>(
    reader: R,
    identifier: String,
    output: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    base_offset: u64,
) -> u64
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut offset = base_offset;
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                offset += 1;
                if line.is_empty() {
                    continue;
                }
                let origin = Origin::new(identifier.as_str(), offset);
                let message = Message::new(line, origin, Status::Info);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    sent = output.send(message) => if sent.is_err() {
                        warn!("LINES | Pipeline closed, stopping {} reader", identifier);
                        break;
                    },
                }
            }
            Ok(None) => {
                info!(
                    "LINES | {} reached EOF after {} lines",
                    identifier,
                    offset - base_offset
                );
                break;
            }
            Err(e) => {
                warn!("LINES | Error reading from {}: {}", identifier, e);
                break;
            }
        }
    }
    offset - base_offset
}

#[async_trait]
impl<R> Startable for LinesCollector<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn start(&self) {
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(reader) = reader else {
            debug!("LINES | {} already started", self.identifier);
            return;
        };
        let base_offset = self
            .auditor
            .as_ref()
            .and_then(|auditor| auditor.get_offset(&self.identifier))
            .unwrap_or(0);
        if base_offset > 0 {
            debug!(
                "LINES | {} continues after acknowledged offset {}",
                self.identifier, base_offset
            );
        }
        let handle = tokio::spawn(read_lines(
            reader,
            self.identifier.clone(),
            self.output.clone(),
            self.shutdown.clone(),
            base_offset,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

#[async_trait]
impl<R> Stoppable for LinesCollector<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(lines) => debug!("LINES | {} stopped after {} lines", self.identifier, lines),
                Err(e) => warn!("LINES | {} reader failed: {}", self.identifier, e),
            }
        }
    }
}
