// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! First stage of a pipeline: filter, mask and encode.
//!
//! # Rule Execution Order
//!
//! Rules run in the order they are configured:
//! 1. If an **ExcludeAtMatch** rule matches, the message is dropped
//! 2. If an **IncludeAtMatch** rule does not match, the message is dropped
//! 3. **MaskSequences** rules replace every match with their placeholder
//!
//! Masking only affects the encoded payload. The [`Message`] itself is never
//! modified, the auditor still sees the original origin and offset.

use std::borrow::Cow;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use protobuf::CodedOutputStream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{Endpoint, Kind, ProcessingRule};
use crate::error::LogsError;
use crate::message::{Message, Payload};
use crate::restart::{Lifecycle, Startable, State, Stoppable};

/// Wire format of the main endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Json,
    Proto,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    message: &'a str,
    status: &'a str,
    timestamp: i64,
    hostname: &'a str,
    service: &'a str,
    ddsource: &'a str,
    ddtags: String,
}

impl Encoder {
    #[must_use]
    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        if endpoint.use_proto {
            Encoder::Proto
        } else {
            Encoder::Json
        }
    }

    /// Encodes `message` with `content` in place of its raw content.
    pub fn encode(
        &self,
        message: &Message,
        content: &str,
        hostname: &str,
    ) -> Result<Vec<u8>, LogsError> {
        let origin = message.origin();
        match self {
            Encoder::Json => {
                let record = JsonRecord {
                    message: content,
                    status: message.status().as_str(),
                    timestamp: message.timestamp_millis(),
                    hostname,
                    service: origin.service.as_deref().unwrap_or_default(),
                    ddsource: origin.source.as_deref().unwrap_or_default(),
                    ddtags: origin.tags.join(","),
                };
                Ok(serde_json::to_vec(&record)?)
            }
            Encoder::Proto => {
                let mut buf = Vec::with_capacity(content.len() + 64);
                {
                    let mut os = CodedOutputStream::vec(&mut buf);
                    os.write_string(1, content)?;
                    os.write_string(2, message.status().as_str())?;
                    os.write_int64(3, message.timestamp_millis())?;
                    os.write_string(4, hostname)?;
                    if let Some(service) = &origin.service {
                        os.write_string(5, service)?;
                    }
                    if let Some(source) = &origin.source {
                        os.write_string(6, source)?;
                    }
                    for tag in &origin.tags {
                        os.write_string(7, tag)?;
                    }
                    os.flush()?;
                }
                Ok(buf)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub kind: Kind,
    pub regex: regex::Regex,
    pub placeholder: String,
}

/// Compiles every rule, failing on the first invalid pattern.
pub fn compile_rules(rules: &[ProcessingRule]) -> Result<Vec<Rule>, LogsError> {
    rules
        .iter()
        .map(|rule| {
            let regex =
                regex::Regex::new(&rule.pattern).map_err(|source| LogsError::InvalidPattern {
                    name: rule.name.clone(),
                    source,
                })?;
            Ok(Rule {
                kind: rule.kind,
                regex,
                placeholder: rule.replace_placeholder.clone().unwrap_or_default(),
            })
        })
        .collect()
}

/// Returns the content to encode, or `None` when the message is filtered out.
#[must_use]
pub fn apply_rules<'a>(rules: &[Rule], content: &'a str) -> Option<Cow<'a, str>> {
    let mut content = Cow::Borrowed(content);
    for rule in rules {
        match rule.kind {
            Kind::ExcludeAtMatch => {
                if rule.regex.is_match(&content) {
                    return None;
                }
            }
            Kind::IncludeAtMatch => {
                if !rule.regex.is_match(&content) {
                    return None;
                }
            }
            Kind::MaskSequences => {
                let masked = match rule.regex.replace_all(&content, rule.placeholder.as_str()) {
                    Cow::Owned(masked) => Some(masked),
                    Cow::Borrowed(_) => None,
                };
                if let Some(masked) = masked {
                    content = Cow::Owned(masked);
                }
            }
        }
    }
    Some(content)
}

struct Worker {
    input: mpsc::Receiver<Message>,
    output: mpsc::Sender<Payload>,
    encoder: Encoder,
    rules: Vec<Rule>,
    hostname: String,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                message = self.input.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => break,
                },
                () = shutdown.cancelled() => {
                    self.input.close();
                    while let Some(message) = self.input.recv().await {
                        self.process(message).await;
                    }
                    break;
                }
            }
        }
        debug!("PROCESSOR | Input drained, exiting");
    }

    async fn process(&self, message: Message) {
        let raw = String::from_utf8_lossy(message.content());
        let Some(content) = apply_rules(&self.rules, &raw) else {
            debug!("PROCESSOR | Message from {} filtered out", message.origin().identifier);
            return;
        };
        let encoded = match self.encoder.encode(&message, &content, &self.hostname) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(
                    "PROCESSOR | Failed to encode message from {}: {}",
                    message.origin().identifier,
                    e
                );
                return;
            }
        };
        if self.output.send(Payload::new(message, encoded)).await.is_err() {
            warn!("PROCESSOR | Sender is gone, payload lost");
        }
    }
}

/// Encoding stage between a pipeline's entry queue and its sender.
pub struct Processor {
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    /// Fails when a processing rule does not compile.
    pub fn new(
        input: mpsc::Receiver<Message>,
        output: mpsc::Sender<Payload>,
        encoder: Encoder,
        rules: &[ProcessingRule],
        hostname: impl Into<String>,
    ) -> Result<Self, LogsError> {
        let worker = Worker {
            input,
            output,
            encoder,
            rules: compile_rules(rules)?,
            hostname: hostname.into(),
        };
        Ok(Self {
            lifecycle: Lifecycle::default(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(Some(worker)),
            task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Startable for Processor {
    async fn start(&self) {
        if !self.lifecycle.try_start() {
            debug!("PROCESSOR | Already started or stopped");
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
impl Stoppable for Processor {
    async fn stop(&self) {
        match self.lifecycle.try_stop() {
            State::Running => {
                self.shutdown.cancel();
                let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handle) = handle {
                    if let Err(e) = handle.await {
                        error!("PROCESSOR | Task failed: {}", e);
                    }
                }
            }
            // Dropping the unused worker closes both queues.
            State::NotStarted => {
                drop(self.worker.lock().unwrap_or_else(PoisonError::into_inner).take());
            }
            State::Stopped => debug!("PROCESSOR | Already stopped"),
        }
    }
}
