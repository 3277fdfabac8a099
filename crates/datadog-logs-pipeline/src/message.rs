// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records as they travel from a source collector to the auditor.
//!
//! A [`Message`] is created once by a collector and never mutated afterwards.
//! The processor wraps it into a [`Payload`] carrying the encoded bytes; the
//! sender hands the payload to the destinations and forwards the original
//! message to the auditor once the main destination is done with it.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Severity attached to a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    #[default]
    Info,
    Debug,
}

impl Status {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Emergency => "emergency",
            Status::Alert => "alert",
            Status::Critical => "critical",
            Status::Error => "error",
            Status::Warning => "warn",
            Status::Notice => "notice",
            Status::Info => "info",
            Status::Debug => "debug",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record came from and how far the source has been read.
///
/// `identifier` keys the auditor registry; `offset` is the position a
/// collector resumes from after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Origin {
    pub identifier: String,
    pub offset: u64,
    pub service: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
}

impl Origin {
    #[must_use]
    pub fn new(identifier: impl Into<String>, offset: u64) -> Self {
        Self {
            identifier: identifier.into(),
            offset,
            ..Default::default()
        }
    }
}

/// One immutable log record plus its source and timing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: Vec<u8>,
    origin: Origin,
    status: Status,
    ingestion_timestamp: SystemTime,
}

impl Message {
    #[must_use]
    pub fn new(content: impl Into<Vec<u8>>, origin: Origin, status: Status) -> Self {
        Self {
            content: content.into(),
            origin,
            status,
            ingestion_timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, ingestion_timestamp: SystemTime) -> Self {
        self.ingestion_timestamp = ingestion_timestamp;
        self
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn ingestion_timestamp(&self) -> SystemTime {
        self.ingestion_timestamp
    }

    /// Size of the raw content in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Milliseconds since the unix epoch, clamped to zero for clocks set before it.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.ingestion_timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A message together with its wire encoding for the main endpoint.
///
/// The encoded bytes are shared so fanning out to additional destinations
/// does not copy them.
#[derive(Debug, Clone)]
pub struct Payload {
    message: Message,
    encoded: Arc<Vec<u8>>,
}

impl Payload {
    #[must_use]
    pub fn new(message: Message, encoded: Vec<u8>) -> Self {
        Self {
            message,
            encoded: Arc::new(encoded),
        }
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}
