// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors surfaced by the logs pipeline.
///
/// Network delivery failures are not part of this enum: destinations retry
/// them internally and they never reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum LogsError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to persist auditor registry to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to encode protobuf payload: {0}")]
    Encoding(#[from] protobuf::Error),

    #[error("Invalid pattern in processing rule '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}
