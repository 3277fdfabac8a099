// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Settings read once at agent construction.
//!
//! [`LogsConfig`] holds the pipeline tunables and [`Endpoints`] the network
//! destinations. Both can be built from `DD_*` environment variables.
//!
//! Additional endpoints and processing rules arrive as JSON strings in
//! environment variables and are parsed leniently: a malformed value is
//! logged and ignored so the agent still starts and ships to the main
//! endpoint.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::error;

use crate::error::LogsError;

pub const DEFAULT_PIPELINE_BUFFER_SIZE: usize = 100;
pub const DEFAULT_PIPELINE_COUNT: usize = 4;
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_RUN_PATH: &str = "/opt/datadog-agent/run";
pub const DEFAULT_OPEN_FILES_LIMIT: usize = 100;
pub const DEFAULT_FRAME_SIZE: usize = 9000;
pub const DEFAULT_AUDITOR_TTL: Duration = Duration::from_secs(23 * 60 * 60);
pub const DEFAULT_LOGS_HOST: &str = "agent-http-intake.logs.datadoghq.com";
pub const DEFAULT_LOGS_PORT: u16 = 443;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the logs pipeline core.
#[derive(Debug, Clone)]
pub struct LogsConfig {
    /// Capacity of every bounded queue between stages. Lower it to reduce
    /// the memory footprint, raise it to absorb longer network stalls.
    pub pipeline_buffer_size: usize,
    /// Number of pipelines in the pool.
    pub pipeline_count: usize,
    /// Time allowed for a clean shutdown before network delivery is abandoned.
    pub stop_grace_period: Duration,
    /// Directory holding the auditor registry.
    pub run_path: PathBuf,
    /// Opaque to the core, read by file collectors.
    pub open_files_limit: usize,
    /// Opaque to the core, read by network listeners.
    pub frame_size: usize,
    /// Hostname stamped on every encoded record.
    pub hostname: String,
    /// Registry entries not updated for this long are purged.
    pub auditor_ttl: Duration,
    pub processing_rules: Vec<ProcessingRule>,
    /// Timeout of a single HTTP request to an intake endpoint.
    pub http_timeout: Duration,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            pipeline_buffer_size: DEFAULT_PIPELINE_BUFFER_SIZE,
            pipeline_count: DEFAULT_PIPELINE_COUNT,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            run_path: PathBuf::from(DEFAULT_RUN_PATH),
            open_files_limit: DEFAULT_OPEN_FILES_LIMIT,
            frame_size: DEFAULT_FRAME_SIZE,
            hostname: String::new(),
            auditor_ttl: DEFAULT_AUDITOR_TTL,
            processing_rules: Vec::new(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl LogsConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, LogsError> {
        let defaults = Self::default();
        let auditor_ttl = match parse_env::<u64>("DD_LOGS_CONFIG_AUDITOR_TTL") {
            Some(hours) => ttl_from_hours(hours)?,
            None => defaults.auditor_ttl,
        };
        let config = Self {
            pipeline_buffer_size: parse_env("DD_LOGS_CONFIG_PIPELINE_BUFFER_SIZE")
                .unwrap_or(defaults.pipeline_buffer_size),
            pipeline_count: parse_env("DD_LOGS_CONFIG_PIPELINE_COUNT")
                .unwrap_or(defaults.pipeline_count),
            stop_grace_period: parse_env("DD_LOGS_CONFIG_STOP_GRACE_PERIOD")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_grace_period),
            run_path: env::var("DD_LOGS_CONFIG_RUN_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.run_path),
            open_files_limit: parse_env("DD_LOGS_CONFIG_OPEN_FILES_LIMIT")
                .unwrap_or(defaults.open_files_limit),
            frame_size: parse_env("DD_LOGS_CONFIG_FRAME_SIZE").unwrap_or(defaults.frame_size),
            hostname: env::var("DD_HOSTNAME").unwrap_or(defaults.hostname),
            auditor_ttl,
            processing_rules: env::var("DD_LOGS_CONFIG_PROCESSING_RULES")
                .ok()
                .and_then(|raw| deserialize_processing_rules(Value::String(raw)).ok())
                .flatten()
                .unwrap_or_default(),
            http_timeout: parse_env("DD_LOGS_CONFIG_HTTP_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            https_proxy: env::var("DD_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            log_level: env::var("DD_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), LogsError> {
        if self.pipeline_buffer_size == 0 {
            return Err(LogsError::InvalidConfig(
                "pipeline buffer size must be greater than 0".to_string(),
            ));
        }
        if self.pipeline_count == 0 {
            return Err(LogsError::InvalidConfig(
                "pipeline count must be greater than 0".to_string(),
            ));
        }
        if self.run_path.as_os_str().is_empty() {
            return Err(LogsError::InvalidConfig(
                "DD_LOGS_CONFIG_RUN_PATH cannot be empty".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(LogsError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn ttl_from_hours(hours: u64) -> Result<Duration, LogsError> {
    hours
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| {
            LogsError::InvalidConfig(format!(
                "DD_LOGS_CONFIG_AUDITOR_TTL of {hours} hours is out of range"
            ))
        })
}

fn bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|val| matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// One network endpoint a destination delivers to.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// Encode records as protobuf instead of agent-json.
    pub use_proto: bool,
    pub use_compression: bool,
    pub compression_level: i32,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            host: DEFAULT_LOGS_HOST.to_string(),
            port: DEFAULT_LOGS_PORT,
            use_ssl: true,
            use_proto: false,
            use_compression: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Endpoint {
    /// Intake URL records are POSTed to.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}/api/v2/logs", self.host, self.port)
    }
}

/// The main endpoint plus any number of mirrored ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub main: Endpoint,
    pub additionals: Vec<Endpoint>,
}

impl Endpoints {
    #[must_use]
    pub fn new(main: Endpoint, additionals: Vec<Endpoint>) -> Self {
        Self { main, additionals }
    }

    /// Create the endpoints from environment variables
    pub fn from_env() -> Result<Self, LogsError> {
        let api_key = env::var("DD_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(LogsError::InvalidConfig("DD_API_KEY is not set".to_string()));
        }

        let defaults = Endpoint::default();
        let (host, port) = match env::var("DD_LOGS_CONFIG_LOGS_DD_URL") {
            Ok(url) if !url.trim().is_empty() => parse_host_port(&url, defaults.port)?,
            _ => (defaults.host, defaults.port),
        };

        let main = Endpoint {
            api_key,
            host,
            port,
            use_ssl: bool_env("DD_LOGS_CONFIG_USE_SSL", defaults.use_ssl),
            use_proto: bool_env("DD_LOGS_CONFIG_USE_PROTO", defaults.use_proto),
            use_compression: bool_env("DD_LOGS_CONFIG_USE_COMPRESSION", defaults.use_compression),
            compression_level: parse_env("DD_LOGS_CONFIG_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression_level),
        };

        let additionals = env::var("DD_LOGS_CONFIG_ADDITIONAL_ENDPOINTS")
            .ok()
            .and_then(|raw| deserialize_logs_additional_endpoints(Value::String(raw)).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|additional| additional.into_endpoint(&main))
            .collect();

        Ok(Self { main, additionals })
    }
}

fn parse_host_port(url: &str, default_port: u16) -> Result<(String, u16), LogsError> {
    let trimmed = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                LogsError::InvalidConfig(format!("Invalid port in logs intake URL '{url}'"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), default_port)),
    }
}

/// Additional endpoint as it appears in `DD_LOGS_CONFIG_ADDITIONAL_ENDPOINTS`.
///
/// Field names `Host` and `Port` are capitalized to match the agent's JSON format.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct LogsAdditionalEndpoint {
    pub api_key: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    pub is_reliable: bool,
}

impl LogsAdditionalEndpoint {
    /// Builds an endpoint sharing the encoding and compression of `main`.
    #[must_use]
    pub fn into_endpoint(self, main: &Endpoint) -> Endpoint {
        Endpoint {
            api_key: self.api_key,
            host: self.host,
            port: self.port,
            use_ssl: main.use_ssl,
            use_proto: main.use_proto,
            use_compression: main.use_compression,
            compression_level: main.compression_level,
        }
    }
}

/// Deserializes additional logs endpoints from a JSON string.
///
/// Invalid JSON logs an error and yields no additional endpoint, so a
/// misconfigured mirror never prevents shipping to the main endpoint.
#[allow(clippy::module_name_repetitions)]
pub fn deserialize_logs_additional_endpoints<'de, D>(
    deserializer: D,
) -> Result<Vec<LogsAdditionalEndpoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::String(s) if !s.is_empty() => Ok(serde_json::from_str(&s).unwrap_or_else(|err| {
            error!("Failed to deserialize DD_LOGS_CONFIG_ADDITIONAL_ENDPOINTS: {err}");
            vec![]
        })),
        _ => Ok(Vec::new()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    ExcludeAtMatch,
    IncludeAtMatch,
    MaskSequences,
}

/// A user-defined filtering or masking rule, compiled by the processor.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProcessingRule {
    #[serde(rename = "type")]
    pub kind: Kind,
    pub name: String,
    pub pattern: String,
    pub replace_placeholder: Option<String>,
}

/// Deserializes processing rules from either a JSON string or a JSON array.
///
/// Rules that fail to parse are logged and skipped.
pub fn deserialize_processing_rules<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<ProcessingRule>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::String(s) => match serde_json::from_str(&s) {
            Ok(values) => Ok(Some(values)),
            Err(e) => {
                error!("Failed to parse processing rules: {}, ignoring", e);
                Ok(None)
            }
        },
        Value::Array(a) => {
            let mut values = Vec::new();
            for v in a {
                match serde_json::from_value(v) {
                    Ok(rule) => values.push(rule),
                    Err(e) => {
                        error!("Failed to parse processing rule: {}, ignoring", e);
                    }
                }
            }
            if values.is_empty() {
                Ok(None)
            } else {
                Ok(Some(values))
            }
        }
        _ => Ok(None),
    }
}
