// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::LogsConfig;
use crate::restart::{Lifecycle, Startable, State, Stoppable};

/// State shared by every destination of the process: the pooled HTTP client
/// and the one-way forced-stop switch.
#[derive(Debug)]
pub struct DestinationsContext {
    client: reqwest::Client,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
}

impl DestinationsContext {
    #[must_use]
    pub fn new(config: &LogsConfig) -> Self {
        Self::with_client(get_client(config))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// True once [`Stoppable::stop`] has been called. Never flips back.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the context is stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Startable for DestinationsContext {
    async fn start(&self) {
        if self.lifecycle.try_start() {
            debug!("LOGS | Destinations context started");
        } else {
            debug!("LOGS | Destinations context already started or stopped");
        }
    }
}

#[async_trait]
impl Stoppable for DestinationsContext {
    async fn stop(&self) {
        self.lifecycle.try_stop();
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!("LOGS | Destinations context stopped");
    }
}

/// Builds the pooled client, falling back to a direct connection when the
/// proxy cannot be used and to reqwest defaults as a last resort.
fn get_client(config: &LogsConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "LOGS | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "LOGS | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &LogsConfig, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.https_proxy {
            client = client.proxy(reqwest::Proxy::https(https_uri.clone())?);
        }
    }

    Ok(client.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_stop_is_one_way_and_idempotent() {
        let ctx = DestinationsContext::new(&LogsConfig::default());
        ctx.start().await;
        assert_eq!(ctx.state(), State::Running);
        assert!(!ctx.is_stopped());

        ctx.stop().await;
        ctx.stop().await;
        assert!(ctx.is_stopped());
        assert_eq!(ctx.state(), State::Stopped);

        ctx.start().await;
        assert!(ctx.is_stopped(), "a stopped context never resumes");
        ctx.stopped().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_clean_stop_logs_neutral_message() {
        let ctx = DestinationsContext::new(&LogsConfig::default());
        ctx.start().await;
        ctx.stop().await;
        assert!(logs_contain("LOGS | Destinations context stopped"));
        assert!(!logs_contain("drained"));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let ctx = DestinationsContext::new(&LogsConfig::default());
        ctx.stop().await;
        assert!(ctx.is_stopped());
        assert_eq!(ctx.state(), State::Stopped);
    }

    #[test]
    fn test_invalid_proxy_falls_back() {
        let config = LogsConfig {
            https_proxy: Some("::not a proxy::".to_string()),
            ..Default::default()
        };
        // Must not panic, the direct client is used instead.
        let _ctx = DestinationsContext::new(&config);
    }
}
