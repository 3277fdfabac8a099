// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod lines;

use std::env;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use datadog_logs_pipeline::config::{Endpoints, LogsConfig};
use datadog_logs_pipeline::health::{HealthRegistry, HealthReport};
use datadog_logs_pipeline::restart::{Startable, Stoppable};
use datadog_logs_pipeline::Agent;

use crate::lines::LinesCollector;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match LogsConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid logs configuration: {}. Shutting down.", e);
            return;
        }
    };
    let endpoints = match Endpoints::from_env() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!("Invalid logs endpoints: {}. Shutting down.", e);
            return;
        }
    };

    let health = HealthRegistry::new();
    let mut agent = match Agent::new(&config, &endpoints, &health) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Unable to build logs agent: {}. Shutting down.", e);
            return;
        }
    };

    let stdin = LinesCollector::new(
        BufReader::new(tokio::io::stdin()),
        "stdin",
        agent.pipeline_provider().next_pipeline_chan(),
    )
    .with_auditor(Arc::clone(agent.auditor()));
    agent.add_input(Arc::new(stdin));

    agent.start().await;
    info!(
        "Shipping stdin to {} with {} pipelines",
        endpoints.main.url(),
        config.pipeline_count
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut health_check = interval(HEALTH_CHECK_INTERVAL);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = health_check.tick() => {
                for (component, report) in health.statuses() {
                    if let HealthReport::Unhealthy { reason } = report {
                        warn!("{} is unhealthy: {}", component, reason);
                    }
                }
            }
        }
    }

    info!("Shutdown requested, stopping logs agent");
    agent.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
