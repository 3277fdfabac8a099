// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{message, RecordingTransport, StalledTransport};
use datadog_logs_pipeline::agent::{Agent, HEALTH_COMPONENT};
use datadog_logs_pipeline::auditor::{Auditor, Registry, REGISTRY_FILENAME};
use datadog_logs_pipeline::client::{Destination, Destinations, DestinationsContext, Transport};
use datadog_logs_pipeline::config::LogsConfig;
use datadog_logs_pipeline::health::{HealthRegistry, HealthReport};
use datadog_logs_pipeline::pipeline::{Pipeline, PipelineProvider};
use datadog_logs_pipeline::processor::Encoder;
use datadog_logs_pipeline::restart::{Startable, State, Stoppable};
use tokio::task::JoinHandle;

/// Pushes `count` numbered lines for `identifier`, starting from the
/// auditor's last offset.
struct TestCollector {
    identifier: String,
    count: u64,
    agent_parts: (Arc<Auditor>, Arc<PipelineProvider>),
    failures: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TestCollector {
    fn new(identifier: &str, count: u64, agent: &Agent) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            count,
            agent_parts: (Arc::clone(agent.auditor()), Arc::clone(agent.pipeline_provider())),
            failures: Arc::default(),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Startable for TestCollector {
    async fn start(&self) {
        let (auditor, provider) = &self.agent_parts;
        assert_eq!(auditor.state(), State::Running, "auditor must be ready before sources");

        let resume_from = auditor.get_offset(&self.identifier).map_or(0, |offset| offset + 1);
        let input = provider.next_pipeline_chan();
        let identifier = self.identifier.clone();
        let end = resume_from + self.count;
        let failures = Arc::clone(&self.failures);
        let handle = tokio::spawn(async move {
            for offset in resume_from..end {
                if input.send(message(&identifier, offset)).await.is_err() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        *self.task.lock().expect("lock poisoned") = Some(handle);
    }
}

#[async_trait]
impl Stoppable for TestCollector {
    async fn stop(&self) {
        let handle = self.task.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            handle.await.expect("collector task panicked");
        }
    }
}

fn agent_with(
    config: &LogsConfig,
    transport: Arc<dyn Transport>,
    health: &HealthRegistry,
) -> Agent {
    let ctx = Arc::new(DestinationsContext::new(config));
    let auditor = Arc::new(Auditor::new(config, health.register(HEALTH_COMPONENT)));
    let pipelines = (0..config.pipeline_count)
        .map(|_| {
            let destinations = Destinations::new(
                Destination::new("main", Arc::clone(&transport), Arc::clone(&ctx)),
                Vec::new(),
            );
            Pipeline::from_parts(config, destinations, Encoder::Json, auditor.channel())
                .expect("valid pipeline")
        })
        .collect();
    let provider = Arc::new(PipelineProvider::from_pipelines(pipelines).expect("non-empty pool"));
    Agent::from_parts(config.stop_grace_period, ctx, auditor, provider)
}

fn config(run_path: &Path) -> LogsConfig {
    LogsConfig {
        pipeline_buffer_size: 10,
        pipeline_count: 2,
        run_path: run_path.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_agent_delivers_and_persists_offsets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let health = HealthRegistry::new();
    let transport = Arc::new(RecordingTransport::default());
    let mut agent = agent_with(&config, transport.clone(), &health);

    let first = TestCollector::new("file:/var/log/a.log", 100, &agent);
    let second = TestCollector::new("file:/var/log/b.log", 50, &agent);
    agent.add_input(first.clone()).add_input(second.clone());

    agent.start().await;
    agent.stop().await;

    assert_eq!(first.failures.load(Ordering::SeqCst), 0);
    assert_eq!(second.failures.load(Ordering::SeqCst), 0);
    assert_eq!(transport.offsets().len(), 150);
    assert_eq!(agent.auditor().get_offset("file:/var/log/a.log"), Some(99));
    assert_eq!(agent.auditor().get_offset("file:/var/log/b.log"), Some(49));
    assert!(agent.destinations_context().is_stopped());
    assert_eq!(health.statuses()[HEALTH_COMPONENT], HealthReport::Stopped);

    let registry = Registry::load(&dir.path().join(REGISTRY_FILENAME)).expect("registry readable");
    assert_eq!(registry.get("file:/var/log/a.log").map(|e| e.offset), Some(99));
    assert_eq!(registry.get("file:/var/log/b.log").map(|e| e.offset), Some(49));
}

#[tokio::test]
async fn test_restarted_agent_resumes_from_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());

    let transport = Arc::new(RecordingTransport::default());
    let mut agent = agent_with(&config, transport.clone(), &HealthRegistry::new());
    let collector = TestCollector::new("stdin", 10, &agent);
    agent.add_input(collector);
    agent.start().await;
    agent.stop().await;
    drop(agent);

    let transport = Arc::new(RecordingTransport::default());
    let mut agent = agent_with(&config, transport.clone(), &HealthRegistry::new());
    let collector = TestCollector::new("stdin", 5, &agent);
    agent.add_input(collector);
    agent.start().await;
    agent.stop().await;

    let mut resent = transport.offsets();
    resent.sort_unstable();
    assert_eq!(resent, (10..15).collect::<Vec<_>>());
    assert_eq!(agent.auditor().get_offset("stdin"), Some(14));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_bounded_by_grace_period() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = LogsConfig {
        pipeline_count: 1,
        stop_grace_period: Duration::from_secs(1),
        ..config(dir.path())
    };
    let agent = agent_with(&config, Arc::new(StalledTransport), &HealthRegistry::new());
    agent.start().await;

    let input = agent.pipeline_provider().next_pipeline_chan();
    for offset in 1..=5 {
        input.send(message("src", offset)).await.expect("pipeline closed");
    }

    let started = tokio::time::Instant::now();
    agent.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");
    assert!(agent.destinations_context().is_stopped());
    assert_eq!(agent.auditor().get_offset("src"), Some(5));
}

#[tokio::test]
async fn test_agent_from_environment_style_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let endpoints = datadog_logs_pipeline::config::Endpoints::new(
        datadog_logs_pipeline::config::Endpoint {
            api_key: "key".to_string(),
            ..Default::default()
        },
        Vec::new(),
    );
    let health = HealthRegistry::new();
    let agent = Agent::new(&config, &endpoints, &health).expect("valid agent");
    assert_eq!(agent.pipeline_provider().len(), 2);
    assert_eq!(agent.stop_grace_period(), config.stop_grace_period);

    // Nothing was sent, so nothing hits the network.
    agent.start().await;
    agent.stop().await;
    assert!(health.is_healthy());
}
