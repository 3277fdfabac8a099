// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Terminal stage: durable per-source offsets.
//!
//! Every message leaving a sender lands here. The auditor keeps the highest
//! offset seen per origin identifier and persists the registry to
//! `<run_path>/registry.json`:
//!
//! ```json
//! {"version":2,"registry":{"file:/var/log/app.log":{"offset":1024,"last_updated":1700000000}}}
//! ```
//!
//! The registry is flushed every second when it changed and once more on
//! stop. It is written and synced to a temporary file first and renamed into
//! place, so a crash never leaves a truncated registry behind. Filesystem
//! access runs on the blocking pool, never on a runtime worker thread.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LogsConfig;
use crate::error::LogsError;
use crate::health::{HealthHandle, HealthReport};
use crate::message::Message;
use crate::restart::{Lifecycle, Startable, State, Stoppable};

pub const REGISTRY_FILENAME: &str = "registry.json";
const REGISTRY_VERSION: u32 = 2;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub offset: u64,
    /// Seconds since the unix epoch.
    pub last_updated: u64,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    registry: BTreeMap<String, RegistryEntry>,
}

/// In-memory view of the persisted offsets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Reads the registry at `path`. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, LogsError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(LogsError::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: RegistryFile = serde_json::from_slice(&raw)?;
        if file.version != REGISTRY_VERSION {
            warn!(
                "AUDITOR | Registry version {} found, expected {}",
                file.version, REGISTRY_VERSION
            );
        }
        Ok(Self {
            entries: file.registry,
        })
    }

    /// Atomically replaces the file at `path`. Blocks on disk I/O.
    pub fn persist(&self, path: &Path) -> Result<(), LogsError> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            registry: self.entries.clone(),
        };
        let raw = serde_json::to_vec(&file)?;
        let tmp = path.with_extension("json.tmp");
        let persistence = |source| LogsError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(persistence)?;
        }
        let mut file = fs::File::create(&tmp).map_err(persistence)?;
        file.write_all(&raw).map_err(persistence)?;
        file.sync_all().map_err(persistence)?;
        fs::rename(&tmp, path).map_err(persistence)
    }

    /// Records `offset` unless a higher one is already known.
    /// Returns whether the registry changed.
    pub fn update(&mut self, identifier: &str, offset: u64, now: u64) -> bool {
        match self.entries.get_mut(identifier) {
            Some(entry) if entry.offset > offset => false,
            Some(entry) => {
                entry.offset = offset;
                entry.last_updated = now;
                true
            }
            None => {
                self.entries.insert(
                    identifier.to_string(),
                    RegistryEntry {
                        offset,
                        last_updated: now,
                    },
                );
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&RegistryEntry> {
        self.entries.get(identifier)
    }

    /// Drops entries not updated within `ttl`. Returns how many were removed.
    pub fn purge(&mut self, ttl: Duration, now: u64) -> usize {
        let before = self.entries.len();
        let cutoff = now.saturating_sub(ttl.as_secs());
        self.entries.retain(|_, entry| entry.last_updated >= cutoff);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs a registry read or write on the blocking pool.
async fn blocking<T, F>(path: &Path, op: F) -> Result<T, LogsError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> Result<T, LogsError> + Send + 'static,
{
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || op(&owned)).await {
        Ok(result) => result,
        Err(e) => Err(LogsError::Persistence {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        }),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    rx: mpsc::Receiver<Message>,
    registry: SharedRegistry,
    path: PathBuf,
    ttl: Duration,
    health: HealthHandle,
    dirty: bool,
    last_error: Option<String>,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.ack(&message),
                    None => break,
                },
                _ = flush.tick() => {
                    self.flush().await;
                    self.report_health();
                }
                _ = cleanup.tick() => self.cleanup(),
                () = shutdown.cancelled() => {
                    self.rx.close();
                    while let Some(message) = self.rx.recv().await {
                        self.ack(&message);
                    }
                    break;
                }
            }
        }
        self.flush().await;
        if self.last_error.is_none() {
            self.health.report(HealthReport::Stopped);
        }
    }

    fn ack(&mut self, message: &Message) {
        let origin = message.origin();
        if origin.identifier.is_empty() {
            return;
        }
        if lock(&self.registry).update(&origin.identifier, origin.offset, unix_now()) {
            self.dirty = true;
        }
    }

    fn cleanup(&mut self) {
        let removed = lock(&self.registry).purge(self.ttl, unix_now());
        if removed > 0 {
            debug!("AUDITOR | Purged {} expired registry entries", removed);
            self.dirty = true;
        }
    }

    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let snapshot = lock(&self.registry).clone();
        match blocking(&self.path, move |path| snapshot.persist(path)).await {
            Ok(()) => {
                self.dirty = false;
                self.last_error = None;
            }
            Err(e) => {
                error!("AUDITOR | {}", e);
                self.last_error = Some(e.to_string());
                self.report_health();
            }
        }
    }

    fn report_health(&self) {
        let report = match &self.last_error {
            Some(reason) => HealthReport::Unhealthy {
                reason: reason.clone(),
            },
            None => HealthReport::Healthy {
                backlog: self.rx.len(),
            },
        };
        self.health.report(report);
    }
}

/// Acknowledges delivered messages and persists per-source offsets.
pub struct Auditor {
    tx: mpsc::Sender<Message>,
    registry: SharedRegistry,
    path: PathBuf,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Auditor {
    #[must_use]
    pub fn new(config: &LogsConfig, health: HealthHandle) -> Self {
        let (tx, rx) = mpsc::channel(config.pipeline_buffer_size.max(1));
        let path = config.run_path.join(REGISTRY_FILENAME);
        let registry = SharedRegistry::default();
        let worker = Worker {
            rx,
            registry: Arc::clone(&registry),
            path: path.clone(),
            ttl: config.auditor_ttl,
            health,
            dirty: false,
            last_error: None,
        };
        Self {
            tx,
            registry,
            path,
            lifecycle: Lifecycle::default(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(Some(worker)),
            task: Mutex::new(None),
        }
    }

    /// Queue senders forward delivered messages to.
    #[must_use]
    pub fn channel(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Last acknowledged offset for `identifier`, available once started.
    #[must_use]
    pub fn get_offset(&self, identifier: &str) -> Option<u64> {
        lock(&self.registry).get(identifier).map(|entry| entry.offset)
    }

    #[must_use]
    pub fn registry_path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    async fn recover(&self) {
        match blocking(&self.path, Registry::load).await {
            Ok(registry) => {
                info!(
                    "AUDITOR | Recovered {} registry entries from {}",
                    registry.len(),
                    self.path.display()
                );
                *lock(&self.registry) = registry;
            }
            Err(e) => warn!(
                "AUDITOR | Starting with an empty registry, unable to read {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl Startable for Auditor {
    async fn start(&self) {
        if !self.lifecycle.try_start() {
            debug!("AUDITOR | Already started or stopped");
            return;
        }
        self.recover().await;
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.health.report(HealthReport::Healthy { backlog: 0 });
            let handle = tokio::spawn(worker.run(self.shutdown.clone()));
            *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }
}

#[async_trait]
impl Stoppable for Auditor {
    async fn stop(&self) {
        match self.lifecycle.try_stop() {
            State::Running => {
                self.shutdown.cancel();
                let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handle) = handle {
                    if let Err(e) = handle.await {
                        error!("AUDITOR | Task failed: {}", e);
                    }
                }
                info!("AUDITOR | Stopped");
            }
            State::NotStarted => {
                drop(self.worker.lock().unwrap_or_else(PoisonError::into_inner).take());
            }
            State::Stopped => debug!("AUDITOR | Already stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::message::{Origin, Status};

    fn message(identifier: &str, offset: u64) -> Message {
        Message::new("line", Origin::new(identifier, offset), Status::Info)
    }

    fn config(run_path: &Path) -> LogsConfig {
        LogsConfig {
            run_path: run_path.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_update_is_monotonic() {
        let mut registry = Registry::default();
        assert!(registry.update("a", 10, 100));
        assert!(!registry.update("a", 5, 200));
        assert_eq!(registry.get("a").map(|e| e.offset), Some(10));
        assert_eq!(registry.get("a").map(|e| e.last_updated), Some(100));
        assert!(registry.update("a", 10, 300));
        assert!(registry.update("a", 11, 400));
        assert_eq!(registry.get("a").map(|e| e.offset), Some(11));
    }

    #[test]
    fn test_purge_expired_entries() {
        let mut registry = Registry::default();
        registry.update("old", 1, 1_000);
        registry.update("fresh", 1, 90_000);
        let removed = registry.purge(Duration::from_secs(23 * 60 * 60), 100_000);
        assert_eq!(removed, 1);
        assert!(registry.get("old").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(REGISTRY_FILENAME);

        assert!(Registry::load(&path).expect("missing file is empty").is_empty());

        let mut registry = Registry::default();
        registry.update("file:/var/log/app.log", 1024, 1_700_000_000);
        registry.persist(&path).expect("persist failed");

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read failed")).expect("invalid json");
        assert_eq!(
            raw,
            serde_json::json!({
                "version": 2,
                "registry": {
                    "file:/var/log/app.log": {"offset": 1024, "last_updated": 1_700_000_000}
                }
            })
        );
        assert_eq!(Registry::load(&path).expect("load failed"), registry);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_registry_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(REGISTRY_FILENAME);
        fs::write(&path, b"{not json").expect("write failed");
        assert!(matches!(Registry::load(&path), Err(LogsError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_auditor_persists_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let health = HealthRegistry::new();
        let auditor = Auditor::new(&config(dir.path()), health.register("logs-agent"));
        auditor.start().await;

        let tx = auditor.channel();
        for offset in [3, 7, 5] {
            tx.send(message("src", offset)).await.expect("auditor closed");
        }
        tx.send(message("", 99)).await.expect("auditor closed");
        auditor.stop().await;

        assert_eq!(auditor.get_offset("src"), Some(7));
        assert_eq!(auditor.get_offset(""), None);
        let persisted = Registry::load(auditor.registry_path()).expect("load failed");
        assert_eq!(persisted.get("src").map(|e| e.offset), Some(7));
        assert_eq!(health.statuses()["logs-agent"], HealthReport::Stopped);
    }

    #[tokio::test]
    async fn test_auditor_recovers_previous_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = Registry::default();
        registry.update("src", 42, unix_now());
        registry
            .persist(&dir.path().join(REGISTRY_FILENAME))
            .expect("persist failed");

        let health = HealthRegistry::new();
        let auditor = Auditor::new(&config(dir.path()), health.register("auditor"));
        assert_eq!(auditor.get_offset("src"), None);
        auditor.start().await;
        assert_eq!(auditor.get_offset("src"), Some(42));
        auditor.stop().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_periodic_flush_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let health = HealthRegistry::new();
        let auditor = Auditor::new(&config(dir.path()), health.register("logs-agent"));
        auditor.start().await;
        auditor.channel().send(message("src", 12)).await.expect("auditor closed");

        // The only runtime thread must stay free while the registry is written.
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let path = auditor.registry_path().to_path_buf();
        let mut persisted = None;
        for _ in 0..300 {
            if let Ok(registry) = Registry::load(&path) {
                if let Some(entry) = registry.get("src") {
                    persisted = Some(entry.offset);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ticker.abort();

        assert_eq!(persisted, Some(12), "registry not flushed while running");
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 0);
        assert!(!path.with_extension("json.tmp").exists());
        assert!(matches!(
            health.statuses()["logs-agent"],
            HealthReport::Healthy { .. }
        ));
        auditor.stop().await;
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the run directory should be.
        let run_path = dir.path().join("run");
        fs::write(&run_path, b"").expect("write failed");

        let health = HealthRegistry::new();
        let auditor = Auditor::new(&config(&run_path), health.register("logs-agent"));
        auditor.start().await;
        auditor.channel().send(message("src", 1)).await.expect("auditor closed");
        auditor.stop().await;

        assert_eq!(auditor.get_offset("src"), Some(1));
        assert!(matches!(
            health.statuses()["logs-agent"],
            HealthReport::Unhealthy { .. }
        ));
        assert!(!health.is_healthy());
    }
}
