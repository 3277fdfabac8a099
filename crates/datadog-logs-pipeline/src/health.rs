// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal health registry.
//!
//! Components register under a name and publish [`HealthReport`]s through
//! the returned [`HealthHandle`]. Whoever owns the [`HealthRegistry`] decides
//! how to expose the reports; the pipeline core only publishes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    /// Registered but nothing reported yet.
    Starting,
    /// Processing normally. `backlog` is the number of queued items.
    Healthy { backlog: usize },
    /// Processing, but a guarantee is currently broken.
    Unhealthy { reason: String },
    /// Deregistered after a clean stop.
    Stopped,
}

/// Publishing side handed to a component.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    name: String,
    tx: Arc<watch::Sender<HealthReport>>,
}

impl HealthHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report(&self, report: HealthReport) {
        // send_replace never fails, even with no receiver left
        self.tx.send_replace(report);
    }

    #[must_use]
    pub fn current(&self) -> HealthReport {
        self.tx.borrow().clone()
    }
}

/// Collects the latest report of every registered component.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<Mutex<BTreeMap<String, watch::Receiver<HealthReport>>>>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, replacing any earlier registration under that name.
    pub fn register(&self, name: &str) -> HealthHandle {
        let (tx, rx) = watch::channel(HealthReport::Starting);
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), rx);
        HealthHandle {
            name: name.to_string(),
            tx: Arc::new(tx),
        }
    }

    /// Latest report per component name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, HealthReport> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, rx)| (name.clone(), rx.borrow().clone()))
            .collect()
    }

    /// False as soon as one component reports [`HealthReport::Unhealthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.statuses()
            .values()
            .all(|report| !matches!(report, HealthReport::Unhealthy { .. }))
    }
}
