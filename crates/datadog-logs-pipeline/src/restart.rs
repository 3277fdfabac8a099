// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Start/stop capabilities and the orchestrators that sequence them.
//!
//! Every pipeline component and every source collector implements
//! [`Startable`] and [`Stoppable`]. The orchestrators below only know about
//! those two traits:
//!
//! - [`Starter`] starts its members one after the other, in insertion order.
//! - [`ParallelStopper`] stops all its members concurrently and waits for all.
//! - [`SerialStopper`] stops its groups one after the other, in insertion order.
//!
//! Callers add consumers before producers to a [`Starter`] and producers
//! before consumers to a [`SerialStopper`], so no stage ever emits into a sink
//! that is not ready yet or already gone.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::debug;

#[async_trait]
pub trait Startable: Send + Sync {
    /// Starts the component. Returns once it is ready to accept input.
    async fn start(&self);
}

#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Stops the component. Stops accepting input immediately, then returns
    /// once everything already accepted has been handed downstream.
    async fn stop(&self);
}

/// A component that can be both started and stopped.
pub trait Restartable: Startable + Stoppable {}

impl<T: Startable + Stoppable + ?Sized> Restartable for T {}

#[async_trait]
impl<T: Startable + ?Sized> Startable for Arc<T> {
    async fn start(&self) {
        (**self).start().await;
    }
}

#[async_trait]
impl<T: Stoppable + ?Sized> Stoppable for Arc<T> {
    async fn stop(&self) {
        (**self).stop().await;
    }
}

/// Lifecycle stage of a managed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Running,
    Stopped,
}

/// `NotStarted -> Running -> Stopped`, with no way back to `Running`.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
        }
    }
}

impl Lifecycle {
    #[must_use]
    pub fn state(&self) -> State {
        *self.lock()
    }

    /// Moves to `Running`. Returns false, leaving the state untouched, unless
    /// the component had never been started.
    pub fn try_start(&self) -> bool {
        let mut state = self.lock();
        if *state == State::NotStarted {
            *state = State::Running;
            true
        } else {
            false
        }
    }

    /// Moves to `Stopped` and returns the previous state.
    pub fn try_stop(&self) -> State {
        let mut state = self.lock();
        std::mem::replace(&mut *state, State::Stopped)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The guarded value is a plain enum, a poisoned lock still holds a valid state.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Starts components sequentially in the order they were added.
#[derive(Default)]
pub struct Starter {
    components: Vec<Box<dyn Startable>>,
}

impl Starter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Startable + 'static>(&mut self, component: S) -> &mut Self {
        self.components.push(Box::new(component));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[async_trait]
impl Startable for Starter {
    async fn start(&self) {
        debug!("RESTART | Starting {} components", self.components.len());
        for component in &self.components {
            component.start().await;
        }
    }
}

/// Stops a set of independent peers concurrently.
#[derive(Default)]
pub struct ParallelStopper {
    components: Vec<Box<dyn Stoppable>>,
}

impl ParallelStopper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Stoppable + 'static>(&mut self, component: S) -> &mut Self {
        self.components.push(Box::new(component));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[async_trait]
impl Stoppable for ParallelStopper {
    async fn stop(&self) {
        join_all(self.components.iter().map(|component| component.stop())).await;
    }
}

/// Stops groups one at a time, each group fully stopped before the next begins.
#[derive(Default)]
pub struct SerialStopper {
    groups: Vec<Box<dyn Stoppable>>,
}

impl SerialStopper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Stoppable + 'static>(&mut self, group: S) -> &mut Self {
        self.groups.push(Box::new(group));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[async_trait]
impl Stoppable for SerialStopper {
    async fn stop(&self) {
        for (idx, group) in self.groups.iter().enumerate() {
            debug!("RESTART | Stopping group {}/{}", idx + 1, self.groups.len());
            group.stop().await;
        }
    }
}
