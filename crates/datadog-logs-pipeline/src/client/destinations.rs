// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::context::DestinationsContext;
use super::destination::{Delivery, Destination};
use crate::config::Endpoints;
use crate::message::Payload;

/// Exactly one main destination plus best-effort mirrors.
///
/// Only the main destination's outcome is returned by [`Destinations::send`].
/// Each additional destination runs in its own task behind its own bounded
/// queue once [`Destinations::start`] is called; a mirror that cannot keep up
/// misses payloads instead of slowing the main path.
#[derive(Debug)]
pub struct Destinations {
    main: Destination,
    pending: Vec<Destination>,
    mirrors: Vec<Mirror>,
}

#[derive(Debug)]
struct Mirror {
    name: String,
    tx: mpsc::Sender<Payload>,
}

impl Destinations {
    #[must_use]
    pub fn new(main: Destination, additionals: Vec<Destination>) -> Self {
        Self {
            main,
            pending: additionals,
            mirrors: Vec::new(),
        }
    }

    /// HTTP destinations for every configured endpoint.
    #[must_use]
    pub fn from_endpoints(endpoints: &Endpoints, ctx: &Arc<DestinationsContext>) -> Self {
        let main = Destination::http(&endpoints.main, ctx);
        let additionals = endpoints
            .additionals
            .iter()
            .map(|endpoint| Destination::http(endpoint, ctx))
            .collect();
        Self::new(main, additionals)
    }

    /// Number of destinations, main included.
    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.pending.len() + self.mirrors.len()
    }

    #[must_use]
    pub fn main(&self) -> &Destination {
        &self.main
    }

    /// Spawns one worker per additional destination, each fed by a queue of
    /// `capacity` payloads. Calling it again has no effect.
    pub fn start(&mut self, capacity: usize) {
        for destination in self.pending.drain(..) {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let name = destination.name().to_string();
            tokio::spawn(run_mirror(destination, rx));
            self.mirrors.push(Mirror { name, tx });
        }
    }

    /// Offers `payload` to every started mirror, then delivers it to the main
    /// destination and returns that outcome.
    pub async fn send(&mut self, payload: &Payload) -> Delivery {
        for mirror in &self.mirrors {
            match mirror.tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(
                        "LOGS | Additional destination {} is full, skipping payload",
                        mirror.name
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        "LOGS | Additional destination {} is gone, skipping payload",
                        mirror.name
                    );
                }
            }
        }
        self.main.send(payload).await
    }

    /// Closes the mirror queues. Workers finish what is already queued in the
    /// background and exit early once the context is stopped.
    pub fn close(&mut self) {
        self.mirrors.clear();
        self.pending.clear();
    }
}

async fn run_mirror(mut destination: Destination, mut rx: mpsc::Receiver<Payload>) {
    let ctx = Arc::clone(destination.context());
    loop {
        tokio::select! {
            biased;
            () = ctx.stopped() => break,
            payload = rx.recv() => match payload {
                Some(payload) => {
                    destination.send(&payload).await;
                }
                None => break,
            },
        }
    }
    debug!("LOGS | Additional destination {} stopped", destination.name());
}
