// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network side of the pipeline.
//!
//! ```text
//!   Sender ──> Destinations ──┬──> main Destination ──────────> intake
//!                             │     (gates auditor forwarding)
//!                             └──> additional queue ──> worker ──> mirror
//!                                   (best effort, try_send)
//! ```
//!
//! Every [`Destination`] references the process-wide [`DestinationsContext`].
//! Stopping the context switches all of them into force-drain mode: retries
//! end and anything in flight is reported as [`Delivery::Drained`].

mod context;
mod destination;
mod destinations;
mod http;

pub use context::DestinationsContext;
pub use destination::{
    Backoff, Delivery, Destination, Transport, TransportError, DEFAULT_BACKOFF_BASE,
    DEFAULT_BACKOFF_MAX,
};
pub use destinations::Destinations;
pub use http::HttpTransport;
