// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller composition root.
//!
//! The registries, the telemetry collector and the correlation table are
//! process-wide singletons in spirit; they are composed here into one value
//! passed by reference so nothing reaches for ambient global state.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::correlation::{self, CorrelationTable};
use crate::registry::NodeRegistry;
use crate::streams::StreamRegistry;
use crate::telemetry::{self, StatusCollector};

/// Shared state of a running controller.
pub struct Controller {
    pub registry: NodeRegistry,
    pub telemetry: Arc<StatusCollector>,
    pub streams: StreamRegistry,
    pub correlation: Arc<CorrelationTable>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl Controller {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry: NodeRegistry::new(),
            telemetry: Arc::new(StatusCollector::with_defaults()),
            streams: StreamRegistry::new(),
            correlation: Arc::new(CorrelationTable::default()),
            shutdown,
            started_at: Instant::now(),
        })
    }

    /// Start the aging sweeper and the waiter janitor under the root token.
    pub fn spawn_background(&self) {
        telemetry::spawn_sweeper(self.telemetry.clone(), self.shutdown.clone());
        correlation::spawn_janitor(self.correlation.clone(), self.shutdown.clone());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
