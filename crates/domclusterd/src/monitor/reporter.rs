// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic status reporter: pushes the monitor report to the controller
//! as unsolicited `status_update` frames.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domcluster_protocol::payload::cmd;

use crate::manager::{request_id, Outbound};
use crate::monitor::Monitor;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Run the reporter until the token is cancelled.
pub fn spawn_reporter(
    monitor: Arc<Monitor>,
    outbound: Outbound,
    interval: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "status reporter started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick; registration already announced us.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("status reporter stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = report_once(&monitor, &outbound).await {
                        // Not connected between reconnects is routine.
                        warn!(error = %e, "failed to report status");
                    } else {
                        debug!("status reported");
                    }
                }
            }
        }
    });
}

async fn report_once(monitor: &Monitor, outbound: &Outbound) -> anyhow::Result<()> {
    let report = monitor.report().await;
    let data = serde_json::to_vec(&report)?;
    outbound
        .send(cmd::STATUS_UPDATE, &request_id("status"), data)
        .await?;
    Ok(())
}
