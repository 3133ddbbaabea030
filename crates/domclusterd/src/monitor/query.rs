// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handlers for controller-initiated status and resource queries.

use std::sync::Arc;

use tracing::warn;

use domcluster_protocol::payload::{cmd, PushedCommand, ResourceKind};

use crate::manager::{AgentError, ConnectionManager};
use crate::monitor::Monitor;

/// Register `status_query` and `resource_query` handlers on the manager.
pub fn register_query_handlers(manager: &Arc<ConnectionManager>, monitor: Arc<Monitor>) {
    let status_monitor = monitor.clone();
    manager.register_handler(
        cmd::STATUS_QUERY,
        Arc::new(move |frame, outbound| {
            let monitor = status_monitor.clone();
            Box::pin(async move {
                let report = monitor.report().await;
                let data = serde_json::to_vec(&report)?;
                outbound.send(cmd::QUERY_RESPONSE, &frame.req_id, data).await
            })
        }),
    );

    manager.register_handler(
        cmd::RESOURCE_QUERY,
        Arc::new(move |frame, outbound| {
            let monitor = monitor.clone();
            Box::pin(async move {
                let query: PushedCommand = serde_json::from_slice(&frame.data)?;
                let PushedCommand::ResourceQuery { resource, .. } = query else {
                    warn!("resource_query payload with wrong shape");
                    return Err(AgentError::Handler("malformed resource query".to_string()));
                };

                let data = match resource {
                    ResourceKind::Cpu | ResourceKind::Memory | ResourceKind::Disk => {
                        serde_json::to_vec(&monitor.system_resources())?
                    }
                    ResourceKind::Docker => serde_json::to_vec(&monitor.docker_info().await)?,
                };
                outbound.send(cmd::QUERY_RESPONSE, &frame.req_id, data).await
            })
        }),
    );
}
