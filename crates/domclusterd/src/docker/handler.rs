// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handlers mapping pushed `docker_*` commands onto the engine adapter.
//!
//! Every command answers with a `docker_response` frame carrying either
//! the raw result document or `{"error": "..."}`.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use domcluster_protocol::payload::{cmd, ErrorBody, PushedCommand};

use crate::docker::{DockerClient, DockerError};
use crate::manager::{AgentError, ConnectionManager, Outbound};

pub const DOCKER_COMMANDS: &[&str] = &[
    cmd::DOCKER_LIST,
    cmd::DOCKER_START,
    cmd::DOCKER_STOP,
    cmd::DOCKER_RESTART,
    cmd::DOCKER_LOGS,
    cmd::DOCKER_STATS,
    cmd::DOCKER_INSPECT,
];

/// Register a handler per docker command. Without an engine every command
/// is answered with a typed error instead of silence.
pub fn register_docker_handlers(
    manager: &Arc<ConnectionManager>,
    docker: Option<Arc<DockerClient>>,
) {
    match docker {
        Some(docker) => {
            for command in DOCKER_COMMANDS {
                let docker = docker.clone();
                manager.register_handler(
                    *command,
                    Arc::new(move |frame, outbound| {
                        let docker = docker.clone();
                        Box::pin(async move {
                            let result = run_command(&docker, &frame.data).await;
                            respond(&outbound, &frame.req_id, result).await
                        })
                    }),
                );
            }
            info!("docker handlers registered");
        }
        None => {
            for command in DOCKER_COMMANDS {
                manager.register_handler(
                    *command,
                    Arc::new(move |frame, outbound| {
                        Box::pin(async move {
                            let body = ErrorBody::new("Docker client not available on this node");
                            outbound
                                .send(
                                    cmd::DOCKER_RESPONSE,
                                    &frame.req_id,
                                    serde_json::to_vec(&body)?,
                                )
                                .await
                        })
                    }),
                );
            }
            warn!("docker unavailable, handlers answer with errors");
        }
    }
}

async fn respond(
    outbound: &Outbound,
    req_id: &str,
    result: Result<serde_json::Value, DockerError>,
) -> Result<(), AgentError> {
    let body = match result {
        Ok(value) => value,
        Err(e) => json!({ "error": e.to_string() }),
    };
    outbound
        .send(cmd::DOCKER_RESPONSE, req_id, serde_json::to_vec(&body)?)
        .await
}

async fn run_command(
    docker: &DockerClient,
    data: &[u8],
) -> Result<serde_json::Value, DockerError> {
    let command: PushedCommand = serde_json::from_slice(data)?;

    match command {
        PushedCommand::DockerList { all } => {
            let containers = docker.list_containers(all).await?;
            let count = containers.len();
            Ok(json!({ "containers": containers, "count": count }))
        }
        PushedCommand::DockerStart { container_id } => {
            docker.start_container(&container_id).await?;
            Ok(json!({ "message": "container started", "container_id": container_id }))
        }
        PushedCommand::DockerStop {
            container_id,
            timeout,
        } => {
            docker.stop_container(&container_id, timeout).await?;
            Ok(json!({ "message": "container stopped", "container_id": container_id }))
        }
        PushedCommand::DockerRestart { container_id } => {
            docker.restart_container(&container_id).await?;
            Ok(json!({ "message": "container restarted", "container_id": container_id }))
        }
        PushedCommand::DockerLogs { container_id, tail } => {
            let logs = docker.logs(&container_id, tail).await?;
            Ok(json!({ "container_id": container_id, "logs": logs }))
        }
        PushedCommand::DockerStats { container_id } => {
            let stats = docker.stats(&container_id).await?;
            Ok(json!({ "container_id": container_id, "stats": stats }))
        }
        PushedCommand::DockerInspect { container_id } => {
            let details = docker.inspect(&container_id).await?;
            Ok(json!({ "container_id": container_id, "details": details }))
        }
        other => Ok(json!({ "error": format!("not a docker command: {}", other.cmd()) })),
    }
}
