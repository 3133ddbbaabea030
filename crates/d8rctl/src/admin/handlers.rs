// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route handlers shared by the web API and the local admin socket.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use domcluster_protocol::payload::PushedCommand;

use crate::correlation::CommandReply;
use crate::dispatch::{DispatchError, DEFAULT_DISPATCH_DEADLINE};
use crate::provision::{ProvisionRequest, Provisioner};

use super::AdminState;

/// `GET /status`
pub async fn status(State(state): State<AdminState>) -> Response {
    Json(json!({
        "running": true,
        "pid": std::process::id(),
        "uptime": format!("{}s", state.ctl.uptime_secs()),
        "nodes": state.ctl.registry.len(),
        "message": "Running",
    }))
    .into_response()
}

/// `POST /stop`
pub async fn stop(State(state): State<AdminState>) -> Response {
    info!("stop requested via admin surface");
    let token = state.ctl.shutdown.clone();
    // Reply first, then cancel, so the caller sees the acknowledgement.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    Json(json!({"status": "ok"})).into_response()
}

/// `POST /restart`
pub async fn restart(State(state): State<AdminState>) -> Response {
    info!("restart requested via admin surface");
    state.request_restart();
    let token = state.ctl.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    Json(json!({"status": "ok"})).into_response()
}

/// `GET /nodes`
pub async fn nodes(State(state): State<AdminState>) -> Response {
    let nodes: HashMap<_, _> = state
        .ctl
        .registry
        .list()
        .into_iter()
        .map(|(id, record)| {
            (
                id,
                json!({
                    "name": record.name,
                    "role": record.role,
                    "version": record.version,
                }),
            )
        })
        .collect();
    Json(nodes).into_response()
}

/// `GET /nodes/{id}/status`
pub async fn node_status(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> Response {
    match state.ctl.telemetry.get(&node_id) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "node not found or offline"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveNodeBody {
    pub node_id: String,
}

/// `POST /nodes/remove` (admin socket only)
pub async fn remove_node(
    State(state): State<AdminState>,
    Json(body): Json<RemoveNodeBody>,
) -> Response {
    if state.ctl.registry.remove(&body.node_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "node not found"})),
        )
            .into_response();
    }
    state.ctl.telemetry.remove(&body.node_id);
    info!(node_id = %body.node_id, "node removed via admin surface");
    Json(json!({"status": "ok"})).into_response()
}

/// `POST /hosts/add`
pub async fn add_host(
    State(_state): State<AdminState>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    let provisioner = match Provisioner::locate() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "provisioner unavailable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("failed to create provisioner: {}", e)})),
            )
                .into_response();
        }
    };

    // ssh2 is blocking; keep the runtime responsive.
    let outcome = tokio::task::spawn_blocking(move || provisioner.provision(&req, None)).await;

    match outcome {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err((err, result))) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string(), "result": result})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("provisioning task failed: {}", e)})),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Container operations (thin shell over the dispatcher)
// ---------------------------------------------------------------------------

fn reply_response(reply: CommandReply) -> Response {
    if reply.status < 0 {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "application/json")],
            reply.data,
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        reply.data,
    )
        .into_response()
}

fn dispatch_error_response(err: DispatchError) -> Response {
    match err {
        DispatchError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "request timeout"})),
        )
            .into_response(),
        DispatchError::Unavailable(node) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("node {} not connected", node)})),
        )
            .into_response(),
        DispatchError::Cancelled => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "controller shutting down"})),
        )
            .into_response(),
        other => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": other.to_string()})),
        )
            .into_response(),
    }
}

async fn dispatch_for(state: &AdminState, node_id: &str, command: PushedCommand) -> Response {
    match state
        .ctl
        .dispatch(node_id, &command, DEFAULT_DISPATCH_DEADLINE)
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(err) => dispatch_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ContainersQuery {
    pub node_id: String,
    #[serde(default)]
    pub all: Option<String>,
}

/// `GET /docker/containers?node_id&all`
pub async fn docker_containers(
    State(state): State<AdminState>,
    Query(query): Query<ContainersQuery>,
) -> Response {
    let all = matches!(query.all.as_deref(), Some("true") | Some("1"));
    dispatch_for(&state, &query.node_id, PushedCommand::DockerList { all }).await
}

#[derive(Debug, Deserialize)]
pub struct ContainerBody {
    pub node_id: String,
    pub container_id: String,
    #[serde(default)]
    pub timeout: Option<i64>,
}

/// `POST /docker/start`
pub async fn docker_start(
    State(state): State<AdminState>,
    Json(body): Json<ContainerBody>,
) -> Response {
    dispatch_for(
        &state,
        &body.node_id,
        PushedCommand::DockerStart {
            container_id: body.container_id,
        },
    )
    .await
}

/// `POST /docker/stop`
pub async fn docker_stop(
    State(state): State<AdminState>,
    Json(body): Json<ContainerBody>,
) -> Response {
    dispatch_for(
        &state,
        &body.node_id,
        PushedCommand::DockerStop {
            container_id: body.container_id,
            timeout: body.timeout,
        },
    )
    .await
}

/// `POST /docker/restart`
pub async fn docker_restart(
    State(state): State<AdminState>,
    Json(body): Json<ContainerBody>,
) -> Response {
    dispatch_for(
        &state,
        &body.node_id,
        PushedCommand::DockerRestart {
            container_id: body.container_id,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct ContainerQuery {
    pub node_id: String,
    pub container_id: String,
    #[serde(default)]
    pub tail: Option<String>,
}

/// `GET /docker/logs?node_id&container_id`
pub async fn docker_logs(
    State(state): State<AdminState>,
    Query(query): Query<ContainerQuery>,
) -> Response {
    dispatch_for(
        &state,
        &query.node_id,
        PushedCommand::DockerLogs {
            container_id: query.container_id,
            tail: query.tail,
        },
    )
    .await
}

/// `GET /docker/stats?node_id&container_id`
pub async fn docker_stats(
    State(state): State<AdminState>,
    Query(query): Query<ContainerQuery>,
) -> Response {
    dispatch_for(
        &state,
        &query.node_id,
        PushedCommand::DockerStats {
            container_id: query.container_id,
        },
    )
    .await
}

/// `GET /docker/inspect?node_id&container_id`
pub async fn docker_inspect(
    State(state): State<AdminState>,
    Query(query): Query<ContainerQuery>,
) -> Response {
    dispatch_for(
        &state,
        &query.node_id,
        PushedCommand::DockerInspect {
            container_id: query.container_id,
        },
    )
    .await
}

/// `GET /docker/nodes`: node-ids whose latest telemetry carries
/// container-engine data.
pub async fn docker_nodes(State(state): State<AdminState>) -> Response {
    let nodes: Vec<String> = state
        .ctl
        .telemetry
        .list_all()
        .into_iter()
        .filter(|status| status.report.docker.is_some())
        .map(|status| status.node_id)
        .collect();
    Json(nodes).into_response()
}
