// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback web API with password login and cookie sessions.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::SESSION_COOKIE;

use super::{handlers, AdminState};

/// Build the `/api` router.
pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/status", get(handlers::status))
        .route("/stop", post(handlers::stop))
        .route("/restart", post(handlers::restart))
        .route("/nodes", get(handlers::nodes))
        .route("/nodes/{id}/status", get(handlers::node_status))
        .route("/hosts/add", post(handlers::add_host))
        .route("/docker/containers", get(handlers::docker_containers))
        .route("/docker/start", post(handlers::docker_start))
        .route("/docker/stop", post(handlers::docker_stop))
        .route("/docker/restart", post(handlers::docker_restart))
        .route("/docker/logs", get(handlers::docker_logs))
        .route("/docker/stats", get(handlers::docker_stats))
        .route("/docker/inspect", get(handlers::docker_inspect))
        .route("/docker/nodes", get(handlers::docker_nodes))
        .route("/logout", post(logout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let api = Router::new()
        .route("/login", post(login))
        .merge(protected)
        .with_state(state);

    Router::new().nest("/api", api)
}

/// Serve the web API until the token is cancelled.
pub async fn serve(
    addr: std::net::SocketAddr,
    state: AdminState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "web API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

/// Extract the session token from the Cookie header.
pub fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == SESSION_COOKIE {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Reject requests without a valid session cookie.
async fn require_session(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    match cookie_token(request.headers()) {
        Some(token) if state.sessions.validate(&token) => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "session expired or invalid"})),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    password: String,
}

async fn login(State(state): State<AdminState>, Json(body): Json<LoginBody>) -> Response {
    if !state.passwords.verify(&body.password) {
        warn!("login rejected: bad password");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid password"})),
        )
            .into_response();
    }

    let token = state.sessions.create();
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE,
        token,
        crate::auth::SESSION_TTL.as_secs()
    );

    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({"status": "ok"})),
    )
        .into_response()
}

async fn logout(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Some(token) = cookie_token(&headers) {
        state.sessions.delete(&token);
    }
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({"status": "ok"})),
    )
        .into_response()
}
