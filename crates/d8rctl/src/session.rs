// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection session loop on the controller.
//!
//! Each accepted connection carries one publish stream. The loop reads
//! frames, classifies them and either replies on the same stream or routes
//! a response to its waiter. Identity is whatever the agent asserts in the
//! `issuer` field; a later session presenting the same issuer supersedes
//! the earlier one.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domcluster_protocol::frame::{read_frame, write_frame, Frame, FrameError};
use domcluster_protocol::payload::{
    cmd, CommandOutputPayload, ErrorBody, MessageBody, RegisterPayload,
};
use domcluster_protocol::server::{ClusterServer, ConnectionHandler};
use domcluster_protocol::{PublishRequest, PublishResponse};

use crate::controller::Controller;
use crate::registry::{NodeRecord, DEFAULT_ROLE};
use crate::streams::{StreamHandle, OUTBOUND_QUEUE};

pub const SERVER_REPORTER: &str = "server";

/// Per-session state: the stream handle and, once registered, the issuer.
pub struct SessionState {
    pub issuer: Option<String>,
    pub handle: StreamHandle,
}

impl SessionState {
    pub fn new(handle: StreamHandle) -> Self {
        Self {
            issuer: None,
            handle,
        }
    }
}

pub fn success_response<T: Serialize>(req_id: &str, body: &T) -> PublishResponse {
    PublishResponse {
        reporter: SERVER_REPORTER.to_string(),
        req_id: req_id.to_string(),
        status: 0,
        data: serde_json::to_vec(body).unwrap_or_default(),
    }
}

pub fn error_response(req_id: &str, message: &str) -> PublishResponse {
    PublishResponse {
        reporter: SERVER_REPORTER.to_string(),
        req_id: req_id.to_string(),
        status: -1,
        data: serde_json::to_vec(&ErrorBody::new(message)).unwrap_or_default(),
    }
}

impl Controller {
    /// Classify one inbound frame. Returns the reply to send on the same
    /// stream, or `None` for frames that must not be answered (responses
    /// routed to their waiter would loop otherwise).
    pub fn handle_frame(
        &self,
        session: &mut SessionState,
        req: PublishRequest,
    ) -> Option<PublishResponse> {
        debug!(issuer = %req.issuer, req_id = %req.req_id, cmd = %req.cmd, "frame received");

        // NEW state: nothing but register is acceptable.
        if session.issuer.is_none() && req.cmd != cmd::REGISTER {
            return Some(error_response(&req.req_id, "node not registered"));
        }

        match req.cmd.as_str() {
            cmd::REGISTER => Some(self.handle_register(session, &req)),
            cmd::HEARTBEAT => {
                self.telemetry.touch(&req.issuer);
                Some(success_response(
                    &req.req_id,
                    &serde_json::json!({ "timestamp": chrono::Utc::now().timestamp() }),
                ))
            }
            cmd::STATUS_UPDATE => match self.telemetry.update(&req.issuer, &req.data) {
                Ok(()) => Some(success_response(
                    &req.req_id,
                    &MessageBody::new("status updated"),
                )),
                Err(e) => {
                    warn!(issuer = %req.issuer, error = %e, "malformed status update");
                    Some(error_response(&req.req_id, "failed to update status"))
                }
            },
            cmd::COMMAND_RESULT => {
                info!(issuer = %req.issuer, "command result received");
                Some(success_response(&req.req_id, &serde_json::json!({})))
            }
            cmd::COMMAND_OUTPUT => {
                match serde_json::from_slice::<CommandOutputPayload>(&req.data) {
                    Ok(out) => info!(issuer = %req.issuer, kind = %out.kind, "{}", out.output),
                    Err(e) => warn!(issuer = %req.issuer, error = %e, "malformed command output"),
                }
                Some(success_response(&req.req_id, &serde_json::json!({})))
            }
            cmd::NODE_STOPPING => {
                info!(issuer = %req.issuer, "node announced shutdown");
                Some(success_response(&req.req_id, &serde_json::json!({})))
            }
            cmd::QUERY_RESPONSE => {
                // A query response doubles as a telemetry push.
                if let Err(e) = self.telemetry.update(&req.issuer, &req.data) {
                    debug!(issuer = %req.issuer, error = %e, "query response not a status document");
                }
                self.correlation.deliver(&req.req_id, 0, req.data);
                None
            }
            other if other.ends_with("_response") => {
                self.correlation.deliver(&req.req_id, 0, req.data);
                None
            }
            other => {
                warn!(issuer = %req.issuer, cmd = %other, "unknown command");
                Some(error_response(&req.req_id, "unknown command"))
            }
        }
    }

    fn handle_register(&self, session: &mut SessionState, req: &PublishRequest) -> PublishResponse {
        let payload: RegisterPayload = match serde_json::from_slice(&req.data) {
            Ok(p) => p,
            Err(e) => {
                warn!(issuer = %req.issuer, error = %e, "invalid register payload");
                return error_response(&req.req_id, "invalid data");
            }
        };

        if req.issuer.is_empty() {
            return error_response(&req.req_id, "empty issuer");
        }

        let record = NodeRecord {
            name: payload.name.clone(),
            role: payload.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            version: payload.version,
        };
        self.registry.insert(req.issuer.clone(), record);

        // A session that re-registers under a new issuer gives up the old
        // binding first.
        if let Some(prior) = session.issuer.as_ref() {
            if prior != &req.issuer {
                self.streams.detach(prior, &session.handle);
            }
        }
        self.streams.attach(req.issuer.clone(), session.handle.clone());
        self.telemetry.touch(&req.issuer);
        session.issuer = Some(req.issuer.clone());

        info!(issuer = %req.issuer, name = %payload.name, "node registered");
        success_response(&req.req_id, &MessageBody::new("registered"))
    }
}

/// Drive one accepted connection to completion.
pub async fn handle_connection(
    conn: ConnectionHandler,
    ctl: Arc<Controller>,
    token: CancellationToken,
) {
    let remote = conn.remote_address();
    info!(%remote, "agent connection accepted");

    let (mut send, mut recv) = match conn.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!(%remote, error = %e, "no publish stream opened");
            return;
        }
    };

    // One writer task per stream serializes all outbound frames, whether
    // they are session replies or dispatcher pushes.
    let (tx, mut rx) = mpsc::channel::<PublishResponse>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let frame = match Frame::response(&resp) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut send, &frame).await {
                debug!(error = %e, "publish stream write failed");
                break;
            }
        }
    });

    let mut session = SessionState::new(StreamHandle::new(tx.clone()));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                // Goodbye is best-effort; the agent reconnects on its own.
                let _ = tx.try_send(success_response(
                    "shutdown",
                    &MessageBody::new("controller stopping"),
                ));
                break;
            }
            res = read_frame(&mut recv) => {
                let frame = match res {
                    Ok(f) => f,
                    Err(FrameError::ConnectionClosed) => {
                        debug!(%remote, "publish stream closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(%remote, error = %e, "publish stream receive error");
                        break;
                    }
                };
                let req: PublishRequest = match frame.decode() {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(%remote, error = %e, "undecodable frame, closing session");
                        break;
                    }
                };
                if let Some(reply) = ctl.handle_frame(&mut session, req) {
                    if tx.send(reply).await.is_err() {
                        // Writer is gone; the stream is dead.
                        break;
                    }
                }
            }
        }
    }

    // CLOSED: detach exactly once. The node record is retained so the
    // agent can reconnect and reclaim its identity.
    if let Some(issuer) = session.issuer.take() {
        ctl.streams.detach(&issuer, &session.handle);
    }
    drop(session);
    drop(tx);
    let _ = writer.await;
    debug!(%remote, "session closed");
}

/// Accept loop: one session task per incoming connection.
pub async fn run_acceptor(server: ClusterServer, ctl: Arc<Controller>, token: CancellationToken) {
    info!("publish server accepting connections");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("publish server stopping");
                server.close();
                break;
            }
            incoming = server.accept() => {
                match incoming {
                    Some(incoming) => {
                        let ctl = ctl.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            match incoming.await {
                                Ok(connection) => {
                                    let conn = ConnectionHandler::new(connection);
                                    handle_connection(conn, ctl, token).await;
                                }
                                Err(e) => {
                                    debug!(error = %e, "failed to accept connection");
                                }
                            }
                        });
                    }
                    None => break,
                }
            }
        }
    }
}
