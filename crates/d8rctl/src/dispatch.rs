// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command dispatcher: push a command to a named node and wait for the
//! correlated response.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use domcluster_protocol::payload::PushedCommand;
use domcluster_protocol::PublishResponse;

use crate::controller::Controller;
use crate::correlation::{next_request_id, CommandReply};
use crate::session::SERVER_REPORTER;
use crate::streams::StreamError;

/// Default deadline applied to admin-originated dispatches.
pub const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} not connected")]
    Unavailable(String),

    #[error("request timeout")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Controller {
    /// Issue `command` to `node` and wait up to `deadline` for the response.
    ///
    /// The command's `cmd` discriminator travels inside the JSON payload so
    /// the agent can route it through its handler table. Exactly one
    /// outcome is observed per call: delivery, timeout, cancellation or a
    /// transport error.
    pub async fn dispatch(
        &self,
        node: &str,
        command: &PushedCommand,
        deadline: Duration,
    ) -> Result<CommandReply, DispatchError> {
        // Fast-fail on a node with no live stream before allocating a
        // waiter; a never-seen node must leave the correlation table alone.
        if !self.streams.contains(node) {
            return Err(DispatchError::Unavailable(node.to_string()));
        }

        let req_id = next_request_id(command.cmd());
        let data = serde_json::to_vec(command)?;

        let (tx, rx) = oneshot::channel();
        self.correlation.register(req_id.clone(), tx);

        let frame = PublishResponse {
            reporter: SERVER_REPORTER.to_string(),
            req_id: req_id.clone(),
            status: 0,
            data,
        };

        if let Err(e) = self.streams.send(node, frame).await {
            self.correlation.cancel(&req_id);
            return match e {
                StreamError::NotConnected(n) => Err(DispatchError::Unavailable(n)),
                StreamError::SendFailed(n) => {
                    Err(DispatchError::Transport(format!("send to {} failed", n)))
                }
            };
        }

        debug!(node, req_id = %req_id, cmd = command.cmd(), "command dispatched");

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.correlation.cancel(&req_id);
                Err(DispatchError::Cancelled)
            }
            res = tokio::time::timeout(deadline, rx) => match res {
                Ok(Ok(reply)) => Ok(reply),
                // The waiter was consumed without a delivery; the janitor
                // reaped it or the entry was cancelled elsewhere.
                Ok(Err(_)) => Err(DispatchError::Cancelled),
                Err(_) => {
                    self.correlation.cancel(&req_id);
                    Err(DispatchError::Timeout)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionState, SERVER_REPORTER};
    use crate::streams::{StreamHandle, OUTBOUND_QUEUE};
    use domcluster_protocol::payload::{cmd, embedded_cmd, RegisterPayload};
    use domcluster_protocol::PublishRequest;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connected_node(
        ctl: &Arc<Controller>,
        node: &str,
    ) -> (SessionState, mpsc::Receiver<PublishResponse>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut session = SessionState::new(StreamHandle::new(tx));
        let req = PublishRequest {
            issuer: node.to_string(),
            req_id: "register-1".to_string(),
            cmd: cmd::REGISTER.to_string(),
            data: serde_json::to_vec(&RegisterPayload {
                name: node.to_string(),
                version: "1.0.0".to_string(),
                role: None,
            })
            .unwrap(),
        };
        ctl.handle_frame(&mut session, req);
        (session, rx)
    }

    #[tokio::test]
    async fn test_dispatch_success_round_trip() {
        let ctl = Controller::new(CancellationToken::new());
        let (mut session, mut rx) = connected_node(&ctl, "node-1");

        let ctl2 = ctl.clone();
        let call = tokio::spawn(async move {
            ctl2.dispatch(
                "node-1",
                &PushedCommand::DockerStart {
                    container_id: "abc".to_string(),
                },
                Duration::from_secs(5),
            )
            .await
        });

        // The agent side sees the pushed frame with the embedded cmd tag...
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.reporter, SERVER_REPORTER);
        assert_eq!(embedded_cmd(&pushed.data).as_deref(), Some("docker_start"));

        // ...and answers with a docker_response carrying the same req_id.
        let response = PublishRequest {
            issuer: "node-1".to_string(),
            req_id: pushed.req_id.clone(),
            cmd: cmd::DOCKER_RESPONSE.to_string(),
            data: br#"{"message":"container started","container_id":"abc"}"#.to_vec(),
        };
        ctl.handle_frame(&mut session, response);

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert!(String::from_utf8_lossy(&reply.data).contains("container started"));
        assert!(ctl.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_node_leaves_correlation_untouched() {
        let ctl = Controller::new(CancellationToken::new());
        let err = ctl
            .dispatch(
                "never-seen",
                &PushedCommand::DockerList { all: false },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable(_)));
        assert!(ctl.correlation.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_cancels_waiter() {
        let ctl = Controller::new(CancellationToken::new());
        let (_session, _rx) = connected_node(&ctl, "node-1");

        let err = ctl
            .dispatch(
                "node-1",
                &PushedCommand::DockerLogs {
                    container_id: "abc".to_string(),
                    tail: None,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout));
        assert!(ctl.correlation.is_empty(), "timeout must cancel the waiter");
    }

    #[tokio::test]
    async fn test_dispatch_transport_error_on_dead_stream() {
        let ctl = Controller::new(CancellationToken::new());
        let (_session, rx) = connected_node(&ctl, "node-1");
        drop(rx); // writer gone, stream dead

        let err = ctl
            .dispatch(
                "node-1",
                &PushedCommand::DockerList { all: true },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
        assert!(ctl.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_cancelled_by_shutdown() {
        let token = CancellationToken::new();
        let ctl = Controller::new(token.clone());
        let (_session, _rx) = connected_node(&ctl, "node-1");

        let ctl2 = ctl.clone();
        let call = tokio::spawn(async move {
            ctl2.dispatch(
                "node-1",
                &PushedCommand::DockerList { all: false },
                Duration::from_secs(30),
            )
            .await
        });

        tokio::task::yield_now().await;
        token.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert!(ctl.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_each_get_one_outcome() {
        let ctl = Controller::new(CancellationToken::new());
        let (session, mut rx) = connected_node(&ctl, "node-1");
        let session = Arc::new(tokio::sync::Mutex::new(session));

        // Echo agent: answer every pushed frame with its own req_id.
        let ctl_echo = ctl.clone();
        let session_echo = session.clone();
        let echo = tokio::spawn(async move {
            for _ in 0..8 {
                let pushed = rx.recv().await.unwrap();
                let response = PublishRequest {
                    issuer: "node-1".to_string(),
                    req_id: pushed.req_id.clone(),
                    cmd: cmd::DOCKER_RESPONSE.to_string(),
                    data: pushed.req_id.clone().into_bytes(),
                };
                let mut session = session_echo.lock().await;
                ctl_echo.handle_frame(&mut session, response);
            }
        });

        let mut calls = Vec::new();
        for _ in 0..8 {
            let ctl = ctl.clone();
            calls.push(tokio::spawn(async move {
                ctl.dispatch(
                    "node-1",
                    &PushedCommand::DockerList { all: false },
                    Duration::from_secs(5),
                )
                .await
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for call in calls {
            let reply = call.await.unwrap().unwrap();
            // Each dispatcher received the reply correlated to its own id.
            assert!(seen.insert(reply.data));
        }
        echo.await.unwrap();
        assert!(ctl.correlation.is_empty());
    }
}
