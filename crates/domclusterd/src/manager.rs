// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent connection manager.
//!
//! Owns the dial / register / reconnect state machine and the handler
//! table for server-pushed commands. The whole machine runs as a single
//! task, so reconnect attempts are serialized by construction.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use domcluster_protocol::frame::{read_frame, write_frame, Frame, FrameError};
use domcluster_protocol::payload::{
    cmd, embedded_cmd, HeartbeatPayload, NodeStoppingPayload, RegisterPayload,
};
use domcluster_protocol::{ClusterClient, ClusterClientConfig, PublishRequest, PublishResponse};

pub const DIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const REGISTER_BACKOFF: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Connection manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Dialing,
    Streaming,
    Registering,
    Live,
    Stopped,
}

/// Handler for one server-pushed command.
pub type Handler = Arc<
    dyn Fn(
            PublishResponse,
            Outbound,
        ) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send>>
        + Send
        + Sync,
>;

/// Cheap clonable sender bound to the current publish stream. The inner
/// slot is swapped on every reconnect so long-lived handlers keep working.
#[derive(Clone)]
pub struct Outbound {
    node_id: Arc<String>,
    slot: Arc<RwLock<Option<mpsc::Sender<PublishRequest>>>>,
}

impl Outbound {
    fn new(node_id: String) -> Self {
        Self {
            node_id: Arc::new(node_id),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    fn replace(&self, tx: Option<mpsc::Sender<PublishRequest>>) {
        *self.slot.write().expect("outbound slot poisoned") = tx;
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Send a frame on the current publish stream.
    pub async fn send(&self, cmd: &str, req_id: &str, data: Vec<u8>) -> Result<(), AgentError> {
        let tx = self
            .slot
            .read()
            .expect("outbound slot poisoned")
            .clone()
            .ok_or(AgentError::NotConnected)?;

        let request = PublishRequest {
            issuer: self.node_id.to_string(),
            req_id: req_id.to_string(),
            cmd: cmd.to_string(),
            data,
        };
        tx.send(request)
            .await
            .map_err(|_| AgentError::Transport("publish stream closed".to_string()))
    }
}

/// Generate a request id unique within this process.
pub fn request_id(cmd: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", cmd, nanos)
}

/// Identity the agent registers under.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub node_id: String,
    pub name: String,
    pub role: String,
    pub version: String,
}

pub struct ConnectionManager {
    identity: AgentIdentity,
    client: ClusterClient,
    handlers: RwLock<HashMap<String, Handler>>,
    outbound: Outbound,
    last_inbound: Mutex<Instant>,
    state_tx: watch::Sender<ManagerState>,
    token: CancellationToken,
}

enum SessionEnd {
    Shutdown,
    Fault,
}

impl ConnectionManager {
    pub fn new(
        identity: AgentIdentity,
        client_config: ClusterClientConfig,
        token: CancellationToken,
    ) -> Result<Arc<Self>, AgentError> {
        let client =
            ClusterClient::new(client_config).map_err(|e| AgentError::Transport(e.to_string()))?;
        let (state_tx, _) = watch::channel(ManagerState::Disconnected);
        let outbound = Outbound::new(identity.node_id.clone());

        Ok(Arc::new(Self {
            identity,
            client,
            handlers: RwLock::new(HashMap::new()),
            outbound,
            last_inbound: Mutex::new(Instant::now()),
            state_tx,
            token,
        }))
    }

    /// Register a handler for a server-pushed command.
    pub fn register_handler(&self, command: impl Into<String>, handler: Handler) {
        self.handlers
            .write()
            .expect("handler table poisoned")
            .insert(command.into(), handler);
    }

    /// Sender usable by reporters and handlers; survives reconnects.
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Observe lifecycle state changes (used by the daemon and tests).
    pub fn state(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ManagerState) {
        let _ = self.state_tx.send(state);
        debug!(?state, "manager state");
    }

    fn touch_inbound(&self) {
        *self.last_inbound.lock().expect("inbound clock poisoned") = Instant::now();
    }

    fn inbound_silence(&self) -> Duration {
        self.last_inbound
            .lock()
            .expect("inbound clock poisoned")
            .elapsed()
    }

    /// Run the state machine until the token is cancelled.
    pub async fn run(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut reconnect_event = false;

        loop {
            if self.token.is_cancelled() {
                self.set_state(ManagerState::Stopped);
                return Ok(());
            }

            // DIALING. After a LIVE fault the attempt budget is bounded;
            // exhaustion falls back to the unbounded disconnected dial.
            self.set_state(ManagerState::Dialing);
            let streams = if reconnect_event {
                match self.reconnect().await {
                    Some(streams) => streams,
                    None => {
                        if self.token.is_cancelled() {
                            self.set_state(ManagerState::Stopped);
                            return Ok(());
                        }
                        warn!("reconnect attempts exhausted, falling back to dial loop");
                        self.set_state(ManagerState::Disconnected);
                        reconnect_event = false;
                        continue;
                    }
                }
            } else {
                match self.dial_until_connected().await {
                    Some(streams) => streams,
                    None => {
                        self.set_state(ManagerState::Stopped);
                        return Ok(());
                    }
                }
            };
            reconnect_event = false;

            match self.drive_session(streams).await {
                SessionEnd::Shutdown => {
                    self.set_state(ManagerState::Stopped);
                    return Ok(());
                }
                SessionEnd::Fault => {
                    // Transient fault: reconnect and re-register under the
                    // same node id.
                    reconnect_event = true;
                }
            }
        }
    }

    /// One complete session: spawn stream tasks, register, stay LIVE until
    /// a fault or shutdown.
    async fn drive_session(
        self: &Arc<Self>,
        (send, recv): (quinn::SendStream, quinn::RecvStream),
    ) -> SessionEnd {
        // STREAMING: writer and receive loop under a per-session token.
        // Deliberately not a child of the root token: on shutdown the
        // writer must outlive the root cancel long enough to flush the
        // node_stopping frame; teardown below cancels it explicitly.
        self.set_state(ManagerState::Streaming);
        let session_token = CancellationToken::new();
        let stream_down = Arc::new(Notify::new());

        let (out_tx, out_rx) = mpsc::channel::<PublishRequest>(OUTBOUND_QUEUE);
        self.outbound.replace(Some(out_tx));
        self.touch_inbound();

        let writer = tokio::spawn(run_writer(
            send,
            out_rx,
            stream_down.clone(),
            session_token.clone(),
        ));
        let receiver = tokio::spawn(run_receiver(
            recv,
            self.clone(),
            stream_down.clone(),
            session_token.clone(),
        ));

        // REGISTERING: retry on the same stream until the send succeeds.
        self.set_state(ManagerState::Registering);
        let registered = self.register_with_backoff(&stream_down).await;

        let end = if !registered {
            if self.token.is_cancelled() {
                SessionEnd::Shutdown
            } else {
                SessionEnd::Fault
            }
        } else {
            // One immediate heartbeat announces liveness right away.
            let _ = self.send_heartbeat().await;
            self.set_state(ManagerState::Live);
            self.live_loop(&stream_down).await
        };

        if matches!(end, SessionEnd::Shutdown) {
            self.announce_stopping().await;
        }

        // Tear the session down before the next dial.
        self.outbound.replace(None);
        session_token.cancel();
        self.client.close().await;
        let _ = writer.await;
        let _ = receiver.await;

        end
    }

    /// LIVE: heartbeat every interval, watch the receive-side idle clock.
    async fn live_loop(&self, stream_down: &Notify) -> SessionEnd {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; liveness was just confirmed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return SessionEnd::Shutdown,
                _ = stream_down.notified() => {
                    warn!("publish stream went down");
                    return SessionEnd::Fault;
                }
                _ = ticker.tick() => {
                    if self.send_heartbeat().await.is_err() {
                        warn!("heartbeat send failed");
                        return SessionEnd::Fault;
                    }
                    let silence = self.inbound_silence();
                    if silence > HEARTBEAT_TIMEOUT {
                        warn!(silence_secs = silence.as_secs(), "controller silent past heartbeat timeout");
                        return SessionEnd::Fault;
                    }
                }
            }
        }
    }

    /// Unbounded dial loop with constant backoff, honouring cancellation.
    async fn dial_until_connected(&self) -> Option<(quinn::SendStream, quinn::RecvStream)> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            match self.client.open_publish_stream().await {
                Ok(streams) => {
                    info!("publish stream established");
                    return Some(streams);
                }
                Err(e) => {
                    warn!(error = %e, "failed to reach controller, retrying in {:?}", DIAL_BACKOFF);
                    if !self.sleep_cancellable(DIAL_BACKOFF).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Bounded reconnect after a LIVE fault: at most
    /// [`MAX_RECONNECT_ATTEMPTS`] tries for this triggering event.
    async fn reconnect(&self) -> Option<(quinn::SendStream, quinn::RecvStream)> {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            if self.token.is_cancelled() {
                return None;
            }
            info!(attempt, max = MAX_RECONNECT_ATTEMPTS, "reconnecting");
            match self.client.open_publish_stream().await {
                Ok(streams) => {
                    info!(attempt, "reconnected");
                    return Some(streams);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    if !self.sleep_cancellable(DIAL_BACKOFF).await {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Returns false when cancelled mid-sleep.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn register_with_backoff(&self, stream_down: &Notify) -> bool {
        loop {
            match self.send_register().await {
                Ok(()) => {
                    info!(node_id = %self.identity.node_id, "register sent");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "register failed, retrying in {:?}", REGISTER_BACKOFF);
                    tokio::select! {
                        _ = self.token.cancelled() => return false,
                        _ = stream_down.notified() => return false,
                        _ = tokio::time::sleep(REGISTER_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn send_register(&self) -> Result<(), AgentError> {
        let payload = RegisterPayload {
            name: self.identity.name.clone(),
            version: self.identity.version.clone(),
            role: Some(self.identity.role.clone()),
        };
        self.outbound
            .send(
                cmd::REGISTER,
                &request_id(cmd::REGISTER),
                serde_json::to_vec(&payload)?,
            )
            .await
    }

    async fn send_heartbeat(&self) -> Result<(), AgentError> {
        let payload = HeartbeatPayload {
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.outbound
            .send(
                cmd::HEARTBEAT,
                &request_id(cmd::HEARTBEAT),
                serde_json::to_vec(&payload)?,
            )
            .await
    }

    /// Tell the controller we are going away; best effort.
    async fn announce_stopping(&self) {
        let payload = NodeStoppingPayload {
            status: "stopping".to_string(),
            message: "Node is shutting down".to_string(),
        };
        let data = serde_json::to_vec(&payload).unwrap_or_default();
        let _ = self
            .outbound
            .send(cmd::NODE_STOPPING, &std::process::id().to_string(), data)
            .await;
    }

    /// Route one server-pushed frame to its handler.
    ///
    /// The handler key is the `cmd` discriminator embedded in the payload,
    /// with the frame's `reporter` field as fallback. Frames with no
    /// matching handler are logged and dropped.
    pub fn dispatch_inbound(self: &Arc<Self>, frame: PublishResponse) {
        self.touch_inbound();

        let key = embedded_cmd(&frame.data).unwrap_or_else(|| frame.reporter.clone());
        let handler = {
            let handlers = self.handlers.read().expect("handler table poisoned");
            handlers.get(&key).cloned()
        };

        match handler {
            Some(handler) => {
                let outbound = self.outbound();
                tokio::spawn(async move {
                    if let Err(e) = handler(frame, outbound).await {
                        error!(command = %key, error = %e, "handler failed");
                    }
                });
            }
            None => {
                debug!(
                    reporter = %frame.reporter,
                    req_id = %frame.req_id,
                    status = frame.status,
                    key = %key,
                    "no handler for inbound frame, dropped"
                );
            }
        }
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Attach a test channel as the current publish stream.
    pub(crate) fn test_wire_outbound(&self) -> mpsc::Receiver<PublishRequest> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.outbound.replace(Some(tx));
        rx
    }
}

async fn run_writer(
    mut send: quinn::SendStream,
    mut out_rx: mpsc::Receiver<PublishRequest>,
    stream_down: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            // Drain queued frames before observing cancellation so a final
            // node_stopping makes it onto the wire.
            biased;

            request = out_rx.recv() => {
                let Some(request) = request else { break };
                let frame = match Frame::request(&request) {
                    Ok(f) => f,
                    Err(e) => {
                        error!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut send, &frame).await {
                    debug!(error = %e, "publish stream write failed");
                    stream_down.notify_one();
                    break;
                }
            }
            _ = token.cancelled() => break,
        }
    }
}

async fn run_receiver(
    mut recv: quinn::RecvStream,
    manager: Arc<ConnectionManager>,
    stream_down: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = read_frame(&mut recv) => {
                let frame = match res {
                    Ok(f) => f,
                    Err(FrameError::ConnectionClosed) => {
                        debug!("publish stream closed by controller");
                        stream_down.notify_one();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "publish stream receive error");
                        stream_down.notify_one();
                        break;
                    }
                };
                match frame.decode::<PublishResponse>() {
                    Ok(resp) => manager.dispatch_inbound(resp),
                    Err(e) => warn!(error = %e, "undecodable inbound frame dropped"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(
            AgentIdentity {
                node_id: "node-1".to_string(),
                name: "n1".to_string(),
                role: "worker".to_string(),
                version: "1.0.0".to_string(),
            },
            ClusterClientConfig::default(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn wire_outbound(manager: &ConnectionManager) -> mpsc::Receiver<PublishRequest> {
        manager.test_wire_outbound()
    }

    fn pushed(reporter: &str, req_id: &str, data: &[u8]) -> PublishResponse {
        PublishResponse {
            reporter: reporter.to_string(),
            req_id: req_id.to_string(),
            status: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_request_ids_unique_and_tagged() {
        let a = request_id("heartbeat");
        let b = request_id("heartbeat");
        assert_ne!(a, b);
        assert!(a.starts_with("heartbeat-"));
    }

    #[tokio::test]
    async fn test_outbound_send_carries_issuer() {
        let manager = test_manager();
        let mut rx = wire_outbound(&manager);

        manager
            .outbound()
            .send(cmd::HEARTBEAT, "hb-1", b"{}".to_vec())
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.issuer, "node-1");
        assert_eq!(frame.cmd, "heartbeat");
        assert_eq!(frame.req_id, "hb-1");
    }

    #[tokio::test]
    async fn test_outbound_send_without_stream_fails() {
        let manager = test_manager();
        let err = manager
            .outbound()
            .send(cmd::HEARTBEAT, "hb-1", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
    }

    #[tokio::test]
    async fn test_dispatch_by_embedded_cmd() {
        let manager = test_manager();
        let mut rx = wire_outbound(&manager);

        manager.register_handler(
            "status_query",
            Arc::new(|frame, outbound| {
                Box::pin(async move {
                    outbound
                        .send(cmd::QUERY_RESPONSE, &frame.req_id, b"report".to_vec())
                        .await
                })
            }),
        );

        manager.dispatch_inbound(pushed(
            "server",
            "q-1",
            br#"{"cmd":"status_query","timestamp":1}"#,
        ));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.cmd, "query_response");
        assert_eq!(reply.req_id, "q-1");
        assert_eq!(reply.data, b"report");
    }

    #[tokio::test]
    async fn test_dispatch_falls_back_to_reporter() {
        let manager = test_manager();
        let mut rx = wire_outbound(&manager);

        manager.register_handler(
            "custom-reporter",
            Arc::new(|frame, outbound| {
                Box::pin(async move {
                    outbound
                        .send("custom_response", &frame.req_id, Vec::new())
                        .await
                })
            }),
        );

        // No cmd in the payload: the reporter field is the handler key.
        manager.dispatch_inbound(pushed("custom-reporter", "r-1", b"{}"));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.cmd, "custom_response");
    }

    #[tokio::test]
    async fn test_unhandled_frame_is_dropped() {
        let manager = test_manager();
        let mut rx = wire_outbound(&manager);

        manager.dispatch_inbound(pushed("server", "x-1", br#"{"cmd":"no_such_handler"}"#));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "no reply may be produced");
    }

    #[tokio::test]
    async fn test_dispatch_updates_inbound_clock() {
        let manager = test_manager();
        let _rx = wire_outbound(&manager);

        *manager.last_inbound.lock().unwrap() = Instant::now() - Duration::from_secs(60);
        assert!(manager.inbound_silence() > HEARTBEAT_TIMEOUT);

        manager.dispatch_inbound(pushed("server", "x-1", b"{}"));
        assert!(manager.inbound_silence() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let manager = test_manager();
        assert_eq!(*manager.state().borrow(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled_before_dial() {
        let manager = ConnectionManager::new(
            AgentIdentity {
                node_id: "node-1".to_string(),
                name: "n1".to_string(),
                role: "worker".to_string(),
                version: "1.0.0".to_string(),
            },
            ClusterClientConfig::default(),
            {
                let token = CancellationToken::new();
                token.cancel();
                token
            },
        )
        .unwrap();

        manager.run().await.unwrap();
        assert_eq!(*manager.state().borrow(), ManagerState::Stopped);
    }
}
