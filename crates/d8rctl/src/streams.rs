// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream registry: node-id -> live outbound handle for the agent's
//! publish stream.
//!
//! A handle is a clone of the per-session writer channel tagged with a
//! process-unique id. At most one handle is live per node-id; attaching a
//! newer handle supersedes the old one, whose session discovers eviction
//! through its next send error and exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use domcluster_protocol::PublishResponse;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound capacity per publish stream. The writer task drains this into
/// the QUIC stream; a full queue means the peer stopped reading.
pub const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("node {0} not connected")]
    NotConnected(String),

    #[error("send to node {0} failed: stream closed")]
    SendFailed(String),
}

/// Send-only reference to one agent's publish stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: u64,
    tx: mpsc::Sender<PublishResponse>,
}

impl StreamHandle {
    pub fn new(tx: mpsc::Sender<PublishResponse>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Handle identity; two clones of the same session handle compare equal.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn same_session(&self, other: &StreamHandle) -> bool {
        self.id == other.id
    }

    pub async fn send(&self, frame: PublishResponse) -> Result<(), ()> {
        self.tx.send(frame).await.map_err(|_| ())
    }
}

/// Thread-safe map of live publish-stream handles.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the live stream for `node_id`, superseding any
    /// previous one. The evicted session is not signalled; it exits on its
    /// next send error.
    pub fn attach(&self, node_id: impl Into<String>, handle: StreamHandle) {
        let node_id = node_id.into();
        let prior = self
            .streams
            .write()
            .expect("stream registry lock poisoned")
            .insert(node_id.clone(), handle);
        if let Some(prior) = prior {
            info!(node_id = %node_id, stale_handle = prior.id(), "superseded prior stream handle");
        }
    }

    /// Remove the handle for `node_id` only if it is still the one given.
    /// A session that was superseded must not clobber its replacement.
    pub fn detach(&self, node_id: &str, handle: &StreamHandle) -> bool {
        let mut streams = self.streams.write().expect("stream registry lock poisoned");
        match streams.get(node_id) {
            Some(current) if current.same_session(handle) => {
                streams.remove(node_id);
                info!(node_id, "stream detached");
                true
            }
            _ => {
                debug!(node_id, "stale detach ignored");
                false
            }
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.streams
            .read()
            .expect("stream registry lock poisoned")
            .contains_key(node_id)
    }

    /// Push a frame down the node's publish stream.
    pub async fn send(&self, node_id: &str, frame: PublishResponse) -> Result<(), StreamError> {
        let handle = {
            let streams = self.streams.read().expect("stream registry lock poisoned");
            streams
                .get(node_id)
                .cloned()
                .ok_or_else(|| StreamError::NotConnected(node_id.to_string()))?
        };

        handle
            .send(frame)
            .await
            .map_err(|_| StreamError::SendFailed(node_id.to_string()))
    }

    /// Node-ids with a live publish stream.
    pub fn connected_nodes(&self) -> Vec<String> {
        self.streams
            .read()
            .expect("stream registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams
            .read()
            .expect("stream registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
