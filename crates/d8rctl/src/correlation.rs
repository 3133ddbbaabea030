// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation table: request-id -> one-shot waiter for the eventual
//! agent response.
//!
//! Delivery is a non-blocking hand-off: the entry is removed first, then
//! the reply is pushed into the one-shot channel, so the session loop never
//! stalls on a consumer that already gave up. A janitor reaps entries the
//! dispatcher forgot to cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_WAITER_MAX_AGE: Duration = Duration::from_secs(300);
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique request id for `cmd`.
///
/// Wall-clock nanos plus a per-process counter; two dispatches in the same
/// nanosecond still get distinct ids.
pub fn next_request_id(cmd: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", cmd, nanos, seq)
}

/// Terminal outcome of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: i32,
    pub data: Vec<u8>,
}

struct Waiter {
    tx: oneshot::Sender<CommandReply>,
    created_at: Instant,
}

/// Pending request-id -> waiter map with janitor support.
pub struct CorrelationTable {
    waiters: Mutex<HashMap<String, Waiter>>,
    max_age: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_WAITER_MAX_AGE)
    }
}

impl CorrelationTable {
    pub fn new(max_age: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    /// Register a waiter for `req_id`. Ids come from [`next_request_id`];
    /// a duplicate indicates a broken generator and replaces the old entry.
    pub fn register(&self, req_id: impl Into<String>, tx: oneshot::Sender<CommandReply>) {
        let req_id = req_id.into();
        let prior = self
            .waiters
            .lock()
            .expect("correlation lock poisoned")
            .insert(
                req_id.clone(),
                Waiter {
                    tx,
                    created_at: Instant::now(),
                },
            );
        if prior.is_some() {
            error!(req_id = %req_id, "duplicate request id registered; replaced prior waiter");
        }
    }

    /// Deliver a response to the matching waiter, consuming the entry.
    /// Unknown ids are late or orphaned replies and are quietly dropped.
    pub fn deliver(&self, req_id: &str, status: i32, data: Vec<u8>) {
        let waiter = self
            .waiters
            .lock()
            .expect("correlation lock poisoned")
            .remove(req_id);

        match waiter {
            Some(waiter) => {
                // The dispatcher may have stopped listening between our
                // remove and this send; either way the entry is gone.
                let _ = waiter.tx.send(CommandReply { status, data });
            }
            None => {
                debug!(req_id, "dropping response with no waiter");
            }
        }
    }

    /// Erase the entry without delivering anything.
    pub fn cancel(&self, req_id: &str) {
        self.waiters
            .lock()
            .expect("correlation lock poisoned")
            .remove(req_id);
    }

    /// Remove entries older than the configured max age.
    pub fn reap_expired(&self) -> usize {
        let mut waiters = self.waiters.lock().expect("correlation lock poisoned");
        let before = waiters.len();
        waiters.retain(|req_id, waiter| {
            let keep = waiter.created_at.elapsed() <= self.max_age;
            if !keep {
                info!(req_id = %req_id, "reaped expired waiter");
            }
            keep
        });
        before - waiters.len()
    }

    pub fn contains(&self, req_id: &str) -> bool {
        self.waiters
            .lock()
            .expect("correlation lock poisoned")
            .contains_key(req_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("correlation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the janitor until the token is cancelled. This is a backstop for a
/// dispatcher that failed to cancel on timeout, not the primary cleanup path.
pub fn spawn_janitor(table: Arc<CorrelationTable>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("correlation janitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    table.reap_expired();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deliver_consumes_entry() {
        let table = CorrelationTable::default();
        let (tx, rx) = oneshot::channel();
        table.register("r1", tx);
        assert!(table.contains("r1"));

        table.deliver("r1", 0, b"ok".to_vec());
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(reply.data, b"ok");

        assert!(!table.contains("r1"));
    }

    #[tokio::test]
    async fn test_deliver_unknown_id_is_dropped() {
        let table = CorrelationTable::default();
        // Must not panic or leave residue.
        table.deliver("ghost", 0, Vec::new());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_after_cancel_is_dropped() {
        let table = CorrelationTable::default();
        let (tx, mut rx) = oneshot::channel();
        table.register("r1", tx);
        table.cancel("r1");

        table.deliver("r1", 0, b"late".to_vec());
        assert!(rx.try_recv().is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_to_dropped_receiver_still_erases() {
        let table = CorrelationTable::default();
        let (tx, rx) = oneshot::channel();
        table.register("r1", tx);
        drop(rx);

        table.deliver("r1", 0, Vec::new());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_delivered_exactly_once() {
        let table = CorrelationTable::default();
        let (tx, mut rx) = oneshot::channel();
        table.register("r1", tx);

        table.deliver("r1", 0, b"first".to_vec());
        table.deliver("r1", 0, b"second".to_vec());

        assert_eq!(rx.try_recv().unwrap().data, b"first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reap_expired_removes_only_old_entries() {
        let table = CorrelationTable::new(Duration::from_millis(20));
        let (tx_old, _rx_old) = oneshot::channel();
        table.register("old", tx_old);

        std::thread::sleep(Duration::from_millis(40));

        let (tx_new, _rx_new) = oneshot::channel();
        table.register("new", tx_new);

        assert_eq!(table.reap_expired(), 1);
        assert!(!table.contains("old"));
        assert!(table.contains("new"));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(next_request_id("docker_list")));
        }
    }

    #[test]
    fn test_request_id_carries_command() {
        let id = next_request_id("docker_logs");
        assert!(id.starts_with("docker_logs-"));
    }
}
