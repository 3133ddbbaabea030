// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry collector: latest status snapshot per node with liveness aging.
//!
//! Agents push `status_update` frames; the collector keeps only the most
//! recent document per node. Entries age out of `online` after
//! `node_timeout` but are never deleted by aging, so operators can still
//! read the last known state of a dead node. Deletion happens only on
//! explicit remove.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domcluster_protocol::payload::StatusReport;

pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Status snapshot returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub last_update: DateTime<Utc>,
    pub online: bool,
    #[serde(flatten)]
    pub report: StatusReport,
}

struct Entry {
    status: NodeStatus,
    updated_at: Instant,
}

/// Collector of node status documents with background aging.
pub struct StatusCollector {
    entries: RwLock<HashMap<String, Entry>>,
    node_timeout: Duration,
    cleanup_interval: Duration,
}

impl StatusCollector {
    pub fn new(node_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            node_timeout,
            cleanup_interval,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_NODE_TIMEOUT, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Decode a pushed status document and store it as the node's latest.
    pub fn update(&self, node_id: &str, data: &[u8]) -> Result<(), serde_json::Error> {
        let report: StatusReport = serde_json::from_slice(data)?;

        let status = NodeStatus {
            node_id: node_id.to_string(),
            last_update: Utc::now(),
            online: true,
            report,
        };

        self.entries
            .write()
            .expect("telemetry lock poisoned")
            .insert(
                node_id.to_string(),
                Entry {
                    status,
                    updated_at: Instant::now(),
                },
            );

        debug!(node_id, "status updated");
        Ok(())
    }

    /// Refresh liveness without replacing the stored document (heartbeat path).
    pub fn touch(&self, node_id: &str) {
        let mut entries = self.entries.write().expect("telemetry lock poisoned");
        if let Some(entry) = entries.get_mut(node_id) {
            entry.updated_at = Instant::now();
            entry.status.last_update = Utc::now();
            entry.status.online = true;
        }
    }

    /// Return the node's status only if it exists and has not aged past
    /// `node_timeout`. The online flag is recomputed on every read.
    pub fn get(&self, node_id: &str) -> Option<NodeStatus> {
        let entries = self.entries.read().expect("telemetry lock poisoned");
        let entry = entries.get(node_id)?;
        if entry.updated_at.elapsed() > self.node_timeout {
            return None;
        }
        let mut status = entry.status.clone();
        status.online = true;
        Some(status)
    }

    /// Snapshot of all non-expired status documents.
    pub fn list_all(&self) -> Vec<NodeStatus> {
        let entries = self.entries.read().expect("telemetry lock poisoned");
        entries
            .values()
            .filter(|e| e.updated_at.elapsed() <= self.node_timeout)
            .map(|e| {
                let mut status = e.status.clone();
                status.online = true;
                status
            })
            .collect()
    }

    /// Node-ids currently considered online.
    pub fn list_online(&self) -> Vec<String> {
        let entries = self.entries.read().expect("telemetry lock poisoned");
        entries
            .iter()
            .filter(|(_, e)| e.updated_at.elapsed() <= self.node_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn remove(&self, node_id: &str) {
        self.entries
            .write()
            .expect("telemetry lock poisoned")
            .remove(node_id);
        info!(node_id, "node removed from collector");
    }

    /// Flip `online=false` on entries older than `node_timeout`.
    /// Entries are retained; only explicit remove deletes.
    pub fn age_out(&self) -> usize {
        let mut flipped = 0;
        let mut entries = self.entries.write().expect("telemetry lock poisoned");
        for (node_id, entry) in entries.iter_mut() {
            if entry.updated_at.elapsed() > self.node_timeout && entry.status.online {
                entry.status.online = false;
                flipped += 1;
                warn!(node_id = %node_id, "node marked offline (timeout)");
            }
        }
        flipped
    }

    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }
}

/// Run the aging sweeper until the token is cancelled.
pub fn spawn_sweeper(collector: Arc<StatusCollector>, token: CancellationToken) {
    let interval = collector.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("telemetry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    collector.age_out();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_json() -> &'static [u8] {
        br#"{
            "host": {"hostname":"h1","os":"linux","arch":"x86_64","num_cpu":4},
            "system": {
                "cpu": {"core_count":4,"usage_pct":12.5},
                "memory": {"total":1000,"used":300,"available":700,"usage_pct":30.0},
                "disk": {"path":"/","total":100,"used":50,"free":50,"usage_pct":50.0},
                "network": {"rx_bytes":1,"tx_bytes":2}
            }
        }"#
    }

    #[test]
    fn test_update_then_get_round_trips() {
        let collector = StatusCollector::with_defaults();
        collector.update("node-1", report_json()).unwrap();

        let status = collector.get("node-1").unwrap();
        assert!(status.online);
        assert_eq!(status.node_id, "node-1");
        assert_eq!(status.report.system.memory.total, 1000);
        assert_eq!(status.report.system.memory.used, 300);
        assert!((status.report.system.cpu.usage_pct - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_rejects_malformed_payload() {
        let collector = StatusCollector::with_defaults();
        assert!(collector.update("node-1", b"not json").is_err());
        assert!(collector.get("node-1").is_none());
    }

    #[test]
    fn test_get_unknown_node() {
        let collector = StatusCollector::with_defaults();
        assert!(collector.get("nope").is_none());
    }

    #[test]
    fn test_expired_entry_is_hidden_but_retained() {
        let collector = StatusCollector::new(Duration::from_millis(0), Duration::from_secs(10));
        collector.update("node-2", report_json()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // Aged past node_timeout: reads hide it, aging flips the flag,
        // but the entry itself survives.
        assert!(collector.get("node-2").is_none());
        assert!(collector.list_all().is_empty());
        assert!(collector.list_online().is_empty());

        assert_eq!(collector.age_out(), 1);
        assert_eq!(collector.age_out(), 0);

        let entries = collector.entries.read().unwrap();
        assert!(entries.contains_key("node-2"));
        assert!(!entries.get("node-2").unwrap().status.online);
    }

    #[test]
    fn test_touch_refreshes_liveness() {
        let collector = StatusCollector::new(Duration::from_millis(50), Duration::from_secs(10));
        collector.update("node-1", report_json()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        collector.touch("node-1");
        std::thread::sleep(Duration::from_millis(30));

        // Without the touch the entry would have expired by now.
        assert!(collector.get("node-1").is_some());
    }

    #[test]
    fn test_touch_unknown_node_is_noop() {
        let collector = StatusCollector::with_defaults();
        collector.touch("ghost");
        assert!(collector.get("ghost").is_none());
    }

    #[test]
    fn test_remove_deletes_entry() {
        let collector = StatusCollector::with_defaults();
        collector.update("node-1", report_json()).unwrap();
        collector.remove("node-1");
        assert!(collector.get("node-1").is_none());
        assert!(collector.entries.read().unwrap().is_empty());
    }

    #[test]
    fn test_list_online_names_fresh_nodes() {
        let collector = StatusCollector::with_defaults();
        collector.update("node-1", report_json()).unwrap();
        collector.update("node-2", report_json()).unwrap();

        let mut online = collector.list_online();
        online.sort();
        assert_eq!(online, vec!["node-1", "node-2"]);
    }
}
