// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node registry: node-id -> identity record.
//!
//! Entries are created on `register`, replaced wholesale on re-register
//! (last writer wins; that is the designed reconnect path) and survive
//! stream loss so a node keeps its identity across reconnects.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Identity record for a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub role: String,
    pub version: String,
}

pub const DEFAULT_ROLE: &str = "worker";

/// Thread-safe map of registered nodes.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `node_id`.
    pub fn insert(&self, node_id: impl Into<String>, record: NodeRecord) {
        self.nodes
            .write()
            .expect("node registry lock poisoned")
            .insert(node_id.into(), record);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes
            .read()
            .expect("node registry lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes
            .write()
            .expect("node registry lock poisoned")
            .remove(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .expect("node registry lock poisoned")
            .contains_key(node_id)
    }

    /// Snapshot of all registered nodes, independent of internal storage.
    pub fn list(&self) -> HashMap<String, NodeRecord> {
        self.nodes
            .read()
            .expect("node registry lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("node registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
