// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! domcluster protocol - QUIC + Protobuf publish channel
//!
//! This crate provides the wire protocol shared by the controller (`d8rctl`)
//! and the node agent (`domclusterd`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    domcluster-protocol                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Publish channel: one long-lived bidirectional stream per   │
//! │  agent, carrying framed PublishRequest / PublishResponse    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf envelope (prost), JSON payloads    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! An agent dials the controller, opens a single bidirectional stream and
//! keeps it for the life of the connection. Frames flow in both directions:
//! the agent sends `PublishRequest` frames (register, heartbeat, telemetry,
//! command responses) and receives `PublishResponse` frames (replies and
//! server-pushed commands). Ordering is guaranteed per stream; requests
//! with distinct `req_id`s may be answered out of order.

pub mod client;
pub mod frame;
pub mod payload;
pub mod server;

// Generated protobuf types for the publish channel
pub mod publish_proto {
    include!(concat!(env!("OUT_DIR"), "/domcluster.publish.rs"));
}

pub use client::{ClientError, ClusterClient, ClusterClientConfig};
pub use frame::{read_frame, write_frame, Frame, FrameError, MessageType};
pub use publish_proto::{PublishRequest, PublishResponse};
pub use server::{ClusterServer, ClusterServerConfig, ConnectionHandler, ServerError};
