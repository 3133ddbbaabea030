// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! d8rctl - domcluster controller
//!
//! The controller accepts publish streams from node agents, keeps the
//! fleet's identity and telemetry in memory, correlates operator commands
//! with asynchronous agent replies, and exposes a local admin socket plus
//! an authenticated web API.
//!
//! Core pieces:
//! - [`registry`]: node-id -> identity record
//! - [`telemetry`]: node-id -> latest status snapshot with liveness aging
//! - [`streams`]: node-id -> live publish-stream send handle
//! - [`correlation`]: request-id -> one-shot waiter, with a janitor
//! - [`session`]: per-connection frame loop feeding all of the above
//! - [`dispatch`]: push a command to a node and await its response
//! - [`admin`] / [`auth`]: operator surfaces
//! - [`provision`]: bootstrap a fresh host into an agent over SSH

pub mod admin;
pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod daemon;
pub mod dispatch;
pub mod logs;
pub mod provision;
pub mod registry;
pub mod session;
pub mod streams;
pub mod telemetry;

pub use controller::Controller;
