// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authentication for the web-facing admin surface: a single hashed
//! password and an in-memory session store.

pub mod password;
pub mod session;

pub use password::{PasswordError, PasswordManager};
pub use session::{
    spawn_session_sweeper, SessionStore, SESSION_COOKIE, SESSION_SWEEP_INTERVAL, SESSION_TTL,
};
