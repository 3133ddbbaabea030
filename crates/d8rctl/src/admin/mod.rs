// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator-facing surfaces: the authenticated loopback web API and the
//! unauthenticated local admin socket. Both are thin shells over the
//! registries, the telemetry collector and the dispatcher.

pub mod handlers;
pub mod http;
pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::auth::{PasswordManager, SessionStore};
use crate::controller::Controller;

/// State shared by every admin route.
pub struct AdminShared {
    pub ctl: Arc<Controller>,
    pub sessions: Arc<SessionStore>,
    pub passwords: PasswordManager,
    restart_requested: AtomicBool,
}

pub type AdminState = Arc<AdminShared>;

impl AdminShared {
    pub fn new(
        ctl: Arc<Controller>,
        sessions: Arc<SessionStore>,
        passwords: PasswordManager,
    ) -> AdminState {
        Arc::new(Self {
            ctl,
            sessions,
            passwords,
            restart_requested: AtomicBool::new(false),
        })
    }

    /// Mark that the next shutdown should re-exec the daemon.
    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }
}
