// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local admin socket: the same operations as the web API, served over a
//! filesystem unix socket with HTTP-shaped routes and no authentication.
//! Access control is the 0770 mode on the socket file.

use std::path::{Path, PathBuf};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{handlers, AdminState};

pub const SOCKET_MODE: u32 = 0o770;

/// Build the admin-socket router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/stop", post(handlers::stop))
        .route("/restart", post(handlers::restart))
        .route("/nodes", get(handlers::nodes))
        .route("/nodes/remove", post(handlers::remove_node))
        .route("/hosts/add", post(handlers::add_host))
        .with_state(state)
}

/// Serve the admin socket until the token is cancelled, then unlink it.
pub async fn serve(
    socket_path: PathBuf,
    state: AdminState,
    token: CancellationToken,
) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A stale socket from a previous run blocks the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    set_socket_mode(&socket_path);

    info!(path = %socket_path.display(), "admin socket listening");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown({
            let token = token.clone();
            async move { token.cancelled().await }
        })
        .await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(path = %socket_path.display(), error = %e, "failed to remove admin socket");
    }

    result
}

fn set_socket_mode(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        {
            warn!(path = %path.display(), error = %e, "failed to set socket permissions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PasswordManager, SessionStore};
    use crate::controller::Controller;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn admin_state(dir: &TempDir) -> AdminState {
        super::super::AdminShared::new(
            Controller::new(CancellationToken::new()),
            Arc::new(SessionStore::default()),
            PasswordManager::new(dir.path().join("password")),
        )
    }

    #[tokio::test]
    async fn test_socket_created_with_mode_and_removed_on_shutdown() {
        use std::os::unix::fs::MetadataExt;

        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("d8rctl.sock");
        let token = CancellationToken::new();

        let server = tokio::spawn(serve(socket_path.clone(), admin_state(&dir), token.clone()));

        // Wait for the socket file to appear.
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(socket_path.exists());

        let mode = std::fs::metadata(&socket_path).unwrap().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);

        token.cancel();
        server.await.unwrap().unwrap();
        assert!(!socket_path.exists(), "socket must be unlinked on shutdown");
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("d8rctl.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let token = CancellationToken::new();
        let server = tokio::spawn(serve(socket_path.clone(), admin_state(&dir), token.clone()));

        for _ in 0..50 {
            if socket_path.exists() && std::fs::metadata(&socket_path).unwrap().len() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
