// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller daemon lifecycle: PID file, log file, server startup and
//! ordered shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use domcluster_protocol::server::ClusterServer;

use crate::admin::{self, AdminShared};
use crate::auth::{spawn_session_sweeper, PasswordManager, SessionStore};
use crate::config::{Config, Paths};
use crate::controller::Controller;
use crate::session::run_acceptor;

pub fn write_pid(paths: &Paths) -> std::io::Result<()> {
    std::fs::create_dir_all(&paths.runtime_dir)?;
    std::fs::write(paths.pid_file(), std::process::id().to_string())
}

pub fn read_pid(paths: &Paths) -> std::io::Result<i32> {
    let data = std::fs::read_to_string(paths.pid_file())?;
    data.trim()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt pid file"))
}

pub fn remove_pid(paths: &Paths) {
    let _ = std::fs::remove_file(paths.pid_file());
}

/// Probe the recorded PID with signal 0; clears a stale PID file.
pub fn is_running(paths: &Paths) -> bool {
    let Ok(pid) = read_pid(paths) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(_) => {
            remove_pid(paths);
            false
        }
    }
}

/// Send SIGTERM to the running daemon.
pub fn stop(paths: &Paths) -> Result<()> {
    let pid = read_pid(paths).context("daemon is not running")?;
    info!(pid, "sending SIGTERM");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .context("failed to signal daemon")?;
    Ok(())
}

/// Spawn `<current-exe> daemon` detached from this process.
pub fn start_detached(paths: &Paths) -> Result<()> {
    if is_running(paths) {
        bail!("daemon is already running (pid {})", read_pid(paths)?);
    }

    let exe = std::env::current_exe().context("failed to resolve executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().context("failed to spawn daemon")?;
    Ok(())
}

fn init_daemon_logging(log_dir: &Path, log_file: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::never(log_dir, log_file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // A restart re-enters this function in the same process; the existing
    // subscriber keeps writing to the same file.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("d8rctl=info".parse().expect("valid directive"))
                .add_directive("domcluster_protocol=info".parse().expect("valid directive")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .try_init();

    Ok(guard)
}

/// Run the controller daemon until shutdown, returning whether a restart
/// was requested.
pub async fn run(config: Config) -> Result<bool> {
    let _log_guard = init_daemon_logging(&config.paths.log_dir, "d8rctl.log")?;

    write_pid(&config.paths).context("failed to write PID file")?;
    info!(pid = std::process::id(), "controller daemon starting");

    let shutdown = CancellationToken::new();
    let ctl = Controller::new(shutdown.clone());
    ctl.spawn_background();

    let passwords = PasswordManager::new(config.paths.password_file());
    passwords.init().context("failed to initialize password")?;

    let sessions = Arc::new(SessionStore::default());
    spawn_session_sweeper(sessions.clone(), shutdown.clone());

    let admin_state = AdminShared::new(ctl.clone(), sessions, passwords);

    // Publish server for agent streams.
    let server = ClusterServer::self_signed(config.bind_addr)
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.bind_addr, e))?;
    let acceptor = tokio::spawn(run_acceptor(server, ctl.clone(), shutdown.clone()));

    // Admin surfaces.
    let socket_server = tokio::spawn(admin::socket::serve(
        config.paths.socket_path(),
        admin_state.clone(),
        shutdown.clone(),
    ));
    let http_server = tokio::spawn(admin::http::serve(
        config.http_addr,
        admin_state.clone(),
        shutdown.clone(),
    ));

    info!(
        bind = %config.bind_addr,
        http = %config.http_addr,
        socket = %config.paths.socket_path().display(),
        "controller ready"
    );

    wait_for_shutdown(&shutdown).await;
    info!("shutting down");

    // Ordered teardown: the cancelled token has already stopped the
    // acceptor (no new streams) and nudged every session loop; wait for
    // the servers to drain before releasing the PID.
    if let Err(e) = acceptor.await {
        error!(error = %e, "acceptor task failed");
    }
    match socket_server.await {
        Ok(Err(e)) => error!(error = %e, "admin socket server failed"),
        Err(e) => error!(error = %e, "admin socket task failed"),
        _ => {}
    }
    match http_server.await {
        Ok(Err(e)) => error!(error = %e, "web API server failed"),
        Err(e) => error!(error = %e, "web API task failed"),
        _ => {}
    }

    remove_pid(&config.paths);
    let restart = admin_state.restart_requested();
    info!(restart, "controller stopped");
    Ok(restart)
}

async fn wait_for_shutdown(token: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            token.cancelled().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            token.cancelled().await;
            return;
        }
    };

    tokio::select! {
        _ = token.cancelled() => {}
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            token.cancel();
        }
        _ = sigint.recv() => {
            info!("SIGINT received");
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> Paths {
        Paths {
            runtime_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("log"),
        }
    }

    #[test]
    fn test_pid_round_trip() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);

        write_pid(&paths).unwrap();
        assert_eq!(read_pid(&paths).unwrap(), std::process::id() as i32);

        remove_pid(&paths);
        assert!(read_pid(&paths).is_err());
    }

    #[test]
    fn test_is_running_for_own_pid() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        write_pid(&paths).unwrap();
        assert!(is_running(&paths));
    }

    #[test]
    fn test_is_running_clears_stale_pid() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        // A PID that cannot exist on Linux (max is bounded well below this).
        std::fs::create_dir_all(&paths.runtime_dir).unwrap();
        std::fs::write(paths.pid_file(), "999999999").unwrap();

        assert!(!is_running(&paths));
        assert!(!paths.pid_file().exists(), "stale pid file must be cleared");
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let paths = Paths {
            runtime_dir: dir.path().to_path_buf(),
            log_dir: PathBuf::from("/tmp"),
        };
        std::fs::write(paths.pid_file(), "not-a-pid").unwrap();
        assert!(read_pid(&paths).is_err());
    }
}
