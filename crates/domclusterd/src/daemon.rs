// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent daemon lifecycle: PID file, log file, connection manager and
//! background tasks.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use domcluster_protocol::ClusterClientConfig;

use crate::config::{AgentConfig, CliOverrides, Paths};
use crate::docker::{handler::register_docker_handlers, DockerClient};
use crate::manager::{AgentIdentity, ConnectionManager};
use crate::monitor::{query::register_query_handlers, reporter, Monitor};
use crate::shell::register_shell_handler;

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

/// Resolve a `host:port` controller address, preferring IPv4.
fn resolve_controller(address: &str) -> Result<(SocketAddr, String)> {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| address.to_string());

    let mut addrs = address
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", address))?;
    let addr = addrs
        .find(|a| a.is_ipv4())
        .or_else(|| address.to_socket_addrs().ok().and_then(|mut a| a.next()))
        .with_context(|| format!("no address for {}", address))?;

    Ok((addr, host))
}

/// Run the agent daemon until shutdown.
pub async fn run(overrides: CliOverrides) -> Result<()> {
    let paths = Paths::from_env();

    std::fs::create_dir_all(&paths.log_dir)?;
    let appender = tracing_appender::rolling::never(&paths.log_dir, "domclusterd.log");
    let (writer, _log_guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("domclusterd=info".parse().expect("valid directive"))
                .add_directive("domcluster_protocol=info".parse().expect("valid directive")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .try_init();

    let config = AgentConfig::load(&overrides);

    let node_id = config
        .node_id
        .clone()
        .or_else(|| sysinfo::System::host_name())
        .context("cannot determine node id (no hostname)")?;
    let node_name = config.node_name.clone().unwrap_or_else(|| node_id.clone());

    write_pid(&paths).context("failed to write PID file")?;
    info!(
        pid = std::process::id(),
        node_id = %node_id,
        address = %config.address,
        role = %config.role,
        "agent daemon starting"
    );

    let (server_addr, server_name) = resolve_controller(&config.address)?;
    let client_config = ClusterClientConfig {
        server_addr,
        server_name,
        verify_certificate: config.use_tls,
        connect_timeout_ms: config.timeout.as_millis() as u64,
        ..Default::default()
    };

    let shutdown = CancellationToken::new();
    let manager = ConnectionManager::new(
        AgentIdentity {
            node_id,
            name: node_name,
            role: config.role.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        client_config,
        shutdown.clone(),
    )?;

    // The engine adapter is optional; nodes without Docker still serve
    // telemetry and shell commands.
    let docker = match DockerClient::connect() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "docker unavailable, container features disabled");
            None
        }
    };

    let monitor = Arc::new(Monitor::new(docker.clone()));
    register_query_handlers(&manager, monitor.clone());
    register_docker_handlers(&manager, docker);
    register_shell_handler(&manager);

    reporter::spawn_reporter(
        monitor,
        manager.outbound(),
        reporter::REPORT_INTERVAL,
        shutdown.clone(),
    );

    spawn_signal_handler(shutdown.clone());

    let result = manager.run().await;
    remove_pid(&paths);

    match result {
        Ok(()) => {
            info!("agent stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "agent failed");
            Err(e.into())
        }
    }
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = sigint.recv() => info!("SIGINT received"),
        }
        token.cancel();
    });
}
