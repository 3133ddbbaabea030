// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! d8rctl command line.
//!
//! Usage:
//!   d8rctl <command> [options]
//!
//! Commands:
//!   daemon                        Run the controller in the foreground
//!   start                         Start the controller daemon
//!   stop                          Stop the controller daemon
//!   status                        Show daemon status
//!   restart                       Restart the controller daemon
//!   logs [N]                      Show the last N log lines (default 50)
//!   password [reset]              Manage the web-UI password
//!   pod list                      List registered nodes
//!   host add --ssh <user@host[:port]> --controller <addr> [--password <pw>] [--key-file <path>]
//!   host list                     List registered nodes
//!   host remove <node-id>         Remove a node from the registry

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::auth::PasswordManager;
use crate::config::{Config, Paths};
use crate::daemon;
use crate::logs::read_last_lines;

const DEFAULT_LOG_LINES: usize = 50;

fn print_usage() {
    eprintln!(
        r#"Usage: d8rctl <command> [options]

domcluster controller.

COMMANDS:
    daemon                      Run the controller in the foreground
    start                       Start the controller daemon
    stop                        Stop the controller daemon
    status                      Show daemon status
    restart                     Restart the controller daemon
    logs [N]                    Show the last N log lines (default 50)
    password                    Show password guidance
    password reset              Generate and print a new web-UI password
    pod list                    List registered nodes
    host add                    Provision a new host as an agent
    host list                   List registered nodes
    host remove <node-id>       Remove a node from the registry

HOST ADD OPTIONS:
    --ssh <user@host[:port]>    SSH target (required)
    --controller <addr>         Address agents dial back to (required)
    --password <password>       SSH password
    --key-file <path>           SSH private key file

ENVIRONMENT:
    D8RCTL_BIND_ADDR            QUIC bind address (default: 0.0.0.0:50051)
    D8RCTL_HTTP_ADDR            Web API address (default: 127.0.0.1:18080)
    D8RCTL_RUNTIME_DIR          Runtime directory (default: /run/d8rctl)
    D8RCTL_LOG_DIR              Log directory (default: /var/log/d8rctl)
"#
    );
}

#[derive(Debug)]
enum Command {
    Daemon,
    Start,
    Stop,
    Status,
    Restart,
    Logs { lines: usize },
    Password { reset: bool },
    PodList,
    HostAdd(HostAddArgs),
    HostList,
    HostRemove { node_id: String },
}

#[derive(Debug, Default)]
struct HostAddArgs {
    ssh: Option<String>,
    password: Option<String>,
    key_file: Option<PathBuf>,
    controller: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut iter = args.iter();
    let command = iter.next().ok_or("missing command")?;

    match command.as_str() {
        "daemon" => Ok(Command::Daemon),
        "start" => Ok(Command::Start),
        "stop" => Ok(Command::Stop),
        "status" => Ok(Command::Status),
        "restart" => Ok(Command::Restart),
        "logs" => {
            let lines = match iter.next() {
                Some(n) => n
                    .parse()
                    .map_err(|_| format!("invalid line count: {}", n))?,
                None => DEFAULT_LOG_LINES,
            };
            Ok(Command::Logs { lines })
        }
        "password" => match iter.next().map(String::as_str) {
            None => Ok(Command::Password { reset: false }),
            Some("reset") => Ok(Command::Password { reset: true }),
            Some(other) => Err(format!("unknown password subcommand: {}", other)),
        },
        "pod" => match iter.next().map(String::as_str) {
            Some("list") => Ok(Command::PodList),
            _ => Err("usage: pod list".to_string()),
        },
        "host" => match iter.next().map(String::as_str) {
            Some("add") => {
                let mut add = HostAddArgs::default();
                while let Some(flag) = iter.next() {
                    let mut value = || {
                        iter.next()
                            .cloned()
                            .ok_or_else(|| format!("{} requires a value", flag))
                    };
                    match flag.as_str() {
                        "--ssh" => add.ssh = Some(value()?),
                        "--password" => add.password = Some(value()?),
                        "--key-file" => add.key_file = Some(PathBuf::from(value()?)),
                        "--controller" => add.controller = Some(value()?),
                        other => return Err(format!("unknown option: {}", other)),
                    }
                }
                Ok(Command::HostAdd(add))
            }
            Some("list") => Ok(Command::HostList),
            Some("remove") => {
                let node_id = iter.next().ok_or("usage: host remove <node-id>")?;
                Ok(Command::HostRemove {
                    node_id: node_id.clone(),
                })
            }
            _ => Err("usage: host {add|list|remove}".to_string()),
        },
        other => Err(format!("unknown command: {}", other)),
    }
}

/// Entry point for the binary.
pub async fn run() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let paths = Paths::from_env();

    let result = match command {
        Command::Daemon => run_daemon().await,
        Command::Start => daemon::start_detached(&paths).map(|_| println!("daemon started")),
        Command::Stop => cmd_stop(&paths).await,
        Command::Status => cmd_status(&paths).await,
        Command::Restart => cmd_restart(&paths).await,
        Command::Logs { lines } => cmd_logs(&paths, lines),
        Command::Password { reset } => cmd_password(&paths, reset),
        Command::PodList | Command::HostList => cmd_list_nodes(&paths).await,
        Command::HostAdd(add) => cmd_host_add(&paths, add).await,
        Command::HostRemove { node_id } => cmd_host_remove(&paths, &node_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon() -> anyhow::Result<()> {
    loop {
        let config = Config::from_env()?;
        let restart = daemon::run(config).await?;
        if !restart {
            return Ok(());
        }
        // Restart requested via the admin surface: loop with fresh config.
    }
}

async fn cmd_stop(paths: &Paths) -> anyhow::Result<()> {
    // Prefer a clean stop over the admin socket; fall back to SIGTERM.
    match uds_request(&paths.socket_path(), "POST", "/stop", None).await {
        Ok(_) => {
            println!("stop requested");
            Ok(())
        }
        Err(_) => daemon::stop(paths).map(|_| println!("SIGTERM sent")),
    }
}

async fn cmd_status(paths: &Paths) -> anyhow::Result<()> {
    match uds_request(&paths.socket_path(), "GET", "/status", None).await {
        Ok((200, body)) => {
            println!("{}", body);
            Ok(())
        }
        Ok((code, body)) => anyhow::bail!("status request failed ({}): {}", code, body),
        Err(_) if daemon::is_running(paths) => {
            println!("daemon is running (pid {})", daemon::read_pid(paths)?);
            Ok(())
        }
        Err(_) => anyhow::bail!("daemon is not running"),
    }
}

async fn cmd_restart(paths: &Paths) -> anyhow::Result<()> {
    match uds_request(&paths.socket_path(), "POST", "/restart", None).await {
        Ok(_) => {
            println!("restart requested");
            Ok(())
        }
        Err(e) => anyhow::bail!("daemon is not reachable: {}", e),
    }
}

fn cmd_logs(paths: &Paths, lines: usize) -> anyhow::Result<()> {
    let log_file = paths.log_file();
    if !log_file.exists() {
        anyhow::bail!("log file not found");
    }
    for line in read_last_lines(&log_file, lines)? {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_password(paths: &Paths, reset: bool) -> anyhow::Result<()> {
    let manager = PasswordManager::new(paths.password_file());
    if reset {
        let password = manager.reset()?;
        println!("New password: {}", password);
    } else {
        println!(
            "The password cannot be recovered from its hash. Check the daemon \
             log for the initial password or run 'd8rctl password reset'."
        );
    }
    Ok(())
}

async fn cmd_list_nodes(paths: &Paths) -> anyhow::Result<()> {
    let (code, body) = uds_request(&paths.socket_path(), "GET", "/nodes", None)
        .await
        .map_err(|e| anyhow::anyhow!("daemon is not reachable: {}", e))?;
    if code != 200 {
        anyhow::bail!("node list failed ({}): {}", code, body);
    }

    let nodes: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&body)?;
    if nodes.is_empty() {
        println!("no nodes registered");
        return Ok(());
    }

    println!("{:<24} {:<16} {:<12} {:<10}", "NODE ID", "NAME", "ROLE", "VERSION");
    for (id, info) in nodes {
        println!(
            "{:<24} {:<16} {:<12} {:<10}",
            id,
            info.get("name").and_then(|v| v.as_str()).unwrap_or("-"),
            info.get("role").and_then(|v| v.as_str()).unwrap_or("-"),
            info.get("version").and_then(|v| v.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_host_add(paths: &Paths, add: HostAddArgs) -> anyhow::Result<()> {
    let ssh = add.ssh.ok_or_else(|| anyhow::anyhow!("--ssh is required"))?;
    let controller = add
        .controller
        .ok_or_else(|| anyhow::anyhow!("--controller is required"))?;

    let body = json!({
        "ssh_connection_string": ssh,
        "password": add.password,
        "key_file": add.key_file,
        "d8rctl_address": controller,
    })
    .to_string();

    let (code, body) = uds_request(&paths.socket_path(), "POST", "/hosts/add", Some(&body))
        .await
        .map_err(|e| anyhow::anyhow!("daemon is not reachable: {}", e))?;

    println!("{}", body);
    if code != 200 {
        anyhow::bail!("host provisioning failed ({})", code);
    }
    Ok(())
}

async fn cmd_host_remove(paths: &Paths, node_id: &str) -> anyhow::Result<()> {
    let body = json!({ "node_id": node_id }).to_string();
    let (code, body) = uds_request(&paths.socket_path(), "POST", "/nodes/remove", Some(&body))
        .await
        .map_err(|e| anyhow::anyhow!("daemon is not reachable: {}", e))?;
    if code != 200 {
        anyhow::bail!("remove failed ({}): {}", code, body);
    }
    println!("node {} removed", node_id);
    Ok(())
}

/// Minimal HTTP/1.1 client over the admin unix socket.
async fn uds_request(
    socket: &Path,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> std::io::Result<(u16, String)> {
    let mut stream = UnixStream::connect(socket).await?;

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_http_response(&raw)
}

fn parse_http_response(raw: &[u8]) -> std::io::Result<(u16, String)> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text.split_once("\r\n\r\n").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed HTTP response")
    })?;

    let status_line = head.lines().next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed status line")
        })?;

    let chunked = head
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:") && l.contains("chunked"));

    let body = if chunked {
        dechunk(body)
    } else {
        body.to_string()
    };

    Ok((code, body))
}

fn dechunk(body: &str) -> String {
    let mut out = String::new();
    let mut rest = body;
    loop {
        let Some((size_line, tail)) = rest.split_once("\r\n") else {
            break;
        };
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        if tail.len() < size {
            out.push_str(tail);
            break;
        }
        out.push_str(&tail[..size]);
        rest = tail[size..].trim_start_matches("\r\n");
    }
    out
}
