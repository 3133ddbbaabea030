// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! domclusterd command line.
//!
//! Usage:
//!   domclusterd <command> [options]
//!
//! Commands:
//!   daemon [--address <addr>] [--role <role>] [--tls] [--timeout <secs>] [--config <path>]
//!   start | stop | status | restart
//!   logs [N]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use crate::config::{CliOverrides, Paths};
use crate::daemon;
use crate::logs::read_last_lines;

const DEFAULT_LOG_LINES: usize = 50;
const STOP_WAIT: Duration = Duration::from_secs(30);
const STOP_POLL: Duration = Duration::from_millis(500);

fn print_usage() {
    eprintln!(
        r#"Usage: domclusterd <command> [options]

domcluster node agent.

COMMANDS:
    daemon                      Run the agent in the foreground
    start                       Start the agent daemon
    stop                        Stop the agent daemon
    status                      Show daemon status
    restart                     Restart the agent daemon
    logs [N]                    Show the last N log lines (default 50)

DAEMON OPTIONS:
    --address <host:port>       Controller address (default: localhost:50051)
    --role <role>               Node role (default: judgehost)
    --tls                       Verify the controller certificate
    --timeout <secs>            Connect timeout (default: 10)
    --config <path>             Config file (default: /var/lib/domcluster/config.yaml)

ENVIRONMENT:
    DOMCLUSTER_ADDRESS          Controller address
    DOMCLUSTER_ROLE             Node role
    DOMCLUSTER_USE_TLS          Verify the controller certificate
    DOMCLUSTER_TIMEOUT          Connect timeout in seconds
    DOMCLUSTERD_RUNTIME_DIR     Runtime directory (default: /var/run/domclusterd)
    DOMCLUSTERD_LOG_DIR         Log directory (default: /var/log/domclusterd)
"#
    );
}

#[derive(Debug)]
enum Command {
    Daemon(CliOverrides),
    Start,
    Stop,
    Status,
    Restart,
    Logs { lines: usize },
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut iter = args.iter();
    let command = iter.next().ok_or("missing command")?;

    match command.as_str() {
        "daemon" => {
            let mut overrides = CliOverrides::default();
            while let Some(flag) = iter.next() {
                match flag.as_str() {
                    "--address" => {
                        overrides.address =
                            Some(iter.next().ok_or("--address requires a value")?.clone());
                    }
                    "--role" => {
                        overrides.role =
                            Some(iter.next().ok_or("--role requires a value")?.clone());
                    }
                    "--tls" => overrides.use_tls = Some(true),
                    "--timeout" => {
                        let value = iter.next().ok_or("--timeout requires a value")?;
                        overrides.timeout_secs =
                            Some(value.parse().map_err(|_| "invalid timeout")?);
                    }
                    "--config" => {
                        overrides.config_file = Some(PathBuf::from(
                            iter.next().ok_or("--config requires a value")?,
                        ));
                    }
                    other => return Err(format!("unknown option: {}", other)),
                }
            }
            Ok(Command::Daemon(overrides))
        }
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
        Command::Daemon(overrides) => daemon::run(overrides).await,
        Command::Start => daemon::start_detached(&paths).map(|_| println!("daemon started")),
        Command::Stop => daemon::stop(&paths).map(|_| println!("SIGTERM sent")),
        Command::Status => cmd_status(&paths),
        Command::Restart => cmd_restart(&paths).await,
        Command::Logs { lines } => cmd_logs(&paths, lines),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_status(paths: &Paths) -> anyhow::Result<()> {
    if daemon::is_running(paths) {
        println!("daemon is running (pid {})", daemon::read_pid(paths)?);
        Ok(())
    } else {
        anyhow::bail!("daemon is not running")
    }
}

async fn cmd_restart(paths: &Paths) -> anyhow::Result<()> {
    if daemon::is_running(paths) {
        daemon::stop(paths)?;

        // Poll until the old process releases the PID file.
        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        while daemon::is_running(paths) {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("daemon did not stop within {:?}", STOP_WAIT);
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }

    daemon::start_detached(paths)?;
    println!("daemon restarted");
    Ok(())
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
