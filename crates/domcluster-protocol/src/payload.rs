// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed JSON payloads carried in the `data` field of publish frames.
//!
//! The wire frame treats `data` as opaque bytes; both ends decode it into
//! the types below keyed by the frame's `cmd`. Server-pushed commands embed
//! their own `cmd` discriminator inside the payload so the agent can route
//! them through its handler table.

use serde::{Deserialize, Serialize};

/// Command identifiers used in publish frames.
pub mod cmd {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STATUS_UPDATE: &str = "status_update";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const COMMAND_OUTPUT: &str = "command_output";
    pub const DOCKER_LIST: &str = "docker_list";
    pub const DOCKER_START: &str = "docker_start";
    pub const DOCKER_STOP: &str = "docker_stop";
    pub const DOCKER_RESTART: &str = "docker_restart";
    pub const DOCKER_LOGS: &str = "docker_logs";
    pub const DOCKER_STATS: &str = "docker_stats";
    pub const DOCKER_INSPECT: &str = "docker_inspect";
    pub const DOCKER_RESPONSE: &str = "docker_response";
    pub const STATUS_QUERY: &str = "status_query";
    pub const RESOURCE_QUERY: &str = "resource_query";
    pub const QUERY_RESPONSE: &str = "query_response";
    pub const NODE_STOPPING: &str = "node_stopping";
    pub const SHELL_EXEC: &str = "shell_exec";
}

/// `register` payload: the agent introduces itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// `heartbeat` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

/// Generic success body (`{"message": "..."}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error body carried by frames with `status < 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// `node_stopping` payload, sent best-effort on agent shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStoppingPayload {
    pub status: String,
    pub message: String,
}

/// `command_output` payload: one chunk of captured process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutputPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub output: String,
}

/// `command_result` payload: terminal status of a shell execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Status report (carried by `status_update` and `query_response`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub num_cpu: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuInfo {
    pub core_count: usize,
    pub usage_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub usage_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    pub network: NetworkInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    pub running_count: usize,
    pub total_count: usize,
    pub containers: Vec<ContainerSummary>,
}

/// The full status document an agent pushes to the controller.
///
/// Sections an agent cannot fill are omitted on the wire and default to
/// empty here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub host: HostInfo,
    #[serde(default)]
    pub system: SystemResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<EngineInfo>,
}

// ---------------------------------------------------------------------------
// Server-pushed commands
// ---------------------------------------------------------------------------

/// Resource classes an agent can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Docker,
}

/// A command the controller pushes down an agent's publish stream.
///
/// The `cmd` tag doubles as the handler-table key on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum PushedCommand {
    #[serde(rename = "status_query")]
    StatusQuery { timestamp: i64 },
    #[serde(rename = "resource_query")]
    ResourceQuery {
        resource: ResourceKind,
        timestamp: i64,
    },
    #[serde(rename = "docker_list")]
    DockerList {
        #[serde(default)]
        all: bool,
    },
    #[serde(rename = "docker_start")]
    DockerStart { container_id: String },
    #[serde(rename = "docker_stop")]
    DockerStop {
        container_id: String,
        #[serde(default)]
        timeout: Option<i64>,
    },
    #[serde(rename = "docker_restart")]
    DockerRestart { container_id: String },
    #[serde(rename = "docker_logs")]
    DockerLogs {
        container_id: String,
        #[serde(default)]
        tail: Option<String>,
    },
    #[serde(rename = "docker_stats")]
    DockerStats { container_id: String },
    #[serde(rename = "docker_inspect")]
    DockerInspect { container_id: String },
    #[serde(rename = "shell_exec")]
    ShellExec { command: String },
}

impl PushedCommand {
    /// The wire command string this payload is tagged with.
    pub fn cmd(&self) -> &'static str {
        match self {
            PushedCommand::StatusQuery { .. } => cmd::STATUS_QUERY,
            PushedCommand::ResourceQuery { .. } => cmd::RESOURCE_QUERY,
            PushedCommand::DockerList { .. } => cmd::DOCKER_LIST,
            PushedCommand::DockerStart { .. } => cmd::DOCKER_START,
            PushedCommand::DockerStop { .. } => cmd::DOCKER_STOP,
            PushedCommand::DockerRestart { .. } => cmd::DOCKER_RESTART,
            PushedCommand::DockerLogs { .. } => cmd::DOCKER_LOGS,
            PushedCommand::DockerStats { .. } => cmd::DOCKER_STATS,
            PushedCommand::DockerInspect { .. } => cmd::DOCKER_INSPECT,
            PushedCommand::ShellExec { .. } => cmd::SHELL_EXEC,
        }
    }
}

/// Extract the `cmd` discriminator from a pushed-command payload without
/// fully decoding it. Agents use this for handler-table lookup.
pub fn embedded_cmd(data: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        cmd: String,
    }
    serde_json::from_slice::<Probe>(data).ok().map(|p| p.cmd)
}
