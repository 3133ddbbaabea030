// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote-host provisioner: bootstrap a fresh Linux host into an agent.
//!
//! A scripted sequence over one SSH session: probe the system, upload the
//! agent binary, write its config, start it detached. Each step fails
//! typed and unretried; the operator reissues the command.

pub mod ssh;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use ssh::{parse_ssh_target, SshAuth, SshSession};

const REMOTE_TMP_PATH: &str = "/tmp/domclusterd";
const REMOTE_FINAL_PATH: &str = "/usr/local/bin/domclusterd";
const REMOTE_CONFIG_DIR: &str = "/var/lib/domcluster";
const REMOTE_LOG_PATH: &str = "/tmp/domclusterd.log";

/// Typed per-step provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid SSH target: {0}")]
    Target(String),

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("remote command failed: {0}")]
    Exec(String),

    #[error("system probe failed: {0}")]
    Probe(String),

    #[error("unsupported OS: {0} (only Linux is supported)")]
    UnsupportedOs(String),

    #[error("binary upload failed: {0}")]
    Upload(String),

    #[error("config write failed: {0}")]
    Config(String),

    #[error("agent launch failed: {0}")]
    Launch(String),

    #[error("agent binary not found")]
    BinaryNotFound,
}

/// Operator request, as posted to `/hosts/add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub ssh_connection_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    pub d8rctl_address: String,
}

/// Structured outcome reported back to the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// Streamable progress messages for the admin client.
pub type ProgressSender = mpsc::UnboundedSender<String>;

pub struct Provisioner {
    agent_binary: PathBuf,
}

impl Provisioner {
    pub fn new(agent_binary: impl Into<PathBuf>) -> Self {
        Self {
            agent_binary: agent_binary.into(),
        }
    }

    /// Find the domclusterd binary next to our own executable or on PATH.
    pub fn locate() -> Result<Self, ProvisionError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("domclusterd"));
                candidates.push(dir.join("../built/domclusterd"));
            }
        }
        candidates.push(PathBuf::from("./built/domclusterd"));
        candidates.push(PathBuf::from("./domclusterd"));

        for candidate in candidates {
            if candidate.is_file() {
                return Ok(Self::new(candidate));
            }
        }

        // Last resort: PATH lookup.
        if let Ok(path_var) = std::env::var("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join("domclusterd");
                if candidate.is_file() {
                    return Ok(Self::new(candidate));
                }
            }
        }

        Err(ProvisionError::BinaryNotFound)
    }

    pub fn agent_binary(&self) -> &Path {
        &self.agent_binary
    }

    /// Run the full provisioning sequence, stopping on the first hard
    /// error. Blocking; call from `spawn_blocking`.
    pub fn provision(
        &self,
        req: &ProvisionRequest,
        progress: Option<&ProgressSender>,
    ) -> Result<ProvisionResult, (ProvisionError, ProvisionResult)> {
        let report = |msg: &str| {
            if let Some(tx) = progress {
                let _ = tx.send(msg.to_string());
            }
            info!("{}", msg);
        };

        report("Starting host provisioning...");

        report("Parsing SSH connection string...");
        let target = parse_ssh_target(&req.ssh_connection_string)
            .map_err(|e| failure(e, ProvisionResult::default()))?;

        let auth = SshAuth {
            password: req.password.clone(),
            key_file: req.key_file.clone(),
        };

        report("Connecting to remote host via SSH...");
        let session = SshSession::connect(&target, &auth)
            .map_err(|e| failure(e, ProvisionResult::default()))?;

        report("Retrieving system information...");
        let system = session
            .system_info()
            .map_err(|e| failure(e, ProvisionResult::default()))?;
        report(&format!(
            "Remote system: {} ({}/{})",
            system.hostname, system.os, system.arch
        ));

        let partial = ProvisionResult {
            success: false,
            message: String::new(),
            node_id: None,
            hostname: Some(system.hostname.clone()),
            os: Some(system.os.clone()),
            arch: Some(system.arch.clone()),
        };

        if !system.os.eq_ignore_ascii_case("linux") {
            let err = ProvisionError::UnsupportedOs(system.os.clone());
            report(&err.to_string());
            return Err(failure(err, partial));
        }

        report("Uploading domclusterd binary...");
        let binary = std::fs::read(&self.agent_binary)
            .map_err(|e| failure(ProvisionError::Upload(e.to_string()), partial.clone()))?;
        session
            .upload(&binary, Path::new(REMOTE_TMP_PATH), 0o755)
            .map_err(|e| failure(e, partial.clone()))?;

        report("Creating configuration directory...");
        let mkdir = format!("sudo mkdir -p {} 2>/dev/null || mkdir -p {}", REMOTE_CONFIG_DIR, REMOTE_CONFIG_DIR);
        session
            .exec_checked(&mkdir)
            .map_err(|e| failure(ProvisionError::Config(e.to_string()), partial.clone()))?;

        report("Installing domclusterd...");
        let install = format!(
            "sudo mv {} {} 2>/dev/null || mv {} {}",
            REMOTE_TMP_PATH, REMOTE_FINAL_PATH, REMOTE_TMP_PATH, REMOTE_FINAL_PATH
        );
        let final_path = match session.exec(&install) {
            Ok((_, 0)) => REMOTE_FINAL_PATH,
            // Unwritable /usr/local/bin: run from the upload location.
            _ => REMOTE_TMP_PATH,
        };

        report("Creating configuration file...");
        let config = render_agent_config(&req.d8rctl_address, &system.hostname);
        let config_path = format!("{}/config.yaml", REMOTE_CONFIG_DIR);
        write_remote_config(&session, &config_path, &config)
            .map_err(|e| failure(e, partial.clone()))?;

        report("Starting domclusterd service...");
        let start = format!(
            "nohup {} daemon --config {} > {} 2>&1 &",
            final_path, config_path, REMOTE_LOG_PATH
        );
        session
            .exec_checked(&start)
            .map_err(|e| failure(ProvisionError::Launch(e.to_string()), partial.clone()))?;

        report("Host provisioned successfully!");

        Ok(ProvisionResult {
            success: true,
            message: "Host provisioned successfully".to_string(),
            node_id: Some(system.hostname.clone()),
            hostname: Some(system.hostname),
            os: Some(system.os),
            arch: Some(system.arch),
        })
    }
}

fn failure(err: ProvisionError, mut partial: ProvisionResult) -> (ProvisionError, ProvisionResult) {
    partial.success = false;
    partial.message = err.to_string();
    (err, partial)
}

fn write_remote_config(
    session: &SshSession,
    path: &str,
    content: &str,
) -> Result<(), ProvisionError> {
    let plain = format!("cat > {} << 'EOFCONFIG'\n{}\nEOFCONFIG", path, content);
    if session.exec_checked(&plain).is_ok() {
        return Ok(());
    }
    let sudo = format!(
        "sudo bash -c \"cat > {} << 'EOFCONFIG'\n{}\nEOFCONFIG\"",
        path, content
    );
    session
        .exec_checked(&sudo)
        .map(|_| ())
        .map_err(|e| ProvisionError::Config(e.to_string()))
}

/// Render the YAML config the freshly provisioned agent starts with.
/// `node-id` is the remote hostname.
pub fn render_agent_config(controller_address: &str, hostname: &str) -> String {
    format!(
        r#"server:
  address: "{}"
  use_tls: false

node:
  id: "{}"
  name: "{}"
"#,
        controller_address, hostname, hostname
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_agent_config() {
        let config = render_agent_config("10.0.0.1:50051", "host-a");
        assert!(config.contains(r#"address: "10.0.0.1:50051""#));
        assert!(config.contains(r#"id: "host-a""#));
        assert!(config.contains(r#"name: "host-a""#));
        assert!(config.contains("use_tls: false"));
    }

    #[test]
    fn test_locate_missing_binary() {
        // Run from a directory without the agent binary and an empty PATH.
        let old_path = std::env::var("PATH").ok();
        std::env::set_var("PATH", "");
        let result = Provisioner::locate();
        if let Some(p) = old_path {
            std::env::set_var("PATH", p);
        }
        // The binary may legitimately sit next to the test executable;
        // only the error shape is asserted when it is absent.
        if let Err(e) = result {
            assert!(matches!(e, ProvisionError::BinaryNotFound));
        }
    }

    #[test]
    fn test_provision_request_deserializes_operator_body() {
        let body = br#"{
            "ssh_connection_string": "root@10.0.0.5",
            "password": "pw",
            "d8rctl_address": "10.0.0.1:50051"
        }"#;
        let req: ProvisionRequest = serde_json::from_slice(body).unwrap();
        assert_eq!(req.ssh_connection_string, "root@10.0.0.5");
        assert_eq!(req.password.as_deref(), Some("pw"));
        assert!(req.key_file.is_none());
    }

    #[test]
    fn test_provision_fails_typed_on_bad_target() {
        let provisioner = Provisioner::new("/nonexistent/domclusterd");
        let req = ProvisionRequest {
            ssh_connection_string: "not-a-target".to_string(),
            password: Some("pw".to_string()),
            key_file: None,
            d8rctl_address: "10.0.0.1:50051".to_string(),
        };
        let (err, result) = provisioner.provision(&req, None).unwrap_err();
        assert!(matches!(err, ProvisionError::Target(_)));
        assert!(!result.success);
        assert!(result.message.contains("invalid SSH target"));
    }
}
