// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent configuration.
//!
//! Precedence: CLI flag > `DOMCLUSTER_*` environment variable > YAML file
//! > built-in default. The YAML file is the one the provisioner writes to
//! `/var/lib/domcluster/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_ADDRESS: &str = "localhost:50051";
pub const DEFAULT_ROLE: &str = "judgehost";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONFIG_FILE: &str = "/var/lib/domcluster/config.yaml";

/// Resolved agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Controller endpoint, `host:port`
    pub address: String,
    /// Informational role reported at registration
    pub role: String,
    /// Verify the controller certificate
    pub use_tls: bool,
    /// Connect timeout
    pub timeout: Duration,
    /// Node identity; defaults to the hostname when absent
    pub node_id: Option<String>,
    /// Display name; defaults to the node id
    pub node_name: Option<String>,
}

/// Values taken from the command line; `None` means not given.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub address: Option<String>,
    pub role: Option<String>,
    pub use_tls: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    node: NodeSection,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    address: Option<String>,
    use_tls: Option<bool>,
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSection {
    id: Option<String>,
    name: Option<String>,
    role: Option<String>,
}

impl AgentConfig {
    /// Load configuration with the documented precedence chain.
    pub fn load(overrides: &CliOverrides) -> Self {
        let path = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = read_file_config(&path);

        let env_address = std::env::var("DOMCLUSTER_ADDRESS").ok();
        let env_role = std::env::var("DOMCLUSTER_ROLE").ok();
        let env_use_tls = std::env::var("DOMCLUSTER_USE_TLS")
            .ok()
            .map(|v| v == "true" || v == "1");
        let env_timeout = std::env::var("DOMCLUSTER_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        let address = overrides
            .address
            .clone()
            .or(env_address)
            .or(file.server.address)
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());

        let role = overrides
            .role
            .clone()
            .or(env_role)
            .or(file.node.role)
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());

        let use_tls = overrides
            .use_tls
            .or(env_use_tls)
            .or(file.server.use_tls)
            .unwrap_or(false);

        let timeout_secs = overrides
            .timeout_secs
            .or(env_timeout)
            .or(file.server.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            address,
            role,
            use_tls,
            timeout: Duration::from_secs(timeout_secs),
            node_id: file.node.id,
            node_name: file.node.name,
        }
    }
}

/// Filesystem layout of the agent's persisted state.
#[derive(Debug, Clone)]
pub struct Paths {
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var("DOMCLUSTERD_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/domclusterd"));
        let log_dir = std::env::var("DOMCLUSTERD_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/log/domclusterd"));
        Self {
            runtime_dir,
            log_dir,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("domclusterd.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("domclusterd.log")
    }
}

fn read_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str(&content) {
            Ok(config) => {
                debug!(path = %path.display(), "config file loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
                FileConfig::default()
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "config file not found, using defaults");
            FileConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Environment variables are process-global; serialize tests touching them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "DOMCLUSTER_ADDRESS",
            "DOMCLUSTER_ROLE",
            "DOMCLUSTER_USE_TLS",
            "DOMCLUSTER_TIMEOUT",
        ] {
            std::env::remove_var(var);
        }
    }

    fn yaml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_defaults_when_nothing_configured() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let overrides = CliOverrides {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);

        assert_eq!(config.address, "localhost:50051");
        assert_eq!(config.role, "judgehost");
        assert!(!config.use_tls);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.node_id.is_none());
    }

    #[test]
    fn test_file_values_override_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let file = yaml_file(
            r#"server:
  address: "10.0.0.1:50051"
  use_tls: true
  timeout: 20

node:
  id: "host-a"
  name: "host-a"
  role: "builder"
"#,
        );

        let overrides = CliOverrides {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);

        assert_eq!(config.address, "10.0.0.1:50051");
        assert!(config.use_tls);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.role, "builder");
        assert_eq!(config.node_id.as_deref(), Some("host-a"));
        assert_eq!(config.node_name.as_deref(), Some("host-a"));
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let file = yaml_file(
            r#"server:
  address: "10.0.0.1:50051"
"#,
        );

        std::env::set_var("DOMCLUSTER_ADDRESS", "10.9.9.9:50051");
        std::env::set_var("DOMCLUSTER_TIMEOUT", "30");

        let overrides = CliOverrides {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);
        clear_env();

        assert_eq!(config.address, "10.9.9.9:50051");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_flag_overrides_env_and_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let file = yaml_file(
            r#"server:
  address: "file:50051"
"#,
        );
        std::env::set_var("DOMCLUSTER_ADDRESS", "env:50051");

        let overrides = CliOverrides {
            address: Some("flag:50051".to_string()),
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);
        clear_env();

        assert_eq!(config.address, "flag:50051");
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let file = yaml_file(":: not yaml ::");
        let overrides = CliOverrides {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);
        assert_eq!(config.address, "localhost:50051");
    }

    #[test]
    fn test_provisioner_rendered_config_parses() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        // Shape written by the controller's provisioner.
        let file = yaml_file(
            r#"server:
  address: "10.0.0.1:50051"
  use_tls: false

node:
  id: "fresh-host"
  name: "fresh-host"
"#,
        );
        let overrides = CliOverrides {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = AgentConfig::load(&overrides);
        assert_eq!(config.node_id.as_deref(), Some("fresh-host"));
        assert_eq!(config.address, "10.0.0.1:50051");
    }
}
