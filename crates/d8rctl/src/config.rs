// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller configuration and filesystem layout.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Controller configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// QUIC address agents connect to
    pub bind_addr: SocketAddr,
    /// Loopback address for the web API
    pub http_addr: SocketAddr,
    pub paths: Paths,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `D8RCTL_BIND_ADDR`: QUIC bind address (default: 0.0.0.0:50051)
    /// - `D8RCTL_HTTP_ADDR`: web API address (default: 127.0.0.1:18080)
    /// - `D8RCTL_RUNTIME_DIR`: runtime directory (default: /run/d8rctl)
    /// - `D8RCTL_LOG_DIR`: log directory (default: /var/log/d8rctl)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = std::env::var("D8RCTL_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("D8RCTL_BIND_ADDR", "must be a socket address"))?;

        let http_addr = std::env::var("D8RCTL_HTTP_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:18080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("D8RCTL_HTTP_ADDR", "must be a socket address"))?;

        Ok(Self {
            bind_addr,
            http_addr,
            paths: Paths::from_env(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Filesystem layout of the controller's persisted state.
#[derive(Debug, Clone)]
pub struct Paths {
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var("D8RCTL_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/d8rctl"));
        let log_dir = std::env::var("D8RCTL_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/log/d8rctl"));
        Self {
            runtime_dir,
            log_dir,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("d8rctl.pid")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("d8rctl.sock")
    }

    pub fn password_file(&self) -> PathBuf {
        self.runtime_dir.join("password")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("d8rctl.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths {
            runtime_dir: PathBuf::from("/run/d8rctl"),
            log_dir: PathBuf::from("/var/log/d8rctl"),
        };
        assert_eq!(paths.pid_file(), PathBuf::from("/run/d8rctl/d8rctl.pid"));
        assert_eq!(paths.socket_path(), PathBuf::from("/run/d8rctl/d8rctl.sock"));
        assert_eq!(paths.password_file(), PathBuf::from("/run/d8rctl/password"));
        assert_eq!(paths.log_file(), PathBuf::from("/var/log/d8rctl/d8rctl.log"));
    }
}
