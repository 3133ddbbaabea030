// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blocking SSH session used by the provisioner.
//!
//! Key auth is preferred, password is the fallback. Host keys are not
//! verified in this version; callers run inside `spawn_blocking`.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::Session;

use super::ProvisionError;

pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed `user@host[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// Parse an SSH connection string of the form `user@host[:port]`.
pub fn parse_ssh_target(conn_str: &str) -> Result<SshTarget, ProvisionError> {
    let (user, host_port) = conn_str.split_once('@').ok_or_else(|| {
        ProvisionError::Target("expected user@host[:port]".to_string())
    })?;

    if user.is_empty() {
        return Err(ProvisionError::Target("empty user".to_string()));
    }

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProvisionError::Target(format!("invalid port: {}", port)))?;
            (host, port)
        }
        None => (host_port, 22),
    };

    if host.is_empty() {
        return Err(ProvisionError::Target("empty host".to_string()));
    }

    Ok(SshTarget {
        user: user.to_string(),
        host: host.to_string(),
        port,
    })
}

/// Authentication material for a provisioning session.
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
}

/// An authenticated SSH session to the target host.
pub struct SshSession {
    session: Session,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").finish_non_exhaustive()
    }
}

impl SshSession {
    /// Connect and authenticate. Key auth first when a key is given,
    /// password as fallback.
    pub fn connect(target: &SshTarget, auth: &SshAuth) -> Result<Self, ProvisionError> {
        if auth.password.is_none() && auth.key_file.is_none() {
            return Err(ProvisionError::Connect(
                "no authentication method provided (password or key required)".to_string(),
            ));
        }

        let addr = format!("{}:{}", target.host, target.port);
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| ProvisionError::Connect(format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ProvisionError::Connect(format!("no address for {}", addr)))?;

        let stream = TcpStream::connect_timeout(&sock_addr, SSH_CONNECT_TIMEOUT)
            .map_err(|e| ProvisionError::Connect(format!("connect {}: {}", addr, e)))?;

        let mut session = Session::new()
            .map_err(|e| ProvisionError::Connect(format!("ssh session init: {}", e)))?;
        session.set_tcp_stream(stream);
        session.set_timeout(SSH_CONNECT_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| ProvisionError::Connect(format!("ssh handshake: {}", e)))?;

        let mut authenticated = false;
        if let Some(key_file) = &auth.key_file {
            match session.userauth_pubkey_file(&target.user, None, key_file, None) {
                Ok(()) => authenticated = true,
                Err(e) => {
                    if auth.password.is_none() {
                        return Err(ProvisionError::Connect(format!("key auth failed: {}", e)));
                    }
                }
            }
        }
        if !authenticated {
            if let Some(password) = &auth.password {
                session
                    .userauth_password(&target.user, password)
                    .map_err(|e| ProvisionError::Connect(format!("password auth failed: {}", e)))?;
            }
        }

        if !session.authenticated() {
            return Err(ProvisionError::Connect("authentication failed".to_string()));
        }

        Ok(Self { session })
    }

    /// Run a command and return its combined output and exit status.
    pub fn exec(&self, command: &str) -> Result<(String, i32), ProvisionError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ProvisionError::Exec(format!("open channel: {}", e)))?;

        channel
            .exec(command)
            .map_err(|e| ProvisionError::Exec(format!("exec '{}': {}", command, e)))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| ProvisionError::Exec(format!("read output: {}", e)))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        output.push_str(&stderr);

        channel
            .wait_close()
            .map_err(|e| ProvisionError::Exec(format!("close channel: {}", e)))?;
        let exit = channel
            .exit_status()
            .map_err(|e| ProvisionError::Exec(format!("exit status: {}", e)))?;

        Ok((output, exit))
    }

    /// Run a command, failing on a non-zero exit status.
    pub fn exec_checked(&self, command: &str) -> Result<String, ProvisionError> {
        let (output, exit) = self.exec(command)?;
        if exit != 0 {
            return Err(ProvisionError::Exec(format!(
                "'{}' exited {}: {}",
                command,
                exit,
                output.trim()
            )));
        }
        Ok(output)
    }

    /// Upload `data` to `remote_path` with the given mode, using the SCP
    /// channel and falling back to an inline here-doc write.
    pub fn upload(
        &self,
        data: &[u8],
        remote_path: &Path,
        mode: i32,
    ) -> Result<(), ProvisionError> {
        match self.scp_upload(data, remote_path, mode) {
            Ok(()) => {}
            Err(scp_err) => {
                // SCP may be unavailable on minimal hosts; write via shell.
                self.heredoc_upload(data, remote_path).map_err(|_| scp_err)?;
            }
        }

        self.exec_checked(&format!("chmod {:o} {}", mode, remote_path.display()))
            .map_err(|e| ProvisionError::Upload(e.to_string()))?;
        Ok(())
    }

    fn scp_upload(&self, data: &[u8], remote_path: &Path, mode: i32) -> Result<(), ProvisionError> {
        use std::io::Write;

        let mut channel = self
            .session
            .scp_send(remote_path, mode, data.len() as u64, None)
            .map_err(|e| ProvisionError::Upload(format!("scp open: {}", e)))?;
        channel
            .write_all(data)
            .map_err(|e| ProvisionError::Upload(format!("scp write: {}", e)))?;
        channel
            .send_eof()
            .map_err(|e| ProvisionError::Upload(format!("scp eof: {}", e)))?;
        channel
            .wait_eof()
            .map_err(|e| ProvisionError::Upload(format!("scp wait eof: {}", e)))?;
        channel
            .wait_close()
            .map_err(|e| ProvisionError::Upload(format!("scp close: {}", e)))?;
        Ok(())
    }

    fn heredoc_upload(&self, data: &[u8], remote_path: &Path) -> Result<(), ProvisionError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProvisionError::Upload("binary payload needs scp".to_string()))?;
        let command = format!(
            "cat > {} << 'EOFUPLOAD'\n{}\nEOFUPLOAD",
            remote_path.display(),
            text
        );
        self.exec_checked(&command)
            .map_err(|e| ProvisionError::Upload(e.to_string()))?;
        Ok(())
    }

    /// Query `{os, arch, hostname}` from the remote host.
    pub fn system_info(&self) -> Result<RemoteSystem, ProvisionError> {
        let os = self
            .exec_checked("uname -s")
            .map_err(|e| ProvisionError::Probe(e.to_string()))?
            .trim()
            .to_string();
        let arch = self
            .exec_checked("uname -m")
            .map_err(|e| ProvisionError::Probe(e.to_string()))?
            .trim()
            .to_string();
        let hostname = self
            .exec_checked("hostname")
            .map_err(|e| ProvisionError::Probe(e.to_string()))?
            .trim()
            .to_string();

        Ok(RemoteSystem { os, arch, hostname })
    }
}

/// Basic facts about the remote host.
#[derive(Debug, Clone)]
pub struct RemoteSystem {
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_with_port() {
        let target = parse_ssh_target("root@10.0.0.5:2222").unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, 2222);
    }

    #[test]
    fn test_parse_target_default_port() {
        let target = parse_ssh_target("admin@host.example").unwrap();
        assert_eq!(target.port, 22);
    }

    #[test]
    fn test_parse_target_rejects_bad_forms() {
        assert!(parse_ssh_target("no-at-sign").is_err());
        assert!(parse_ssh_target("@host").is_err());
        assert!(parse_ssh_target("user@").is_err());
        assert!(parse_ssh_target("user@host:notaport").is_err());
        assert!(parse_ssh_target("user@host:99999").is_err());
    }

    #[test]
    fn test_connect_requires_credentials() {
        let target = SshTarget {
            user: "root".to_string(),
            host: "127.0.0.1".to_string(),
            port: 22,
        };
        let err = SshSession::connect(&target, &SshAuth::default()).unwrap_err();
        assert!(matches!(err, ProvisionError::Connect(_)));
    }
}
