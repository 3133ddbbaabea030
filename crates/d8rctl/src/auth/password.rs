// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Web-UI password management.
//!
//! One password per controller, stored as a sha-256 hex digest in a 0600
//! file. The clear text is logged exactly once at generation time and is
//! not recoverable afterwards. Verification re-reads the file so a reset
//! takes effect instantly even across processes.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, warn};

const PASSWORD_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("password generation failed")]
    Generation,
}

pub struct PasswordManager {
    path: PathBuf,
}

impl PasswordManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored hash, generating and persisting a fresh password on
    /// first run. The generated clear password is logged once.
    pub fn init(&self) -> Result<(), PasswordError> {
        if self.path.exists() {
            return Ok(());
        }

        let password = generate_password();
        self.store_hash(&hash_password(&password))?;

        warn!("========================================");
        warn!("INITIAL PASSWORD: {}", password);
        warn!("Save this password to access the web interface");
        warn!("Use 'd8rctl password reset' to replace it later");
        warn!("========================================");

        Ok(())
    }

    /// Compare the submitted password against the on-disk hash. The file is
    /// re-read on every call so a reset is effective immediately.
    pub fn verify(&self, password: &str) -> bool {
        let stored = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to read password hash");
                return false;
            }
        };
        hash_password(password) == stored.trim()
    }

    /// Replace the stored hash with one for a freshly generated password.
    /// Returns the clear password for display to the operator.
    pub fn reset(&self) -> Result<String, PasswordError> {
        let password = generate_password();
        self.store_hash(&hash_password(&password))?;
        warn!("Password reset. New password: {}", password);
        Ok(password)
    }

    fn store_hash(&self, hash: &str) -> Result<(), PasswordError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(hash.as_bytes())?;
        Ok(())
    }
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    hex::encode(digest)
}

fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    encoded[..PASSWORD_LEN].to_string()
}
