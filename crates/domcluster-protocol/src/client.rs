// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client helpers for the agent side of the publish protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::frame::FrameError;

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct ClusterClientConfig {
    /// Controller address to connect to
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Verify the controller certificate against system roots.
    /// Disabled by default; the fleet runs with self-signed controller certs.
    pub verify_certificate: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:50051".parse().unwrap(),
            server_name: "localhost".to_string(),
            verify_certificate: false,
            keep_alive_interval_ms: 5_000,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC client holding at most one live connection to the controller.
pub struct ClusterClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: ClusterClientConfig,
}

impl ClusterClient {
    /// Create a new client with the given configuration
    pub fn new(config: ClusterClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    fn build_client_config(config: &ClusterClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.verify_certificate {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .unwrap(),
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Io(std::io::Error::other(e.to_string())))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to the controller, reusing a still-open connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard {
            if conn.close_reason().is_none() {
                debug!("reusing existing connection");
                return Ok(());
            }
        }

        info!(addr = %self.config.server_addr, "connecting to controller");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        info!("connected to controller");
        *conn_guard = Some(connection);
        Ok(())
    }

    /// Open the publish stream on the current connection, connecting first
    /// if necessary. The returned halves stay valid until the connection
    /// drops; the manager owns reconnection.
    pub async fn open_publish_stream(&self) -> Result<(SendStream, RecvStream), ClientError> {
        self.connect().await?;
        let conn = {
            let guard = self.connection.lock().await;
            guard.clone().ok_or(ClientError::NotConnected)?
        };
        Ok(conn.open_bi().await?)
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    /// Check if the client is currently connected
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        match *conn_guard {
            Some(ref conn) => conn.close_reason().is_none(),
            None => false,
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock() {
            if let Some(conn) = guard.take() {
                conn.close(0u32.into(), b"client dropped");
            }
        }
    }
}

/// Certificate verifier that accepts any controller certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:50051".parse().unwrap());
        assert_eq!(config.server_name, "localhost");
        assert!(!config.verify_certificate);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = ClusterClient::new(ClusterClientConfig::default());
        assert!(client.is_ok(), "{:?}", client.err());
    }

    #[tokio::test]
    async fn test_client_initial_not_connected() {
        let client = ClusterClient::new(ClusterClientConfig::default()).unwrap();
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_client_connect_timeout() {
        let config = ClusterClientConfig {
            server_addr: "127.0.0.1:59998".parse().unwrap(),
            connect_timeout_ms: 100,
            ..Default::default()
        };
        let client = ClusterClient::new(config).unwrap();
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_client_close_without_connection() {
        let client = ClusterClient::new(ClusterClientConfig::default()).unwrap();
        client.close().await;
        assert!(!client.is_connected().await);
    }

    #[test]
    fn test_build_client_config_both_modes() {
        let insecure = ClusterClientConfig::default();
        assert!(ClusterClient::build_client_config(&insecure).is_ok());

        let verified = ClusterClientConfig {
            verify_certificate: true,
            ..Default::default()
        };
        assert!(ClusterClient::build_client_config(&verified).is_ok());
    }
}
