// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine adapter over the local Docker daemon.
//!
//! Every operation returns JSON-ready values; the wire layer treats them
//! as opaque bytes. A missing engine is not fatal for the agent, the
//! handlers degrade to error replies.

pub mod handler;

use bollard::container::{
    ListContainersOptions, LogsOptions, RestartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use domcluster_protocol::payload::{ContainerSummary, EngineInfo};

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("container {0} produced no stats")]
    NoStats(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect to the local daemon via its default socket.
    pub fn connect() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// List containers as the wire summary shape.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DockerError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .map(|p| match (p.public_port, p.private_port) {
                        (Some(public), private) => format!("{}->{}", public, private),
                        (None, private) => private.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
                created_at: c.created.map(|t| t.to_string()).unwrap_or_default(),
            })
            .collect())
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(DockerError::from)
    }

    pub async fn stop_container(&self, id: &str, timeout: Option<i64>) -> Result<(), DockerError> {
        let options = timeout.map(|t| StopContainerOptions { t });
        self.docker
            .stop_container(id, options)
            .await
            .map_err(DockerError::from)
    }

    pub async fn restart_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(DockerError::from)
    }

    /// Fetch container logs as one text blob.
    pub async fn logs(&self, id: &str, tail: Option<String>) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            output.push_str(&chunk.to_string());
        }
        Ok(output)
    }

    /// One-shot stats sample.
    pub async fn stats(&self, id: &str) -> Result<serde_json::Value, DockerError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(stats) => Ok(serde_json::to_value(stats?)?),
            None => Err(DockerError::NoStats(id.to_string())),
        }
    }

    pub async fn inspect(&self, id: &str) -> Result<serde_json::Value, DockerError> {
        let inspection = self.docker.inspect_container(id, None).await?;
        Ok(serde_json::to_value(inspection)?)
    }

    /// Engine summary carried in the status report.
    pub async fn engine_info(&self) -> Result<EngineInfo, DockerError> {
        let containers = self.list_containers(true).await?;
        let running_count = containers
            .iter()
            .filter(|c| c.status.to_ascii_lowercase().contains("up"))
            .count();
        debug!(
            total = containers.len(),
            running = running_count,
            "engine info collected"
        );
        Ok(EngineInfo {
            running_count,
            total_count: containers.len(),
            containers,
        })
    }
}
