// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local shell executor for pushed `shell_exec` commands.
//!
//! Output streams back as `command_output` frames (one per captured
//! channel), followed by a terminal `command_result`.

use std::sync::Arc;

use tracing::info;

use domcluster_protocol::payload::{cmd, CommandOutputPayload, CommandResultPayload, PushedCommand};

use crate::manager::{AgentError, ConnectionManager, Outbound};

/// Register the `shell_exec` handler.
pub fn register_shell_handler(manager: &Arc<ConnectionManager>) {
    manager.register_handler(
        cmd::SHELL_EXEC,
        Arc::new(|frame, outbound| {
            Box::pin(async move {
                let pushed: PushedCommand = serde_json::from_slice(&frame.data)?;
                let PushedCommand::ShellExec { command } = pushed else {
                    return Err(AgentError::Handler("malformed shell_exec".to_string()));
                };
                execute(&outbound, &frame.req_id, &command).await
            })
        }),
    );
}

async fn execute(outbound: &Outbound, req_id: &str, command: &str) -> Result<(), AgentError> {
    info!(command, "executing shell command");

    let output = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            let result = CommandResultPayload {
                exit_code: -1,
                error: Some(e.to_string()),
            };
            return outbound
                .send(cmd::COMMAND_RESULT, req_id, serde_json::to_vec(&result)?)
                .await;
        }
    };

    if !output.stdout.is_empty() {
        let payload = CommandOutputPayload {
            kind: "stdout".to_string(),
            output: String::from_utf8_lossy(&output.stdout).to_string(),
        };
        outbound
            .send(cmd::COMMAND_OUTPUT, req_id, serde_json::to_vec(&payload)?)
            .await?;
    }
    if !output.stderr.is_empty() {
        let payload = CommandOutputPayload {
            kind: "stderr".to_string(),
            output: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        outbound
            .send(cmd::COMMAND_OUTPUT, req_id, serde_json::to_vec(&payload)?)
            .await?;
    }

    let result = CommandResultPayload {
        exit_code: output.status.code().unwrap_or(-1),
        error: None,
    };
    outbound
        .send(cmd::COMMAND_RESULT, req_id, serde_json::to_vec(&result)?)
        .await
}
