// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    d8rctl::cli::run().await
}
