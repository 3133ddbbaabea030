// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }

    // Compile the publish protocol (shared by d8rctl and domclusterd)
    prost_build::compile_protos(&["proto/domcluster.proto"], &["proto/"])?;

    Ok(())
}
