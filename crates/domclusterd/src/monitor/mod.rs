// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host monitor: builds the status document pushed to the controller.

pub mod query;
pub mod reporter;

use std::sync::{Arc, Mutex};

use sysinfo::System;

use domcluster_protocol::payload::{
    CpuInfo, DiskInfo, EngineInfo, HostInfo, MemoryInfo, NetworkInfo, StatusReport, SystemResources,
};

use crate::docker::DockerClient;

/// Collects host facts and system resources with `sysinfo`, container
/// state through the engine adapter when one is available.
pub struct Monitor {
    system: Mutex<System>,
    docker: Option<Arc<DockerClient>>,
}

impl Monitor {
    pub fn new(docker: Option<Arc<DockerClient>>) -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
            docker,
        }
    }

    /// Build a full status report.
    pub async fn report(&self) -> StatusReport {
        let (host, system) = self.system_snapshot();
        let docker = match &self.docker {
            Some(client) => client.engine_info().await.ok(),
            None => None,
        };

        StatusReport {
            host,
            system,
            docker,
        }
    }

    /// System-resources slice only (resource queries).
    pub fn system_resources(&self) -> SystemResources {
        self.system_snapshot().1
    }

    /// Container-engine slice only (resource queries).
    pub async fn docker_info(&self) -> Option<EngineInfo> {
        match &self.docker {
            Some(client) => client.engine_info().await.ok(),
            None => None,
        }
    }

    fn system_snapshot(&self) -> (HostInfo, SystemResources) {
        let mut system = self.system.lock().expect("monitor lock poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();

        let host = HostInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            num_cpu: system.cpus().len(),
        };

        let total_mem = system.total_memory();
        let used_mem = system.used_memory();
        let memory = MemoryInfo {
            total: total_mem,
            used: used_mem,
            available: system.available_memory(),
            usage_pct: percentage(used_mem, total_mem),
        };

        let cpu = CpuInfo {
            core_count: system.cpus().len(),
            usage_pct: system.global_cpu_usage() as f64,
        };

        let disk = root_disk();
        let network = network_totals();

        (
            host,
            SystemResources {
                cpu,
                memory,
                disk,
                network,
            },
        )
    }
}

fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

/// The disk backing `/`, or the first disk found.
fn root_disk() -> DiskInfo {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().next());

    match disk {
        Some(disk) => {
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            DiskInfo {
                path: disk.mount_point().to_string_lossy().to_string(),
                total,
                used,
                free,
                usage_pct: percentage(used, total),
            }
        }
        None => DiskInfo::default(),
    }
}

/// Byte counters summed over all interfaces.
fn network_totals() -> NetworkInfo {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut rx_bytes = 0;
    let mut tx_bytes = 0;
    for (_, data) in networks.iter() {
        rx_bytes += data.total_received();
        tx_bytes += data.total_transmitted();
    }
    NetworkInfo { rx_bytes, tx_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_has_host_facts() {
        let monitor = Monitor::new(None);
        let report = monitor.report().await;

        assert!(!report.host.hostname.is_empty());
        assert!(report.host.num_cpu > 0);
        assert_eq!(report.host.arch, std::env::consts::ARCH);
        // No engine adapter configured.
        assert!(report.docker.is_none());
    }

    #[tokio::test]
    async fn test_report_memory_is_consistent() {
        let monitor = Monitor::new(None);
        let report = monitor.report().await;

        let memory = &report.system.memory;
        assert!(memory.total > 0);
        assert!(memory.used <= memory.total);
        assert!((0.0..=100.0).contains(&memory.usage_pct));
    }

    #[test]
    fn test_percentage_bounds() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(50, 100), 50.0);
        assert_eq!(percentage(100, 100), 100.0);
    }

    #[tokio::test]
    async fn test_report_serializes_to_wire_document() {
        let monitor = Monitor::new(None);
        let report = monitor.report().await;

        let bytes = serde_json::to_vec(&report).unwrap();
        let round: StatusReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round.host.hostname, report.host.hostname);
    }
}
