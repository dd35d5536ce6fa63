use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{Hypervisor, Result, SandboxError};
use serde_json::json;

use super::client::UdsHttpClient;
use crate::config::SandboxConfig;
use crate::netenv::NetworkEnv;

pub struct FirecrackerHypervisor {
    client: UdsHttpClient,
    cfg: SandboxConfig,
    env: NetworkEnv,
    kernel_path: PathBuf,
}

impl FirecrackerHypervisor {
    pub fn new(cfg: SandboxConfig, env: NetworkEnv, kernel_path: PathBuf) -> Self {
        let client = UdsHttpClient::new(cfg.vmm_socket_path.clone());
        Self {
            client,
            cfg,
            env,
            kernel_path,
        }
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .request("PUT", path, Some(&body.to_string()))
            .await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "PUT {path}: {} {}",
                resp.status, resp.body
            )))
        }
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn configure(&self) -> Result<()> {
        self.put(
            "/boot-source",
            json!({
                "kernel_image_path": self.kernel_path,
                "boot_args": "console=ttyS0 reboot=k panic=1",
            }),
        )
        .await?;

        self.put(
            "/drives/rootfs",
            json!({
                "drive_id": "rootfs",
                "path_on_host": self.cfg.instance_dir.join("rootfs"),
                "is_root_device": true,
                "is_read_only": !self.cfg.overlay,
            }),
        )
        .await?;

        self.put(
            "/network-interfaces/eth0",
            json!({
                "iface_id": "eth0",
                "guest_mac": "AA:FC:00:00:00:01",
                "host_dev_name": self.env.tap_name(),
            }),
        )
        .await?;

        self.put(
            "/machine-config",
            json!({
                "vcpu_count": self.cfg.vcpu,
                "mem_size_mib": self.cfg.memory_mb,
            }),
        )
        .await?;

        self.put(
            "/mmds/config",
            json!({
                "version": "V2",
                "network_interfaces": ["eth0"],
            }),
        )
        .await?;

        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let resp = self
            .client
            .request(
                "PUT",
                "/actions",
                Some(&json!({"action_type": "InstanceStart"}).to_string()),
            )
            .await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "InstanceStart: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn pause(&self) -> Result<()> {
        let resp = self
            .client
            .request("PATCH", "/vm", Some(&json!({"state": "Paused"}).to_string()))
            .await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "pause: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn resume(&self) -> Result<()> {
        let resp = self
            .client
            .request("PATCH", "/vm", Some(&json!({"state": "Resumed"}).to_string()))
            .await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "resume: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn restore(&self, snapshot_dir: &Path) -> Result<()> {
        self.put(
            "/snapshot/load",
            json!({
                "snapshot_path": snapshot_dir.join("snapfile"),
                "mem_backend": {
                    "backend_path": snapshot_dir.join("memfile"),
                    "backend_type": "File",
                },
                "resume_vm": false,
            }),
        )
        .await?;

        // PutMmds: reseed metadata so guest-visible MMDS state is fresh
        // after a restore (snapshot state reloads the old values verbatim).
        self.put("/mmds", json!({})).await
    }

    async fn snapshot(&self, dir: &Path) -> Result<()> {
        self.put(
            "/snapshot/create",
            json!({
                "snapshot_path": dir.join("snapfile"),
                "mem_file_path": dir.join("memfile"),
            }),
        )
        .await
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
