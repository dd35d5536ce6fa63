use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{Hypervisor, Result, SandboxError};
use serde_json::json;

use super::client::UdsHttpClient;
use crate::config::SandboxConfig;
use crate::netenv::NetworkEnv;

pub struct CloudHypervisorHypervisor {
    client: UdsHttpClient,
    cfg: SandboxConfig,
    env: NetworkEnv,
    kernel_path: PathBuf,
}

impl CloudHypervisorHypervisor {
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

    /// Disk entries: one rootfs image, or rootfs-ro + rootfs-rw when the
    /// template carries an overlay.
    fn disks(&self) -> Vec<serde_json::Value> {
        let rootfs = self.cfg.instance_dir.join("rootfs");
        if self.cfg.overlay {
            let readonly = self.cfg.instance_dir.join("rootfs-ro");
            vec![
                json!({"path": readonly, "readonly": true}),
                json!({"path": rootfs, "readonly": false}),
            ]
        } else {
            vec![json!({"path": rootfs, "readonly": false})]
        }
    }
}

#[async_trait]
impl Hypervisor for CloudHypervisorHypervisor {
    async fn configure(&self) -> Result<()> {
        self.put(
            "/vm.create",
            json!({
                "kernel": {"path": self.kernel_path},
                "cmdline": {"args": "console=ttyS0 reboot=k panic=1"},
                "disks": self.disks(),
                "net": [{
                    "tap": self.env.tap_name(),
                    "mac": "AA:FC:00:00:00:01",
                }],
                "cpus": {"boot_vcpus": self.cfg.vcpu, "max_vcpus": self.cfg.vcpu},
                "memory": {"size": u64::from(self.cfg.memory_mb) * 1024 * 1024},
            }),
        )
        .await
    }

    async fn start(&self) -> Result<()> {
        let resp = self.client.request("PUT", "/vm.boot", None).await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "vm.boot: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn pause(&self) -> Result<()> {
        let resp = self.client.request("PUT", "/vm.pause", None).await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "vm.pause: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn resume(&self) -> Result<()> {
        let resp = self.client.request("PUT", "/vm.resume", None).await?;
        if super::client::is_success(resp.status) {
            Ok(())
        } else {
            Err(SandboxError::HypervisorRequest(format!(
                "vm.resume: {} {}",
                resp.status, resp.body
            )))
        }
    }

    async fn restore(&self, snapshot_dir: &Path) -> Result<()> {
        // Restores paused; the caller issues the follow-up `resume` per the
        // `Hypervisor::restore` contract.
        self.put(
            "/vm.restore",
            json!({
                "source_url": format!("file://{}", snapshot_dir.display()),
            }),
        )
        .await
    }

    async fn snapshot(&self, dir: &Path) -> Result<()> {
        self.put(
            "/vm.snapshot",
            json!({
                "destination_url": format!("file://{}", dir.display()),
            }),
        )
        .await
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
