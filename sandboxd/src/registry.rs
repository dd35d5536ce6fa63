//! Server / registry (spec §4.9): a single mutex guarding an insertion-ordered
//! map from sandbox id to sandbox, plus the RPCs built on top of it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sandbox::{SandboxInfo, SandboxState};
use tracing::{info, warn};
use vmrt::network::{NetworkManager, SandboxNetwork};
use vmrt::{Config, SandboxConfig, SandboxHandle, Template};

use crate::error::{ServerError, ServerResult};
use crate::orphan;

struct Entry {
    handle: Arc<SandboxHandle>,
    network: Arc<SandboxNetwork>,
    #[allow(dead_code)]
    start_time: SystemTime,
    clock_sync_cancel: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Guards the live sandbox map. One registry per process.
pub struct Registry {
    config: Arc<Config>,
    network: Arc<tokio::sync::Mutex<NetworkManager>>,
    sandboxes: tokio::sync::Mutex<BTreeMap<String, Entry>>,
}

impl Registry {
    pub fn new(config: Arc<Config>, network: Arc<tokio::sync::Mutex<NetworkManager>>) -> Self {
        Self {
            config,
            network,
            sandboxes: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// `Create`: allocate a network, start the VMM, register the sandbox,
    /// and spawn its watcher task.
    pub async fn create(self: &Arc<Self>, template: &Template, sandbox_id: String) -> ServerResult<SandboxInfo> {
        let cfg = SandboxConfig::derive(&self.config, template, &sandbox_id, None, false, None, Default::default());
        let template_paths = vmrt::TemplatePaths::new(&self.config.data_root, &template.id);

        vmrt::files::ensure_files(&cfg, &template_paths).await?;

        let network = {
            let mgr = self.network.lock().await;
            mgr.allocate(&sandbox_id).await?
        };

        let kernel_path = vmrt::TemplatePaths::host_kernel_file(&self.config.data_root, &template.kernel_version);
        let handle = Arc::new(
            SandboxHandle::start(
                cfg,
                network.env,
                template_paths.image_dir(),
                kernel_path,
                self.config.repurposable_cgroups,
            )
            .await?,
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let host_cloned_ip = network.env.host_cloned_ip();
        let envd_port = self.config.envd_port;
        tokio::spawn(vmrt::ensure_clock_sync(host_cloned_ip, envd_port, rx));

        let info = info_for(&handle, &sandbox_id, Some(network.env.idx), host_cloned_ip);

        let start_time = SystemTime::now();
        self.sandboxes.lock().await.insert(
            sandbox_id.clone(),
            Entry {
                handle: handle.clone(),
                network: network.clone(),
                start_time,
                clock_sync_cancel: Some(tx),
            },
        );

        info!(sandbox_id = %sandbox_id, "sandbox created");
        self.spawn_watcher(sandbox_id, handle, network);
        Ok(info)
    }

    fn spawn_watcher(self: &Arc<Self>, sandbox_id: String, handle: Arc<SandboxHandle>, network: Arc<SandboxNetwork>) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.wait_and_cleanup().await {
                warn!(sandbox_id = %sandbox_id, error = %e, "sandbox exited abnormally");
            }
            let removed = registry.sandboxes.lock().await.remove(&sandbox_id);
            if let Some(entry) = removed
                && let Some(cancel) = entry.clock_sync_cancel
            {
                let _ = cancel.send(());
            }
            let mgr = registry.network.lock().await;
            if let Err(e) = mgr.recycle(&network).await {
                warn!(sandbox_id = %sandbox_id, error = %e, "failed to recycle network");
            }
            drop(mgr);
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
    }

    /// `List(running?, orphan?)`.
    pub async fn list(&self, orphan: bool) -> ServerResult<Vec<SandboxInfo>> {
        if orphan {
            let orphans = orphan::scan().await?;
            return Ok(orphans
                .into_iter()
                .map(|o| SandboxInfo {
                    sandbox_id: o.sandbox_id,
                    pid: Some(o.pid),
                    template_id: Some(o.template_id),
                    kernel_version: None,
                    network_idx: o.network_idx,
                    private_ip: None,
                    enable_diff_snapshot: None,
                    start_time: None,
                    state: SandboxState::Orphan,
                })
                .collect());
        }

        let sandboxes = self.sandboxes.lock().await;
        Ok(sandboxes
            .iter()
            .map(|(id, e)| info_for(&e.handle, id, Some(e.handle.env.idx), e.handle.env.host_cloned_ip()))
            .collect())
    }

    /// `Search(id)`: absence is not an error.
    pub async fn search(&self, id: &str) -> Option<SandboxInfo> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes
            .get(id)
            .map(|e| info_for(&e.handle, id, Some(e.handle.env.idx), e.handle.env.host_cloned_ip()))
    }

    async fn get(&self, id: &str) -> ServerResult<Arc<SandboxHandle>> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| ServerError::NotFound(id.to_string()))
    }

    /// `Delete(id)`: 404 if absent.
    pub async fn delete(&self, id: &str) -> ServerResult<()> {
        self.get(id).await?.stop().await.map_err(Into::into)
    }

    /// `Snapshot(id, delete?)`.
    pub async fn snapshot(&self, id: &str, dir: &std::path::Path, delete: bool) -> ServerResult<()> {
        self.get(id)
            .await?
            .create_snapshot(dir, delete)
            .await
            .map_err(Into::into)
    }

    /// `Deactive(id)`: sample memory before and after, report bytes reclaimed.
    pub async fn deactive(&self, id: &str) -> ServerResult<u64> {
        let handle = self.get(id).await?;
        let before = handle.host_mem_consumption().await?;
        let started = tokio::time::Instant::now();
        handle.deactive().await?;
        let after = handle.host_mem_consumption().await?;
        let reclaimed = before.saturating_sub(after);
        info!(sandbox_id = %id, reclaimed_bytes = reclaimed, elapsed_ms = started.elapsed().as_millis() as u64, "deactivate complete");
        Ok(reclaimed)
    }

    /// `RecreateCgroup()`.
    pub async fn recreate_cgroup(&self) -> ServerResult<()> {
        vmrt::files::recreate_parent_cgroup(&self.config.parent_cgroup)
            .await
            .map_err(Into::into)
    }

    /// `CleanNetworkEnv(indices)`.
    pub async fn clean_network_env(&self, indices: &[u64]) -> ServerResult<()> {
        let mgr = self.network.lock().await;
        let hosts = mgr.hosts();
        let gateway_iface = mgr.gateway_iface().to_string();
        for idx in indices {
            let env = vmrt::NetworkEnv::new(*idx);
            vmrt::network::clean_network_env(&env, &gateway_iface, None, &hosts).await?;
        }
        Ok(())
    }

    /// `Purge(ids | all)`, delegating to the orphan scanner.
    pub async fn purge(&self, ids: Option<&[String]>) -> ServerResult<()> {
        let gateway_iface = self.network.lock().await.gateway_iface().to_string();
        orphan::purge(&self.config, &gateway_iface, ids).await.map_err(Into::into)
    }

    /// `Shutdown()`: stop every sandbox, wait+cleanup each, then clean all
    /// network state.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let handles: Vec<Arc<SandboxHandle>> = {
            let sandboxes = self.sandboxes.lock().await;
            sandboxes.values().map(|e| e.handle.clone()).collect()
        };
        for handle in &handles {
            let _ = handle.stop().await;
        }
        for handle in &handles {
            let _ = handle.wait_and_cleanup().await;
        }
        let mut mgr = self.network.lock().await;
        mgr.cleanup_all().await.map_err(Into::into)
    }
}

fn info_for(handle: &SandboxHandle, id: &str, network_idx: Option<u64>, private_ip: Ipv4Addr) -> SandboxInfo {
    SandboxInfo {
        sandbox_id: id.to_string(),
        pid: None,
        template_id: Some(handle.config.template_id.clone()),
        kernel_version: Some(handle.config.kernel_version.clone()),
        network_idx,
        private_ip: Some(private_ip),
        enable_diff_snapshot: Some(handle.config.enable_diff_snapshot),
        start_time: None,
        state: handle.state(),
    }
}
