//! VMM supervisor (spec §4.7) and sandbox state machine (spec §4.8).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sandbox::{Hypervisor, Result, SandboxError, SandboxState, TeardownErrors};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::SandboxConfig;
use crate::netenv::NetworkEnv;
use crate::process::kill_process_group;
use crate::{files, hypervisor};

const API_READY_TIMEOUT: Duration = Duration::from_secs(5);
const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(10);

fn state_to_u8(s: SandboxState) -> u8 {
    match s {
        SandboxState::Running => 0,
        SandboxState::Snapshotting => 1,
        SandboxState::Stop => 2,
        SandboxState::Cleaning => 3,
        SandboxState::Invalid => 4,
        SandboxState::Orphan => 5,
    }
}

fn u8_to_state(v: u8) -> SandboxState {
    match v {
        0 => SandboxState::Running,
        1 => SandboxState::Snapshotting,
        2 => SandboxState::Stop,
        3 => SandboxState::Cleaning,
        4 => SandboxState::Invalid,
        _ => SandboxState::Orphan,
    }
}

/// A running VMM supervised as a child process, plus the sandbox's lifecycle
/// state and the resources that need tearing down once it exits.
pub struct SandboxHandle {
    pub config: SandboxConfig,
    pub env: NetworkEnv,
    pub private_ip: Ipv4Addr,
    hypervisor: Box<dyn Hypervisor>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    state: Arc<AtomicU8>,
    waited: tokio::sync::OnceCell<std::result::Result<(), String>>,
    cleaned: tokio::sync::OnceCell<()>,
}

impl SandboxHandle {
    /// Spawn the supervisor process, wait for the control socket, and bring
    /// the VM up from `template_image_dir` (spec §4.7).
    pub async fn start(
        config: SandboxConfig,
        env: NetworkEnv,
        template_image_dir: PathBuf,
        kernel_path: PathBuf,
        repurposable_cgroups: bool,
    ) -> Result<Self> {
        let (mut child, adapter) = Self::spawn_supervisor(&config, env, kernel_path, repurposable_cgroups).await?;

        if let Err(e) = adapter.restore(&template_image_dir).await {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }
        if config.vmm_type == sandbox::VmmKind::CloudHypervisor
            && let Err(e) = adapter.resume().await
        {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }

        Ok(Self::from_parts(config, env, adapter, child))
    }

    /// Spawn the supervisor and configure+cold-boot a VM from the sandbox's
    /// own rootfs instead of restoring a snapshot. Used only by the template
    /// builder's one-shot pre-snapshot boot (spec §4.11 step 7); ordinary
    /// sandboxes are always restored from a pre-built template.
    pub async fn start_fresh(
        config: SandboxConfig,
        env: NetworkEnv,
        kernel_path: PathBuf,
        repurposable_cgroups: bool,
    ) -> Result<Self> {
        let (mut child, adapter) = Self::spawn_supervisor(&config, env, kernel_path, repurposable_cgroups).await?;

        if let Err(e) = adapter.configure().await {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }
        if let Err(e) = adapter.start().await {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }

        Ok(Self::from_parts(config, env, adapter, child))
    }

    fn from_parts(
        config: SandboxConfig,
        env: NetworkEnv,
        hypervisor: Box<dyn Hypervisor>,
        child: tokio::process::Child,
    ) -> Self {
        let private_ip = env.guest_ip();
        Self {
            config,
            env,
            private_ip,
            hypervisor,
            child: tokio::sync::Mutex::new(Some(child)),
            state: Arc::new(AtomicU8::new(state_to_u8(SandboxState::Running))),
            waited: tokio::sync::OnceCell::new(),
            cleaned: tokio::sync::OnceCell::new(),
        }
    }

    /// Spawn the `unshare`-wrapped VMM supervisor, place it in its cgroup,
    /// forward its stdio, and block until its control socket answers.
    async fn spawn_supervisor(
        config: &SandboxConfig,
        env: NetworkEnv,
        kernel_path: PathBuf,
        repurposable_cgroups: bool,
    ) -> Result<(tokio::process::Child, Box<dyn Hypervisor>)> {
        let netns_name = env.netns_name();
        let private_dir = config.private_dir.to_string_lossy().to_string();
        let private_kernel_dir = config.private_kernel_dir.to_string_lossy().to_string();
        let binary = config.hypervisor_binary_path.to_string_lossy().to_string();
        let sock = config.vmm_socket_path.to_string_lossy().to_string();
        let instance_dir = config.instance_dir.to_string_lossy().to_string();
        let host_kernel_dir = config.host_kernel_dir.to_string_lossy().to_string();

        // Positional args ($1..$N), never interpolated into the script body,
        // to avoid shell injection from any path/name component.
        let script = "bind_mount() { mount --bind \"$1\" \"$2\"; } && \
            bind_mount \"$1\" \"$2\" && bind_mount \"$3\" \"$4\" && \
            exec ip netns exec \"$5\" \"$6\" --api-sock \"$7\"";

        let mut cmd = Command::new("unshare");
        cmd.args(["-pfm", "--kill-child", "--", "bash", "-c", script, "bash"])
            .arg(&instance_dir)
            .arg(&private_dir)
            .arg(&host_kernel_dir)
            .arg(&private_kernel_dir)
            .arg(&netns_name)
            .arg(&binary)
            .arg(&sock)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Internal(format!("spawn supervisor: {e}")))?;

        if !repurposable_cgroups {
            if let Some(pid) = child.id() {
                let cgroup_procs = config.cgroup_dir.join("cgroup.procs");
                if let Err(e) = tokio::fs::write(&cgroup_procs, pid.to_string()).await {
                    warn!(sandbox_id = %config.sandbox_id, error = %e, "failed to place pid in cgroup");
                }
            }
        }

        forward_stream(child.stdout.take(), &config.sandbox_id, "stdout");
        forward_stream(child.stderr.take(), &config.sandbox_id, "stderr");

        if let Err(e) =
            hypervisor::UdsHttpClient::wait_ready(&config.vmm_socket_path, API_READY_TIMEOUT).await
        {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }

        let adapter = hypervisor::build(config.clone(), env, kernel_path);
        Ok((child, adapter))
    }

    pub fn state(&self) -> SandboxState {
        u8_to_state(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(
                state_to_u8(from),
                state_to_u8(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Stop` (spec §4.8): requires `Running`, SIGKILL the VMM.
    pub async fn stop(&self) -> Result<()> {
        if !self.transition(SandboxState::Running, SandboxState::Stop) {
            return Err(SandboxError::InvalidState {
                expected: "running".into(),
                actual: self.state().to_string(),
            });
        }
        let guard = self.child.lock().await;
        if let Some(child) = guard.as_ref() {
            kill_process_group(child);
        }
        Ok(())
    }

    /// `CreateSnapshot` (spec §4.8).
    pub async fn create_snapshot(&self, dir: &std::path::Path, terminate: bool) -> Result<()> {
        if !self.transition(SandboxState::Running, SandboxState::Snapshotting) {
            return Err(SandboxError::InvalidState {
                expected: "running".into(),
                actual: self.state().to_string(),
            });
        }

        let result: Result<()> = async {
            self.hypervisor.pause().await?;
            self.hypervisor.snapshot(dir).await?;
            if terminate {
                let guard = self.child.lock().await;
                if let Some(child) = guard.as_ref() {
                    kill_process_group(child);
                }
            } else {
                self.hypervisor.resume().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let target = if terminate {
                    SandboxState::Stop
                } else {
                    SandboxState::Running
                };
                self.state.store(state_to_u8(target), Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(state_to_u8(SandboxState::Invalid), Ordering::Release);
                Err(e)
            }
        }
    }

    /// `Deactive` (spec §4.8): no state transition.
    pub async fn deactive(&self) -> Result<()> {
        files::reclaim_memory(&self.config).await
    }

    /// `HostMemConsumption` (spec §4.8): read-only, valid in any state.
    pub async fn host_mem_consumption(&self) -> Result<u64> {
        files::host_mem_consumption(&self.config).await
    }

    /// Join the once-wait with once-cleanup (spec §4.8 `WaitAndCleanup`).
    pub async fn wait_and_cleanup(&self) -> Result<()> {
        let wait_result = self
            .waited
            .get_or_init(|| async {
                let mut guard = self.child.lock().await;
                if let Some(mut child) = guard.take() {
                    match child.wait().await {
                        Ok(status) if is_expected_sigkill_exit(status) => Ok(()),
                        Ok(status) => Err(format!("unexpected exit status: {status}")),
                        Err(e) => Err(format!("wait failed: {e}")),
                    }
                } else {
                    Ok(())
                }
            })
            .await
            .clone();

        let keep_instance_dir = wait_result.is_err();
        if wait_result.is_ok() {
            self.state
                .store(state_to_u8(SandboxState::Stop), Ordering::Release);
        } else {
            self.state
                .store(state_to_u8(SandboxState::Invalid), Ordering::Release);
        }

        self.cleaned
            .get_or_init(|| async {
                if let Err(e) = files::cleanup_files(&self.config, keep_instance_dir).await {
                    error!(sandbox_id = %self.config.sandbox_id, error = %e, "cleanup_files failed");
                }
                if let Err(e) = self.hypervisor.cleanup().await {
                    error!(sandbox_id = %self.config.sandbox_id, error = %e, "hypervisor cleanup failed");
                }
            })
            .await;

        wait_result.map_err(SandboxError::Internal)
    }
}

fn is_expected_sigkill_exit(status: std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32)
}

fn forward_stream(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    sandbox_id: &str,
    stream_name: &'static str,
) {
    let Some(pipe) = pipe else { return };
    let sandbox_id = sandbox_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(sandbox_id = %sandbox_id, stream = stream_name, "{line}");
        }
    });
}

/// Background task: POST to `http://{host_cloned_ip}:{envd_port}/sync` every
/// 10s (or immediately) until success or cancellation (spec §4.8
/// `EnsureClockSync`). `cancel` resolves when the watcher should stop,
/// e.g. on sandbox teardown. Reuses one `reqwest::Client` across attempts so
/// retries reuse the underlying TCP connection instead of reconnecting.
pub async fn ensure_clock_sync(
    host_cloned_ip: Ipv4Addr,
    envd_port: u16,
    mut cancel: tokio::sync::oneshot::Receiver<()>,
) {
    let url = format!("http://{host_cloned_ip}:{envd_port}/sync");
    let client = reqwest::Client::new();
    loop {
        tokio::select! {
            result = post_sync(&client, &url) => {
                match result {
                    Ok(()) => return,
                    Err(e) => warn!(url = %url, error = %e, "clock sync attempt failed, retrying"),
                }
            }
            _ = &mut cancel => return,
        }
        tokio::select! {
            _ = tokio::time::sleep(CLOCK_SYNC_INTERVAL) => {}
            _ = &mut cancel => return,
        }
    }
}

/// Issue one `POST {url}` and drain the response body so the connection
/// returns to `client`'s pool for reuse by the next attempt.
async fn post_sync(client: &reqwest::Client, url: &str) -> std::result::Result<(), reqwest::Error> {
    let resp = client.post(url).send().await?.error_for_status()?;
    let _ = resp.bytes().await?;
    Ok(())
}

/// Aggregate teardown for a sandbox whose VMM process is already gone
/// (orphan purge, forced shutdown) but whose files/cgroup still need release.
pub async fn force_teardown(config: &SandboxConfig) -> Result<()> {
    let mut errs = TeardownErrors::new();
    if let Err(e) = files::cleanup_files(config, false).await {
        errs.push("cleanup_files", e);
    }
    errs.into_result()
}
