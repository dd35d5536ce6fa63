//! Template builder (spec §4.11): turn a container image into the on-disk
//! images (`rootfs`, optional `rootfs-writable`, `memfile`, `snapfile`) a
//! template is restored from.
//!
//! Container interaction is abstracted behind [`ContainerRuntime`] so the
//! pipeline itself never shells out directly; [`DockerRuntime`] is the one
//! concrete adapter, shelling to the `docker` CLI the same way the teacher's
//! `build_rootfs.rs` shells to its build script — explicit argument vectors,
//! never a shell string.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::VmmKind;
use tracing::info;

use vmrt::command::{Privilege, exec};
use vmrt::network::NetworkManager;
use vmrt::template::{Template, TemplateFlags, TemplatePaths};
use vmrt::{Config, SandboxConfig, SandboxHandle};

use crate::error::{ServerError, ServerResult};

/// ext4 images are rounded up to this alignment, matching the VMM's
/// persistent-memory backend requirement.
const PERSISTENT_MEM_ALIGN_BYTES: u64 = 2 * 1024 * 1024;

/// Step 5's stated maximum for the converted rootfs image.
const MAX_ROOTFS_BYTES: u64 = 15 * 1024 * 1024 * 1024;

const GUEST_AGENT_DEST: &str = "usr/local/bin/guest-agent";
const OVERLAY_INIT_DEST: &str = "sbin/overlay-init";
const ENV_FILE_DEST: &str = "etc/sandboxd.env";

/// Grace period the one-shot build VMM is given to run the start command
/// before it is paused and snapshotted.
const BUILD_BOOT_SETTLE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// ContainerRuntime
// ---------------------------------------------------------------------------

pub struct ContainerCreateArgs<'a> {
    pub entrypoint_script: &'a str,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u32>,
    pub pids_limit: Option<u32>,
    pub security_opts: &'a [String],
    pub cap_drop: &'a [String],
}

/// Thin interface over a container-runtime client. The build pipeline never
/// assumes more than pull/create/copy-in/run/copy-out/remove; the non-goal
/// boundary from §1 ("a container runtime's pull/run mechanics are assumed
/// available") means this trait's one job is naming that boundary.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> ServerResult<()>;
    async fn create(&self, image: &str, args: &ContainerCreateArgs<'_>) -> ServerResult<String>;
    async fn cp_to_container(&self, container_id: &str, tar_path: &Path) -> ServerResult<()>;
    async fn start_and_wait(&self, container_id: &str) -> ServerResult<i32>;
    async fn copy_from_container(&self, container_id: &str, dest_tar: &Path) -> ServerResult<()>;
    async fn rm(&self, container_id: &str) -> ServerResult<()>;
}

/// `docker` CLI-backed [`ContainerRuntime`].
pub struct DockerRuntime;

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> ServerResult<()> {
        run_docker(&["pull", image]).await.map(|_| ())
    }

    async fn create(&self, image: &str, args: &ContainerCreateArgs<'_>) -> ServerResult<String> {
        let mut argv: Vec<String> = vec!["create".into(), "--entrypoint".into(), "/bin/sh".into()];
        if let Some(cpus) = args.cpu_limit {
            argv.push("--cpus".into());
            argv.push(cpus.to_string());
        }
        if let Some(mem) = args.memory_limit_mb {
            argv.push("--memory".into());
            argv.push(format!("{mem}m"));
        }
        if let Some(pids) = args.pids_limit {
            argv.push("--pids-limit".into());
            argv.push(pids.to_string());
        }
        for opt in args.security_opts {
            argv.push("--security-opt".into());
            argv.push(opt.clone());
        }
        for cap in args.cap_drop {
            argv.push("--cap-drop".into());
            argv.push(cap.clone());
        }
        argv.push(image.to_string());
        argv.push("-c".into());
        argv.push(args.entrypoint_script.to_string());

        let argv_ref: Vec<&str> = argv.iter().map(String::as_str).collect();
        let id = run_docker(&argv_ref).await?;
        Ok(id.trim().to_string())
    }

    async fn cp_to_container(&self, container_id: &str, tar_path: &Path) -> ServerResult<()> {
        let file = std::fs::File::open(tar_path)
            .map_err(|e| ServerError::Internal(format!("open {}: {e}", tar_path.display())))?;
        let output = tokio::process::Command::new("docker")
            .args(["cp", "-", &format!("{container_id}:/")])
            .stdin(Stdio::from(file))
            .output()
            .await
            .map_err(|e| ServerError::Internal(format!("spawn docker cp: {e}")))?;
        if !output.status.success() {
            return Err(ServerError::Internal(format!(
                "docker cp into container failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn start_and_wait(&self, container_id: &str) -> ServerResult<i32> {
        run_docker(&["start", "-a", container_id]).await?;
        let output = run_docker(&["wait", container_id]).await?;
        output
            .trim()
            .parse::<i32>()
            .map_err(|e| ServerError::Internal(format!("parse exit code {output:?}: {e}")))
    }

    async fn copy_from_container(&self, container_id: &str, dest_tar: &Path) -> ServerResult<()> {
        let file = std::fs::File::create(dest_tar)
            .map_err(|e| ServerError::Internal(format!("create {}: {e}", dest_tar.display())))?;
        let status = tokio::process::Command::new("docker")
            .args(["cp", &format!("{container_id}:/"), "-"])
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .status()
            .await
            .map_err(|e| ServerError::Internal(format!("spawn docker cp: {e}")))?;
        if !status.success() {
            return Err(ServerError::Internal(format!("docker cp from container failed: {status}")));
        }
        Ok(())
    }

    async fn rm(&self, container_id: &str) -> ServerResult<()> {
        run_docker(&["rm", "-f", container_id]).await.map(|_| ())
    }
}

async fn run_docker(args: &[&str]) -> ServerResult<String> {
    let output = tokio::process::Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| ServerError::Internal(format!("spawn docker {}: {e}", args.join(" "))))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(ServerError::Internal(format!(
            "docker {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

// ---------------------------------------------------------------------------
// BuildRequest
// ---------------------------------------------------------------------------

pub struct BuildRequest {
    pub template_id: String,
    pub base_image: String,
    pub vmm_type: VmmKind,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub kernel_version: String,
    pub start_command: Option<String>,
    pub overlay: bool,
    pub huge_pages: bool,
    pub no_pull: bool,
    pub working_dir: Option<String>,
    pub env_file: Option<PathBuf>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u32>,
    pub pids_limit: Option<u32>,
    pub security_opts: Vec<String>,
    pub cap_drop: Vec<String>,
}

fn render_bootstrap_script(req: &BuildRequest) -> String {
    let env_source = if req.env_file.is_some() {
        format!("[ -f /{ENV_FILE_DEST} ] && . /{ENV_FILE_DEST}\n")
    } else {
        String::new()
    };
    let cd = req
        .working_dir
        .as_deref()
        .map(|d| format!("cd {d}\n"))
        .unwrap_or_default();
    let start = req.start_command.as_deref().unwrap_or("/sbin/init");
    format!(
        "set -e\nexport SANDBOX_ENV_ID=\"{}\"\n{env_source}{cd}exec {start}\n",
        req.template_id
    )
}

/// Build the tar stream copied into the container before it runs: the
/// guest-side agent, the overlay-init script (if `overlay`), and an
/// optional environment file.
fn build_input_tar(req: &BuildRequest, guest_agent_path: &Path, overlay_init_path: &Path, dest: &Path) -> ServerResult<()> {
    let file = std::fs::File::create(dest).map_err(|e| ServerError::Internal(format!("create tar: {e}")))?;
    let mut builder = tar::Builder::new(file);

    builder
        .append_path_with_name(guest_agent_path, GUEST_AGENT_DEST)
        .map_err(|e| ServerError::Internal(format!("tar guest agent: {e}")))?;

    if req.overlay {
        builder
            .append_path_with_name(overlay_init_path, OVERLAY_INIT_DEST)
            .map_err(|e| ServerError::Internal(format!("tar overlay-init: {e}")))?;
    }

    if let Some(env_file) = &req.env_file {
        builder
            .append_path_with_name(env_file, ENV_FILE_DEST)
            .map_err(|e| ServerError::Internal(format!("tar env file: {e}")))?;
    }

    builder.finish().map_err(|e| ServerError::Internal(format!("finish tar: {e}")))
}

fn align_up(size: u64, align: u64) -> u64 {
    size.div_ceil(align) * align
}

/// Create an empty ext4 image of exactly `size_bytes` (already aligned).
async fn create_ext4_image(path: &Path, size_bytes: u64) -> ServerResult<()> {
    tokio::fs::File::create(path)
        .await
        .map_err(|e| ServerError::Internal(format!("create {}: {e}", path.display())))?
        .set_len(size_bytes)
        .await
        .map_err(|e| ServerError::Internal(format!("truncate {}: {e}", path.display())))?;

    let output = tokio::process::Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(path)
        .output()
        .await
        .map_err(|e| ServerError::Internal(format!("spawn mkfs.ext4: {e}")))?;
    if !output.status.success() {
        return Err(ServerError::Internal(format!(
            "mkfs.ext4 {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Step 5: stream `tar_path`'s contents into a fresh ext4 image, capped at
/// [`MAX_ROOTFS_BYTES`] and aligned to [`PERSISTENT_MEM_ALIGN_BYTES`].
async fn convert_tar_to_ext4(tar_path: &Path, image_path: &Path) -> ServerResult<()> {
    let tar_len = tokio::fs::metadata(tar_path)
        .await
        .map_err(|e| ServerError::Internal(format!("stat tar: {e}")))?
        .len();
    // tar entries are padded and ext4 carries its own metadata overhead; a
    // flat 25% headroom keeps small images usable without chasing an exact
    // fit.
    let target = align_up(tar_len + tar_len / 4, PERSISTENT_MEM_ALIGN_BYTES);
    if target > MAX_ROOTFS_BYTES {
        return Err(ServerError::Internal(format!(
            "converted rootfs would be {target} bytes, exceeding the {MAX_ROOTFS_BYTES} byte maximum"
        )));
    }

    create_ext4_image(image_path, target).await?;

    let mount_dir = tempfile::tempdir().map_err(|e| ServerError::Internal(format!("tempdir: {e}")))?;
    let mount_str = mount_dir.path().to_string_lossy().to_string();
    let image_str = image_path.to_string_lossy().to_string();
    let tar_str = tar_path.to_string_lossy().to_string();

    exec("mount", &["-o", "loop", &image_str, &mount_str], Privilege::Sudo)
        .await
        .map_err(|e| ServerError::Internal(format!("mount loop: {e}")))?;

    let extract_result = exec("tar", &["-xpf", &tar_str, "-C", &mount_str], Privilege::Sudo).await;

    let umount_result = exec("umount", &[&mount_str], Privilege::Sudo).await;

    extract_result.map_err(|e| ServerError::Internal(format!("extract rootfs tar: {e}")))?;
    umount_result.map_err(|e| ServerError::Internal(format!("umount: {e}")))?;
    Ok(())
}

/// Step 6 (overlay branch): second writable ext4 image of `disk_mb`.
async fn create_writable_overlay(path: &Path, disk_mb: u32) -> ServerResult<()> {
    let size = align_up(u64::from(disk_mb) * 1024 * 1024, PERSISTENT_MEM_ALIGN_BYTES);
    create_ext4_image(path, size).await
}

/// Step 6 (non-overlay branch): grow the single rootfs image in place by
/// `disk_mb`, clearing the read-only feature bit first.
async fn grow_rootfs_in_place(path: &Path, current_size: u64, disk_mb: u32) -> ServerResult<()> {
    let path_str = path.to_string_lossy().to_string();
    exec("tune2fs", &["-O", "^read-only", &path_str], Privilege::Sudo)
        .await
        .map_err(|e| ServerError::Internal(format!("tune2fs: {e}")))?;

    let new_size = align_up(current_size + u64::from(disk_mb) * 1024 * 1024, PERSISTENT_MEM_ALIGN_BYTES);
    tokio::fs::File::open(path)
        .await
        .map_err(|e| ServerError::Internal(format!("open {}: {e}", path.display())))?
        .set_len(new_size)
        .await
        .map_err(|e| ServerError::Internal(format!("truncate {}: {e}", path.display())))?;

    exec("resize2fs", &[&path_str], Privilege::Sudo)
        .await
        .map_err(|e| ServerError::Internal(format!("resize2fs: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// TemplateBuilder
// ---------------------------------------------------------------------------

pub struct TemplateBuilder {
    config: Arc<Config>,
    network: Arc<tokio::sync::Mutex<NetworkManager>>,
    runtime: Arc<dyn ContainerRuntime>,
    guest_agent_path: PathBuf,
    overlay_init_path: PathBuf,
}

impl TemplateBuilder {
    pub fn new(
        config: Arc<Config>,
        network: Arc<tokio::sync::Mutex<NetworkManager>>,
        runtime: Arc<dyn ContainerRuntime>,
        guest_agent_path: PathBuf,
        overlay_init_path: PathBuf,
    ) -> Self {
        Self {
            config,
            network,
            runtime,
            guest_agent_path,
            overlay_init_path,
        }
    }

    pub async fn build(&self, req: BuildRequest) -> ServerResult<Template> {
        let lock_path = self.config.data_root.join("locks").join(format!("{}.build", req.template_id));
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::Internal(format!("mkdir locks dir: {e}")))?;
        }
        let _guard = crate::lock::acquire(lock_path).await?;

        if !req.no_pull {
            info!(image = %req.base_image, "pulling base image");
            self.runtime.pull(&req.base_image).await?;
        }

        let script = render_bootstrap_script(&req);
        let container_id = self
            .runtime
            .create(
                &req.base_image,
                &ContainerCreateArgs {
                    entrypoint_script: &script,
                    cpu_limit: req.cpu_limit,
                    memory_limit_mb: req.memory_limit_mb,
                    pids_limit: req.pids_limit,
                    security_opts: &req.security_opts,
                    cap_drop: &req.cap_drop,
                },
            )
            .await?;
        info!(container_id = %container_id, "container created");

        let result = self.run_container_pipeline(&req, &container_id).await;
        let _ = self.runtime.rm(&container_id).await;
        result
    }

    async fn run_container_pipeline(&self, req: &BuildRequest, container_id: &str) -> ServerResult<Template> {
        let work_dir = tempfile::tempdir().map_err(|e| ServerError::Internal(format!("tempdir: {e}")))?;
        let input_tar = work_dir.path().join("input.tar");
        build_input_tar(req, &self.guest_agent_path, &self.overlay_init_path, &input_tar)?;
        self.runtime.cp_to_container(container_id, &input_tar).await?;

        let exit_code = self.runtime.start_and_wait(container_id).await?;
        if exit_code != 0 {
            return Err(ServerError::Internal(format!(
                "container exited with status {exit_code}"
            )));
        }

        let output_tar = work_dir.path().join("output.tar");
        self.runtime.copy_from_container(container_id, &output_tar).await?;

        let staging_dir = work_dir.path().join("staging");
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| ServerError::Internal(format!("mkdir staging: {e}")))?;

        let rootfs_path = staging_dir.join("rootfs");
        convert_tar_to_ext4(&output_tar, &rootfs_path).await?;

        if req.overlay {
            let writable_path = staging_dir.join("rootfs-writable");
            create_writable_overlay(&writable_path, req.disk_mb).await?;
        } else {
            let current_size = tokio::fs::metadata(&rootfs_path)
                .await
                .map_err(|e| ServerError::Internal(format!("stat rootfs: {e}")))?
                .len();
            grow_rootfs_in_place(&rootfs_path, current_size, req.disk_mb).await?;
        }

        let template = Template {
            id: req.template_id.clone(),
            vmm_type: req.vmm_type,
            vcpu: req.vcpu,
            memory_mb: req.memory_mb,
            disk_mb: req.disk_mb,
            kernel_version: req.kernel_version.clone(),
            start_command: req.start_command.clone(),
            flags: TemplateFlags {
                overlay: req.overlay,
                huge_pages: req.huge_pages,
                no_pull: req.no_pull,
            },
            base_image: req.base_image.clone(),
            created_at: chrono::Utc::now(),
        };
        template.validate().map_err(|e| ServerError::Internal(e.to_string()))?;

        self.boot_once_and_snapshot(&template, &staging_dir).await?;

        let final_paths = TemplatePaths::new(&self.config.data_root, &template.id);
        if final_paths.dir().exists() {
            tokio::fs::remove_dir_all(final_paths.dir())
                .await
                .map_err(|e| ServerError::Internal(format!("remove existing template dir: {e}")))?;
        }
        if let Some(parent) = final_paths.dir().parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::Internal(format!("mkdir templates dir: {e}")))?;
        }
        tokio::fs::rename(&staging_dir, final_paths.dir())
            .await
            .map_err(|e| ServerError::Internal(format!("rename staging dir: {e}")))?;

        template.save(&self.config.data_root).await.map_err(ServerError::from)?;
        Ok(template)
    }

    /// Step 7: boot the VMM once against the staged images with a dummy
    /// network (tap device only, no host routing/NAT/FORWARD rules), let the
    /// start command run, pause, and snapshot into the staging directory.
    async fn boot_once_and_snapshot(&self, template: &Template, staging_dir: &Path) -> ServerResult<()> {
        let build_sandbox_id = format!("build-{}", template.id);
        let cfg = SandboxConfig::derive(&self.config, template, &build_sandbox_id, None, false, None, Default::default());
        let rootfs = staging_dir.join("rootfs");
        let rootfs_writable = template.flags.overlay.then(|| staging_dir.join("rootfs-writable"));
        vmrt::files::stage_instance_files(&cfg, &rootfs, rootfs_writable.as_deref())
            .await
            .map_err(ServerError::from)?;

        let network = {
            let mgr = self.network.lock().await;
            mgr.allocate_dummy(&build_sandbox_id).await.map_err(ServerError::from)?
        };

        let kernel_path = TemplatePaths::host_kernel_file(&self.config.data_root, &template.kernel_version);
        let handle = SandboxHandle::start_fresh(cfg, network.env, kernel_path, self.config.repurposable_cgroups)
            .await
            .map_err(ServerError::from);

        let outcome: ServerResult<()> = async {
            let handle = handle?;
            tokio::time::sleep(BUILD_BOOT_SETTLE).await;
            handle
                .create_snapshot(staging_dir, true)
                .await
                .map_err(ServerError::from)?;
            handle.wait_and_cleanup().await.map_err(ServerError::from)
        }
        .await;

        let mgr = self.network.lock().await;
        let _ = mgr.recycle(&network).await;
        drop(mgr);

        outcome
    }
}
