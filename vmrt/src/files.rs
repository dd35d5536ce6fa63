//! Sandbox files & cgroup provisioning (spec §4.5).

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use sandbox::{Result, SandboxError, TeardownErrors};
use tokio::process::Command;
use tracing::warn;

use crate::command::{Privilege, exec};
use crate::config::SandboxConfig;

const RMDIR_RETRY_BACKOFFS_MS: [u64; 3] = [200, 500, 1500];

/// Copy-on-write clone of `src` to `dst` via `cp --reflink=always`, falling
/// back to a plain hardlink-or-copy is the caller's choice, not this
/// function's — reflink failure here is always reported, never silently
/// downgraded to a full copy (that would double the disk footprint the
/// reflink exists to avoid).
async fn reflink(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let output = Command::new("cp")
        .args(["--reflink=always", "--"])
        .arg(src)
        .arg(dst)
        .output()
        .await
        .map_err(|e| SandboxError::Internal(format!("spawn cp --reflink: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SandboxError::Internal(format!(
            "reflink {} -> {}: {}",
            src.display(),
            dst.display(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Build all files and the cgroup for a sandbox before the VMM is spawned.
pub async fn ensure_files(cfg: &SandboxConfig, template: &crate::template::TemplatePaths) -> Result<()> {
    let (rootfs, rootfs_writable) = if cfg.overlay {
        (template.rootfs(), Some(template.rootfs_writable()))
    } else {
        (template.rootfs(), None)
    };
    stage_instance_files(cfg, &rootfs, rootfs_writable.as_deref()).await
}

/// Like [`ensure_files`], but sourcing the rootfs image(s) from arbitrary
/// paths instead of a [`crate::template::TemplatePaths`] layout. Used by the
/// template builder to stage files straight out of a build's temporary
/// directory, before that directory has been renamed into its final
/// `TemplatePaths` location.
pub async fn stage_instance_files(
    cfg: &SandboxConfig,
    rootfs: &std::path::Path,
    rootfs_writable: Option<&std::path::Path>,
) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.instance_dir).await?;
    tokio::fs::create_dir_all(&cfg.cgroup_dir).await?;
    if let Some(parent) = cfg.prometheus_target_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir_all(&cfg.private_kernel_dir).await?;
    tokio::fs::write(&cfg.private_kernel_dir.join("vmlinux"), []).await.ok();

    let mut perms = tokio::fs::metadata(&cfg.cgroup_dir).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&cfg.cgroup_dir, perms).await?;

    let instance_rootfs = cfg.instance_dir.join("rootfs");
    if let Some(writable) = rootfs_writable {
        reflink(writable, &instance_rootfs).await?;
        let readonly_dst = cfg.instance_dir.join("rootfs-ro");
        tokio::fs::hard_link(rootfs, &readonly_dst)
            .await
            .map_err(|e| SandboxError::Internal(format!("hardlink rootfs: {e}")))?;
    } else {
        reflink(rootfs, &instance_rootfs).await?;
    }

    Ok(())
}

/// Tear down a sandbox's files and cgroup. Errors from each step are
/// aggregated rather than short-circuiting.
pub async fn cleanup_files(cfg: &SandboxConfig, keep_instance_dir: bool) -> Result<()> {
    let mut errs = TeardownErrors::new();

    if !keep_instance_dir
        && let Err(e) = tokio::fs::remove_dir_all(&cfg.instance_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        errs.push("remove_instance_dir", e);
    }

    if let Err(e) = tokio::fs::remove_file(&cfg.vmm_socket_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        errs.push("remove_vmm_socket", e);
    }

    if let Err(e) = tokio::fs::remove_file(&cfg.prometheus_target_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        errs.push("remove_prometheus_target", e);
    }

    if let Err(e) = remove_cgroup_with_retry(&cfg.cgroup_dir).await {
        errs.push("remove_cgroup", e);
    }

    errs.into_result()
}

async fn remove_cgroup_with_retry(dir: &std::path::Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let mut last_err = None;
    for (attempt, backoff_ms) in RMDIR_RETRY_BACKOFFS_MS.into_iter().enumerate() {
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(attempt, dir = %dir.display(), error = %e, "cgroup rmdir failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            last_err = Some(e);
            Err(SandboxError::Internal(format!(
                "rmdir {} failed after 3 retries: {}",
                dir.display(),
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )))
        }
    }
}

/// Process-start initializer: ensure the Prometheus targets dir and parent
/// cgroup exist, then enable every controller reported by
/// `cgroup.controllers` on `cgroup.subtree_control`. Fatal on failure
/// (spec §7 "Initialization fatal").
pub async fn init_parent_cgroup(parent_cgroup: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(parent_cgroup).await.map_err(|e| {
        SandboxError::Internal(format!("create parent cgroup {}: {e}", parent_cgroup.display()))
    })?;
    enable_subtree_controllers(parent_cgroup).await
}

async fn enable_subtree_controllers(parent_cgroup: &std::path::Path) -> Result<()> {
    let controllers = tokio::fs::read_to_string(parent_cgroup.join("cgroup.controllers"))
        .await
        .map_err(|e| SandboxError::Internal(format!("read cgroup.controllers: {e}")))?;
    let tokens: Vec<String> = controllers.split_whitespace().map(|t| format!("+{t}")).collect();
    if tokens.is_empty() {
        return Ok(());
    }
    let joined = tokens.join(" ");
    tokio::fs::write(parent_cgroup.join("cgroup.subtree_control"), joined)
        .await
        .map_err(|e| SandboxError::Internal(format!("write cgroup.subtree_control: {e}")))
}

/// `RecreateCgroup` (spec §4.9): `rmdir` the parent cgroup and recreate it.
pub async fn recreate_parent_cgroup(parent_cgroup: &std::path::Path) -> Result<()> {
    exec("rmdir", &[parent_cgroup.to_string_lossy().as_ref()], Privilege::Sudo)
        .await
        .ok();
    init_parent_cgroup(parent_cgroup).await
}

/// Read and parse `memory.current` for a sandbox's cgroup.
pub async fn host_mem_consumption(cfg: &SandboxConfig) -> Result<u64> {
    let content = tokio::fs::read_to_string(cfg.cgroup_dir.join("memory.current")).await?;
    parse_memory_current(&content)
}

pub fn parse_memory_current(content: &str) -> Result<u64> {
    content
        .trim()
        .parse::<u64>()
        .map_err(|e| SandboxError::Internal(format!("parse memory.current: {e}")))
}

/// `Deactive` (spec §4.8): request the kernel reclaim up to 1500 MiB.
/// `EAGAIN` is a partial success — the kernel reclaimed what it could.
pub async fn reclaim_memory(cfg: &SandboxConfig) -> Result<()> {
    match tokio::fs::write(cfg.cgroup_dir.join("memory.reclaim"), "1500M").await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(()),
        Err(e) => Err(SandboxError::Internal(format!("memory.reclaim: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_current_roundtrips() {
        for n in [0u64, 1, 42, 1_000_000_000, u64::MAX] {
            let formatted = n.to_string();
            assert_eq!(parse_memory_current(&formatted).unwrap(), n);
        }
    }

    #[test]
    fn parse_memory_current_rejects_garbage() {
        assert!(parse_memory_current("not a number").is_err());
    }

    #[tokio::test]
    async fn cleanup_files_idempotent_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        tokio::fs::create_dir_all(&cfg.instance_dir).await.unwrap();

        // first cleanup: cgroup dir doesn't exist so remove_cgroup_with_retry
        // short-circuits Ok; remaining removals are NotFound-tolerant.
        cleanup_files(&cfg, false).await.unwrap();
        cleanup_files(&cfg, false).await.unwrap();
    }

    fn test_config(base: &std::path::Path) -> SandboxConfig {
        SandboxConfig {
            sandbox_id: "sbx-1".into(),
            template_id: "default".into(),
            vmm_type: sandbox::VmmKind::Firecracker,
            overlay: false,
            vcpu: 1,
            memory_mb: 128,
            kernel_version: "5.10".into(),
            hypervisor_binary_path: "firecracker".into(),
            cgroup_dir: base.join("cgroup"),
            vmm_socket_path: base.join("vmm.socket"),
            instance_dir: base.join("instance"),
            private_dir: base.join("private"),
            prometheus_target_path: base.join("target.json"),
            snapshot_output_dir: base.join("snap"),
            host_kernel_dir: base.join("kernel"),
            private_kernel_dir: base.join("private-kernel"),
            enable_diff_snapshot: false,
            max_instance_length: None,
            metadata: Default::default(),
        }
    }
}
