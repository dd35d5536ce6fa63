//! Orphan purge (spec §4.10): recover (sandbox id, env id, netns, pid) from
//! `/proc` command lines after an unclean restart, then kill and clean up.

use regex::Regex;
use sandbox::{Result, SandboxError, TeardownErrors, VmmKind};
use tracing::info;
use vmrt::{Config, SandboxConfig, TemplatePaths};

use crate::error::ServerResult;

const INSTANCES_DIR: &str = "instances";

pub struct OrphanProcess {
    pub pid: u32,
    pub sandbox_id: String,
    pub netns_name: String,
    pub template_id: String,
    pub network_idx: Option<u64>,
}

/// Scan every `/proc/<pid>/cmdline`, keeping the ones that look like a VMM
/// supervisor we spawned: they start with `unshare`, contain `ip netns exec`,
/// and name one of the two known VMM binaries.
pub async fn scan() -> ServerResult<Vec<OrphanProcess>> {
    let sandbox_id_re = Regex::new(&format!(r"/{INSTANCES_DIR}/([\w-]+)/"))
        .map_err(|e| crate::error::ServerError::Internal(format!("regex: {e}")))?;
    let netns_re = Regex::new(r"ip netns exec ([\w-]+)")
        .map_err(|e| crate::error::ServerError::Internal(format!("regex: {e}")))?;
    let env_id_re = Regex::new(&format!(r"/([\w-]+)/{INSTANCES_DIR}/"))
        .map_err(|e| crate::error::ServerError::Internal(format!("regex: {e}")))?;

    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir("/proc")
        .await
        .map_err(|e| crate::error::ServerError::Internal(format!("read /proc: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| crate::error::ServerError::Internal(format!("read /proc entry: {e}")))?
    {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let cmdline_path = entry.path().join("cmdline");
        let Ok(raw) = tokio::fs::read(&cmdline_path).await else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");

        if !cmdline.trim_start().starts_with("unshare") || !cmdline.contains("ip netns exec") {
            continue;
        }
        let is_vmm = [VmmKind::Firecracker, VmmKind::CloudHypervisor]
            .iter()
            .any(|k| cmdline.contains(k.binary_name()));
        if !is_vmm {
            continue;
        }

        let Some(sandbox_id) = sandbox_id_re.captures(&cmdline).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
        else {
            continue;
        };
        let Some(netns_name) = netns_re.captures(&cmdline).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
        else {
            continue;
        };
        let template_id = env_id_re
            .captures(&cmdline)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let network_idx = vmrt::netenv::parse_netns_name(&netns_name);

        out.push(OrphanProcess {
            pid,
            sandbox_id,
            netns_name,
            template_id,
            network_idx,
        });
    }

    Ok(out)
}

/// Build just enough of a `SandboxConfig` to locate an orphan's on-disk
/// state (instance dir, VMM socket, Prometheus target, cgroup) for
/// `vmrt::force_teardown`. Fields `force_teardown`/`cleanup_files` don't
/// touch are filled with placeholders.
fn minimal_sandbox_config(config: &Config, orphan: &OrphanProcess) -> SandboxConfig {
    let template_paths = TemplatePaths::new(&config.data_root, &orphan.template_id);
    SandboxConfig {
        sandbox_id: orphan.sandbox_id.clone(),
        template_id: orphan.template_id.clone(),
        vmm_type: VmmKind::Firecracker,
        overlay: false,
        vcpu: 0,
        memory_mb: 0,
        kernel_version: String::new(),
        hypervisor_binary_path: std::path::PathBuf::new(),
        cgroup_dir: vmrt::layout::cgroup_dir(&config.parent_cgroup, &orphan.sandbox_id),
        vmm_socket_path: vmrt::layout::vmm_socket_path(&orphan.sandbox_id),
        instance_dir: template_paths.instance_dir(&orphan.sandbox_id),
        private_dir: std::path::PathBuf::new(),
        prometheus_target_path: vmrt::layout::prometheus_target_path(&config.data_root, &orphan.sandbox_id),
        snapshot_output_dir: std::path::PathBuf::new(),
        host_kernel_dir: std::path::PathBuf::new(),
        private_kernel_dir: std::path::PathBuf::new(),
        enable_diff_snapshot: false,
        max_instance_length: None,
        metadata: Default::default(),
    }
}

/// `Purge`: for each orphan (optionally restricted to `ids`), kill the
/// process, tear down its network, clean up its files/cgroup, and release
/// its instance directory. Every step's error is aggregated and returned
/// rather than swallowed (DESIGN.md OQ-c).
pub async fn purge(config: &Config, gateway_iface: &str, ids: Option<&[String]>) -> Result<()> {
    let orphans = scan()
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
    let mut errs = TeardownErrors::new();

    for orphan in orphans {
        if let Some(ids) = ids
            && !ids.contains(&orphan.sandbox_id)
        {
            continue;
        }

        info!(sandbox_id = %orphan.sandbox_id, pid = orphan.pid, "purging orphan sandbox");

        if let Ok(pid) = i32::try_from(orphan.pid) {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
        } else {
            errs.push(format!("{}/kill", orphan.sandbox_id), "pid does not fit in i32");
        }

        if let Some(idx) = orphan.network_idx {
            let env = vmrt::NetworkEnv::new(idx);
            let hosts = vmrt::network::HostsWriter::new(std::path::PathBuf::from("/etc/hosts"));
            if let Err(e) = vmrt::network::clean_network_env(&env, gateway_iface, Some(&orphan.sandbox_id), &hosts).await {
                errs.push(format!("{}/clean_network_env", orphan.sandbox_id), e);
            }
        } else {
            errs.push(
                format!("{}/clean_network_env", orphan.sandbox_id),
                format!("could not parse network index from netns {}", orphan.netns_name),
            );
        }

        let cfg = minimal_sandbox_config(config, &orphan);
        if let Err(e) = vmrt::force_teardown(&cfg).await {
            errs.push(format!("{}/force_teardown", orphan.sandbox_id), e);
        }
    }

    errs.into_result()
}
