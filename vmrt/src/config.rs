//! Per-sandbox derived configuration (spec §3 `SandboxConfig`) and the
//! process-wide ambient `Config` (spec §3.1).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use sandbox::VmmKind;

use crate::layout;
use crate::template::{Template, TemplatePaths};

/// Process-wide settings, constructed once at startup (spec §3.1, §9
/// "global mutable state").
#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: PathBuf,
    pub parent_cgroup: PathBuf,
    pub veth_subnet_base: Ipv4Addr,
    pub host_cloned_base: Ipv4Addr,
    pub max_network_number: u64,
    pub recycle_network: bool,
    pub repurposable_cgroups: bool,
    pub envd_port: u16,
    pub prometheus_target_host: String,
    pub control_socket_timeout_ms: u64,
    pub listen_addr: SocketAddr,
}

/// Derived from Template + request (spec §3): sandbox id, cgroup path, VMM
/// socket path, instance directory, private running directory, Prometheus
/// target path, snapshot output directory.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub sandbox_id: String,
    pub template_id: String,
    pub vmm_type: VmmKind,
    pub overlay: bool,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub kernel_version: String,
    /// Resolved at config-derivation time from the `Create` request's
    /// optional override, defaulting to the template's VMM binary path
    /// (DESIGN.md OQ-b: owned solely here, not duplicated on `Template`).
    pub hypervisor_binary_path: PathBuf,
    pub cgroup_dir: PathBuf,
    pub vmm_socket_path: PathBuf,
    pub instance_dir: PathBuf,
    pub private_dir: PathBuf,
    pub prometheus_target_path: PathBuf,
    pub snapshot_output_dir: PathBuf,
    pub host_kernel_dir: PathBuf,
    pub private_kernel_dir: PathBuf,
    pub enable_diff_snapshot: bool,
    pub max_instance_length: Option<std::time::Duration>,
    pub metadata: std::collections::HashMap<String, String>,
}

impl SandboxConfig {
    pub fn derive(
        cfg: &Config,
        template: &Template,
        sandbox_id: &str,
        hypervisor_binary_path_override: Option<PathBuf>,
        enable_diff_snapshot: bool,
        max_instance_length: Option<std::time::Duration>,
        metadata: std::collections::HashMap<String, String>,
    ) -> Self {
        let template_paths = TemplatePaths::new(&cfg.data_root, &template.id);
        let default_binary = PathBuf::from(template.vmm_type.binary_name());

        Self {
            sandbox_id: sandbox_id.to_string(),
            template_id: template.id.clone(),
            vmm_type: template.vmm_type,
            overlay: template.flags.overlay,
            vcpu: template.vcpu,
            memory_mb: template.memory_mb,
            kernel_version: template.kernel_version.clone(),
            hypervisor_binary_path: hypervisor_binary_path_override.unwrap_or(default_binary),
            cgroup_dir: layout::cgroup_dir(&cfg.parent_cgroup, sandbox_id),
            vmm_socket_path: layout::vmm_socket_path(sandbox_id),
            instance_dir: template_paths.instance_dir(sandbox_id),
            private_dir: Path::new("/run/sandboxd/private").join(sandbox_id),
            prometheus_target_path: layout::prometheus_target_path(&cfg.data_root, sandbox_id),
            snapshot_output_dir: template_paths.instance_snapshot_dir(sandbox_id),
            host_kernel_dir: TemplatePaths::host_kernel_dir(&cfg.data_root, &template.kernel_version),
            private_kernel_dir: Path::new("/run/sandboxd/kernel").join(sandbox_id),
            enable_diff_snapshot,
            max_instance_length,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            id: "default".into(),
            vmm_type: VmmKind::Firecracker,
            vcpu: 1,
            memory_mb: 128,
            disk_mb: 512,
            kernel_version: "5.10".into(),
            start_command: None,
            flags: Default::default(),
            base_image: "alpine".into(),
            created_at: chrono::Utc::now(),
        }
    }

    fn config() -> Config {
        Config {
            data_root: PathBuf::from("/data"),
            parent_cgroup: PathBuf::from("/sys/fs/cgroup/sandboxd"),
            veth_subnet_base: Ipv4Addr::new(10, 168, 0, 0),
            host_cloned_base: Ipv4Addr::new(192, 168, 168, 0),
            max_network_number: 4096,
            recycle_network: true,
            repurposable_cgroups: false,
            envd_port: 8080,
            prometheus_target_host: "host.docker.internal:6666".into(),
            control_socket_timeout_ms: 2000,
            listen_addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    #[test]
    fn derive_uses_template_binary_by_default() {
        let cfg = SandboxConfig::derive(&config(), &template(), "sbx-1", None, false, None, Default::default());
        assert_eq!(cfg.hypervisor_binary_path, PathBuf::from("firecracker"));
    }

    #[test]
    fn derive_honors_request_override() {
        let cfg = SandboxConfig::derive(
            &config(),
            &template(),
            "sbx-1",
            Some(PathBuf::from("/opt/firecracker-custom")),
            false,
            None,
            Default::default(),
        );
        assert_eq!(cfg.hypervisor_binary_path, PathBuf::from("/opt/firecracker-custom"));
    }

    #[test]
    fn derive_computes_cgroup_under_parent() {
        let cfg = SandboxConfig::derive(&config(), &template(), "sbx-1", None, false, None, Default::default());
        assert_eq!(cfg.cgroup_dir, PathBuf::from("/sys/fs/cgroup/sandboxd/sbx-1"));
    }
}
