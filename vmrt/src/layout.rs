//! Persistent layout tree (spec §6), rooted at a data root plus a handful of
//! fixed system paths (cgroupfs, `/var/run/netns`, `/tmp`).

use std::path::{Path, PathBuf};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// VMM control socket path: `/tmp/vmm-<sbx_id>.socket`.
pub fn vmm_socket_path(sandbox_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/vmm-{sandbox_id}.socket"))
}

/// Per-sandbox cgroup (v2) directory under the configured parent.
pub fn cgroup_dir(parent_cgroup: &Path, sandbox_id: &str) -> PathBuf {
    parent_cgroup.join(sandbox_id)
}

/// Prometheus target file for one sandbox: `<data_root>/prometheus-targets/<sbx_id>.json`.
pub fn prometheus_target_path(data_root: &Path, sandbox_id: &str) -> PathBuf {
    data_root
        .join("prometheus-targets")
        .join(format!("{sandbox_id}.json"))
}

pub fn prometheus_targets_dir(data_root: &Path) -> PathBuf {
    data_root.join("prometheus-targets")
}

/// Exact shape from spec §6.
pub fn prometheus_target_body(sandbox_id: &str, envd_port: u16) -> serde_json::Value {
    serde_json::json!([{
        "targets": ["host.docker.internal:6666"],
        "labels": {
            "id": sandbox_id,
            "__metrics_path__": format!("/{sandbox_id}/{envd_port}/metrics"),
        }
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmm_socket_path_matches_contract() {
        assert_eq!(
            vmm_socket_path("sbx-1"),
            PathBuf::from("/tmp/vmm-sbx-1.socket")
        );
    }

    #[test]
    fn prometheus_target_body_matches_exact_shape() {
        let body = prometheus_target_body("sbx-1", 9000);
        let expected = serde_json::json!([{
            "targets": ["host.docker.internal:6666"],
            "labels": {"id": "sbx-1", "__metrics_path__": "/sbx-1/9000/metrics"}
        }]);
        assert_eq!(body, expected);
    }
}
