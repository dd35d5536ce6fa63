use std::net::Ipv4Addr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// One of the two supported hypervisor backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmmKind {
    Firecracker,
    CloudHypervisor,
}

impl VmmKind {
    pub fn binary_name(&self) -> &'static str {
        match self {
            VmmKind::Firecracker => "firecracker",
            VmmKind::CloudHypervisor => "cloud-hypervisor",
        }
    }
}

/// Observable sandbox lifecycle state (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Running,
    Snapshotting,
    Stop,
    Cleaning,
    Invalid,
    Orphan,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Running => "running",
            SandboxState::Snapshotting => "snapshotting",
            SandboxState::Stop => "stop",
            SandboxState::Cleaning => "cleaning",
            SandboxState::Invalid => "invalid",
            SandboxState::Orphan => "orphan",
        };
        f.write_str(s)
    }
}

/// Public snapshot of a sandbox, returned by `List`/`Search`/`Create`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub pid: Option<u32>,
    pub template_id: Option<String>,
    pub kernel_version: Option<String>,
    pub network_idx: Option<u64>,
    pub private_ip: Option<Ipv4Addr>,
    pub enable_diff_snapshot: Option<bool>,
    pub start_time: Option<SystemTime>,
    pub state: SandboxState,
}
