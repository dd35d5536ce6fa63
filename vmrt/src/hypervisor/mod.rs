//! VMM control-plane adapters (spec §4.6). Both backends share the
//! hand-rolled Unix-socket HTTP client in `client`; `cloud_hypervisor` and
//! `firecracker` only differ in request shape.

mod client;
mod cloud_hypervisor;
mod firecracker;

pub use client::UdsHttpClient;
pub use cloud_hypervisor::CloudHypervisorHypervisor;
pub use firecracker::FirecrackerHypervisor;

use std::path::PathBuf;

use sandbox::{Hypervisor, VmmKind};

use crate::config::SandboxConfig;
use crate::netenv::NetworkEnv;

/// Build the concrete adapter for a sandbox's configured VMM kind.
pub fn build(cfg: SandboxConfig, env: NetworkEnv, kernel_path: PathBuf) -> Box<dyn Hypervisor> {
    match cfg.vmm_type {
        VmmKind::Firecracker => Box::new(FirecrackerHypervisor::new(cfg, env, kernel_path)),
        VmmKind::CloudHypervisor => Box::new(CloudHypervisorHypervisor::new(cfg, env, kernel_path)),
    }
}
