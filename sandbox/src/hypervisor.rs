use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Unified facade over a VMM's control socket (spec §4.6).
///
/// Both backends share this shape even though their wire bodies differ
/// completely: boot-source/drives/machine-config PUTs for Firecracker,
/// a single `create-vm` call for Cloud Hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Push the VM's static configuration (boot source, drives, network,
    /// machine config) to the control socket. Must be called once, before
    /// `start` or `restore`.
    async fn configure(&self) -> Result<()>;

    /// Start the configured VM from a cold boot.
    async fn start(&self) -> Result<()>;

    /// Pause the running VM's vCPUs.
    async fn pause(&self) -> Result<()>;

    /// Resume a paused VM.
    async fn resume(&self) -> Result<()>;

    /// Restore a VM from a snapshot directory. Cloud Hypervisor additionally
    /// requires `resume` afterward; Firecracker does not.
    async fn restore(&self, snapshot_dir: &Path) -> Result<()>;

    /// Pause and capture a full snapshot (memory + device state) into `dir`.
    async fn snapshot(&self, dir: &Path) -> Result<()>;

    /// Release any client-side resources (connection, buffers). Does not
    /// touch the VMM process itself.
    async fn cleanup(&self) -> Result<()>;
}
