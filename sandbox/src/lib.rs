mod error;
mod hypervisor;
mod types;

pub use error::{Result, SandboxError, TeardownErrors};
pub use hypervisor::Hypervisor;
pub use types::{SandboxInfo, SandboxState, VmmKind};
