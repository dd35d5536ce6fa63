pub mod command;
pub mod config;
pub mod files;
pub mod hypervisor;
pub mod layout;
pub mod netenv;
pub mod network;
pub mod prerequisites;
mod process;
pub mod sandbox;
pub mod template;

pub use config::{Config, SandboxConfig};
pub use netenv::NetworkEnv;
pub use sandbox::{ensure_clock_sync, force_teardown, SandboxHandle};
pub use template::{Template, TemplateError, TemplateFlags, TemplatePaths};
