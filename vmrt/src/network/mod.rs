mod hosts;
mod manager;
mod ops;
mod sandbox_network;

pub use hosts::HostsWriter;
pub use manager::{NetworkManager, clean_network_env};
pub use sandbox_network::{NetState, SandboxNetwork};
