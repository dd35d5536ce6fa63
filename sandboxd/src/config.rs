//! Process-wide CLI configuration (spec §1.3, §3.1).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct Cli {
    /// Root directory for templates, prometheus targets, and kernels.
    #[arg(long, env = "SANDBOXD_DATA_ROOT", default_value = "/var/lib/sandboxd")]
    pub data_root: PathBuf,

    /// Parent cgroup v2 directory all sandbox cgroups nest under.
    #[arg(long, env = "SANDBOXD_PARENT_CGROUP", default_value = "/sys/fs/cgroup/sandboxd")]
    pub parent_cgroup: PathBuf,

    /// Base address of the per-index veth /30 subnets (spec §4.2).
    #[arg(long, env = "SANDBOXD_VETH_SUBNET_BASE", default_value = "10.168.0.0")]
    pub veth_subnet_base: Ipv4Addr,

    /// Base address of the per-index host-cloned address range.
    #[arg(long, env = "SANDBOXD_HOST_CLONED_BASE", default_value = "192.168.168.0")]
    pub host_cloned_base: Ipv4Addr,

    /// Highest network index the allocator will hand out.
    #[arg(long, env = "SANDBOXD_MAX_NETWORK_NUMBER", default_value_t = 4096)]
    pub max_network_number: u64,

    /// Return freed network indices to the allocator's free-list.
    #[arg(long, env = "SANDBOXD_RECYCLE_NETWORK", default_value_t = true)]
    pub recycle_network: bool,

    /// Place sandboxes into their cgroup at clone time instead of after start.
    #[arg(long, env = "SANDBOXD_REPURPOSABLE_CGROUPS", default_value_t = false)]
    pub repurposable_cgroups: bool,

    /// Guest-side agent port used to derive Prometheus scrape targets.
    #[arg(long, env = "SANDBOXD_ENVD_PORT", default_value_t = 8080)]
    pub envd_port: u16,

    /// Host exposed to Prometheus as the scrape target for every sandbox.
    #[arg(long, env = "SANDBOXD_PROMETHEUS_TARGET_HOST", default_value = "host.docker.internal:6666")]
    pub prometheus_target_host: String,

    /// Per-request timeout for VMM control-socket calls, in milliseconds.
    #[arg(long, env = "SANDBOXD_CONTROL_SOCKET_TIMEOUT_MS", default_value_t = 2000)]
    pub control_socket_timeout_ms: u64,

    /// Address the RPC surface listens on.
    #[arg(long, env = "SANDBOXD_LISTEN_ADDR", default_value = "127.0.0.1:9000")]
    pub listen_addr: SocketAddr,

    /// `RUST_LOG`-style filter; overrides the default `info` level.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn into_config(self) -> vmrt::Config {
        vmrt::Config {
            data_root: self.data_root,
            parent_cgroup: self.parent_cgroup,
            veth_subnet_base: self.veth_subnet_base,
            host_cloned_base: self.host_cloned_base,
            max_network_number: self.max_network_number,
            recycle_network: self.recycle_network,
            repurposable_cgroups: self.repurposable_cgroups,
            envd_port: self.envd_port,
            prometheus_target_host: self.prometheus_target_host,
            control_socket_timeout_ms: self.control_socket_timeout_ms,
            listen_addr: self.listen_addr,
        }
    }
}
