//! Shell-level primitives backing `SandboxNetwork::setup`/`teardown` (spec §4.3).
//!
//! Every helper here does exactly one `ip`/`iptables` invocation through
//! [`crate::command::exec`], mirroring the teacher's `network/pool.rs` style:
//! small, named, independently testable wrappers rather than one monolithic
//! shell script.

use std::net::Ipv4Addr;

use tracing::trace;

use crate::command::{Privilege, exec};

type Result<T> = std::result::Result<T, crate::command::CommandError>;

pub async fn netns_exists(name: &str) -> bool {
    exec("ip", &["netns", "list"], Privilege::User)
        .await
        .map(|out| out.lines().any(|l| l.split_whitespace().next() == Some(name)))
        .unwrap_or(false)
}

pub async fn add_netns(name: &str) -> Result<()> {
    exec("ip", &["netns", "add", name], Privilege::Sudo).await?;
    Ok(())
}

pub async fn delete_netns(name: &str) -> Result<()> {
    exec("ip", &["netns", "delete", name], Privilege::Sudo).await?;
    Ok(())
}

/// Run an `ip` subcommand inside a named netns.
async fn ip_in_ns(netns: &str, args: &[&str]) -> Result<String> {
    let mut full = vec!["netns", "exec", netns, "ip"];
    full.extend_from_slice(args);
    exec("ip", &full, Privilege::Sudo).await
}

pub async fn create_tap_in_ns(netns: &str, tap_name: &str) -> Result<()> {
    ip_in_ns(netns, &["tuntap", "add", "dev", tap_name, "mode", "tap"]).await?;
    Ok(())
}

pub async fn set_addr_in_ns(netns: &str, dev: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
    let cidr = format!("{addr}/{prefix}");
    ip_in_ns(netns, &["addr", "add", &cidr, "dev", dev]).await?;
    Ok(())
}

pub async fn link_up_in_ns(netns: &str, dev: &str) -> Result<()> {
    ip_in_ns(netns, &["link", "set", dev, "up"]).await?;
    Ok(())
}

pub async fn create_veth_pair(host_side: &str, peer_side: &str, peer_netns: &str) -> Result<()> {
    exec(
        "ip",
        &[
            "link", "add", host_side, "type", "veth", "peer", "name", peer_side,
        ],
        Privilege::Sudo,
    )
    .await?;
    exec(
        "ip",
        &["link", "set", peer_side, "netns", peer_netns],
        Privilege::Sudo,
    )
    .await?;
    Ok(())
}

pub async fn delete_link(name: &str) -> Result<()> {
    exec("ip", &["link", "delete", name], Privilege::Sudo).await?;
    Ok(())
}

pub async fn set_addr(dev: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
    let cidr = format!("{addr}/{prefix}");
    exec("ip", &["addr", "add", &cidr, "dev", dev], Privilege::Sudo).await?;
    Ok(())
}

pub async fn link_up(dev: &str) -> Result<()> {
    exec("ip", &["link", "set", dev, "up"], Privilege::Sudo).await?;
    Ok(())
}

pub async fn add_default_route_in_ns(netns: &str, via: Ipv4Addr) -> Result<()> {
    ip_in_ns(netns, &["route", "add", "default", "via", &via.to_string()]).await?;
    Ok(())
}

pub async fn add_host_route(dest_cidr: &str, via: Ipv4Addr) -> Result<()> {
    exec(
        "ip",
        &["route", "add", dest_cidr, "via", &via.to_string()],
        Privilege::Sudo,
    )
    .await?;
    Ok(())
}

pub async fn delete_host_route(dest_cidr: &str) -> Result<()> {
    exec("ip", &["route", "del", dest_cidr], Privilege::Sudo).await?;
    Ok(())
}

/// Append one iptables rule, run inside the given netns when `netns` is `Some`.
pub async fn iptables_append_in_ns(netns: Option<&str>, table: &str, args: &[&str]) -> Result<()> {
    iptables(netns, "-A", table, args).await
}

pub async fn iptables_delete_in_ns(netns: Option<&str>, table: &str, args: &[&str]) -> Result<()> {
    iptables(netns, "-D", table, args).await
}

async fn iptables(netns: Option<&str>, op: &str, table: &str, args: &[&str]) -> Result<()> {
    let mut full: Vec<&str> = Vec::new();
    if let Some(ns) = netns {
        full.extend_from_slice(&["netns", "exec", ns, "iptables"]);
    }
    full.extend_from_slice(&["-t", table, op]);
    full.extend_from_slice(args);

    let program = if netns.is_some() { "ip" } else { "iptables" };
    let result = exec(program, &full, Privilege::Sudo).await;
    if result.is_err() {
        trace!(op, table, ?args, "iptables rule failed (may already be absent)");
    }
    result.map(|_| ())
}

pub async fn loopback_up_in_ns(netns: &str) -> Result<()> {
    link_up_in_ns(netns, "lo").await
}
