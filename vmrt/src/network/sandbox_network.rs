//! `SandboxNetwork`: owns one allocated [`NetworkEnv`], runs the 8-step
//! setup sequence of spec §4.3, and tears it down via a LIFO stack of
//! reversal steps (spec §9 "deferred teardown stacks").

use std::sync::Mutex;

use sandbox::{Result, SandboxError, TeardownErrors};
use tracing::{info, warn};

use super::hosts::HostsWriter;
use super::ops;
use crate::netenv::{NetworkEnv, TAP_HOST_IP, TAP_HOST_MASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    Invalid,
    InUse,
    Free,
}

/// One named teardown action, executed in reverse order of registration.
enum Teardown {
    DeleteNetns,
    DeleteHostVeth,
    DeleteHostIptables,
    DeleteHostRoute,
    DeleteHostForwardMasquerade,
}

pub struct SandboxNetwork {
    pub env: NetworkEnv,
    pub sandbox_id: String,
    state: Mutex<NetState>,
    stack: Mutex<Vec<Teardown>>,
    /// Set by `setup_inner` to the interface used for the host FORWARD/
    /// MASQUERADE rules, so `teardown` can issue the exact matching deletes.
    gateway_iface: Mutex<String>,
}

impl SandboxNetwork {
    pub fn new(env: NetworkEnv, sandbox_id: impl Into<String>) -> Self {
        Self {
            env,
            sandbox_id: sandbox_id.into(),
            state: Mutex::new(NetState::Invalid),
            stack: Mutex::new(Vec::new()),
            gateway_iface: Mutex::new(String::new()),
        }
    }

    pub fn state(&self) -> NetState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, s: NetState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }

    fn push(&self, step: Teardown) {
        self.stack.lock().unwrap_or_else(|e| e.into_inner()).push(step);
    }

    /// Run the 8-step setup sequence. On any failure, unwinds everything
    /// pushed so far (LIFO) before returning the aggregated error.
    pub async fn setup(&self, gateway_iface: &str, hosts: &HostsWriter) -> Result<()> {
        let env = &self.env;
        let netns = env.netns_name();

        if ops::netns_exists(&netns).await {
            return Err(SandboxError::NetnsExists(netns));
        }

        if let Err(e) = self.setup_inner(gateway_iface, hosts).await {
            warn!(sandbox_id = %self.sandbox_id, error = %e, "network setup failed, unwinding");
            if let Err(unwind_err) = self.teardown(hosts).await {
                warn!(sandbox_id = %self.sandbox_id, error = %unwind_err, "unwind after failed setup also failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reduced setup for the one-shot pre-snapshot build boot: netns + tap
    /// device only, no veth pair, host routing, NAT, or DNS entry. `teardown`
    /// only has `DeleteNetns` on its stack afterward, so recycling a dummy
    /// network is just a netns delete.
    pub async fn setup_dummy(&self, hosts: &HostsWriter) -> Result<()> {
        let env = &self.env;
        let netns = env.netns_name();

        if ops::netns_exists(&netns).await {
            return Err(SandboxError::NetnsExists(netns));
        }

        if let Err(e) = self.setup_dummy_inner().await {
            warn!(sandbox_id = %self.sandbox_id, error = %e, "dummy network setup failed, unwinding");
            if let Err(unwind_err) = self.teardown(hosts).await {
                warn!(sandbox_id = %self.sandbox_id, error = %unwind_err, "unwind after failed dummy setup also failed");
            }
            return Err(e);
        }
        self.set_state(NetState::InUse);
        Ok(())
    }

    async fn setup_dummy_inner(&self) -> Result<()> {
        let env = &self.env;
        let netns = env.netns_name();

        ops::add_netns(&netns)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteNetns);

        ops::create_tap_in_ns(&netns, env.tap_name())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::set_addr_in_ns(&netns, env.tap_name(), TAP_HOST_IP, TAP_HOST_MASK)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::link_up_in_ns(&netns, env.tap_name())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::loopback_up_in_ns(&netns)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        info!(sandbox_id = %self.sandbox_id, idx = env.idx, "dummy network configured");
        Ok(())
    }

    async fn setup_inner(&self, gateway_iface: &str, hosts: &HostsWriter) -> Result<()> {
        let env = &self.env;
        let netns = env.netns_name();
        let veth_host = env.veth_host_name();
        let veth_peer = env.veth_peer_name();

        // 2. create + enter the sandbox netns
        ops::add_netns(&netns)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteNetns);

        // 3. tap device + loopback inside the sandbox netns
        ops::create_tap_in_ns(&netns, env.tap_name())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::set_addr_in_ns(&netns, env.tap_name(), TAP_HOST_IP, TAP_HOST_MASK)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::link_up_in_ns(&netns, env.tap_name())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::loopback_up_in_ns(&netns)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        // 4. veth pair, peer end moved into the sandbox netns
        ops::create_veth_pair(&veth_host, veth_peer, &netns)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::set_addr_in_ns(&netns, veth_peer, env.veth_peer_ip(), env.veth_prefix_len())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::link_up_in_ns(&netns, veth_peer)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        // 5. host end of the veth, in the host namespace
        ops::link_up(&veth_host)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::set_addr(&veth_host, env.veth_host_ip(), env.veth_prefix_len())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteHostVeth);

        // 6. default route + NAT inside the sandbox netns
        ops::add_default_route_in_ns(&netns, env.veth_host_ip())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::iptables_append_in_ns(
            Some(&netns),
            "nat",
            &[
                "POSTROUTING",
                "-s",
                &env.guest_ip().to_string(),
                "-j",
                "SNAT",
                "--to-source",
                &env.host_cloned_ip().to_string(),
            ],
        )
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::iptables_append_in_ns(
            Some(&netns),
            "nat",
            &[
                "PREROUTING",
                "-d",
                &env.host_cloned_ip().to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &env.guest_ip().to_string(),
            ],
        )
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteHostIptables);

        // 7. host route + FORWARD/MASQUERADE through the default gateway
        let host_cloned_cidr = format!("{}/32", env.host_cloned_ip());
        ops::add_host_route(&host_cloned_cidr, env.veth_peer_ip())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteHostRoute);

        *self.gateway_iface.lock().unwrap_or_else(|e| e.into_inner()) = gateway_iface.to_string();

        ops::iptables_append_in_ns(
            None,
            "filter",
            &["FORWARD", "-i", gateway_iface, "-o", &veth_host, "-j", "ACCEPT"],
        )
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::iptables_append_in_ns(
            None,
            "filter",
            &["FORWARD", "-i", &veth_host, "-o", gateway_iface, "-j", "ACCEPT"],
        )
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
        ops::iptables_append_in_ns(
            None,
            "nat",
            &[
                "POSTROUTING",
                "-s",
                &host_cloned_cidr,
                "-o",
                gateway_iface,
                "-j",
                "MASQUERADE",
            ],
        )
        .await
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
        self.push(Teardown::DeleteHostForwardMasquerade);

        // 8. DNS entry
        hosts
            .upsert(&self.sandbox_id, env.host_cloned_ip())
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        self.set_state(NetState::InUse);
        info!(sandbox_id = %self.sandbox_id, idx = env.idx, "network configured");
        Ok(())
    }

    /// Drain the teardown stack in reverse order, aggregating errors.
    pub async fn teardown(&self, hosts: &HostsWriter) -> Result<()> {
        let env = &self.env;
        let steps: Vec<Teardown> = {
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *stack)
        };

        let mut errs = TeardownErrors::new();
        for step in steps.into_iter().rev() {
            match step {
                Teardown::DeleteHostRoute => {
                    let cidr = format!("{}/32", env.host_cloned_ip());
                    if let Err(e) = ops::delete_host_route(&cidr).await {
                        errs.push("delete_host_route", e);
                    }
                }
                Teardown::DeleteHostIptables => {
                    let netns = env.netns_name();
                    if let Err(e) = ops::iptables_delete_in_ns(
                        Some(&netns),
                        "nat",
                        &[
                            "POSTROUTING",
                            "-s",
                            &env.guest_ip().to_string(),
                            "-j",
                            "SNAT",
                            "--to-source",
                            &env.host_cloned_ip().to_string(),
                        ],
                    )
                    .await
                    {
                        errs.push("delete_host_iptables", e);
                    }
                    if let Err(e) = ops::iptables_delete_in_ns(
                        Some(&netns),
                        "nat",
                        &[
                            "PREROUTING",
                            "-d",
                            &env.host_cloned_ip().to_string(),
                            "-j",
                            "DNAT",
                            "--to-destination",
                            &env.guest_ip().to_string(),
                        ],
                    )
                    .await
                    {
                        errs.push("delete_host_iptables", e);
                    }
                }
                Teardown::DeleteHostForwardMasquerade => {
                    let gateway_iface = self.gateway_iface.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    let veth_host = env.veth_host_name();
                    let host_cloned_cidr = format!("{}/32", env.host_cloned_ip());
                    if let Err(e) = ops::iptables_delete_in_ns(
                        None,
                        "filter",
                        &["FORWARD", "-i", &gateway_iface, "-o", &veth_host, "-j", "ACCEPT"],
                    )
                    .await
                    {
                        errs.push("delete_host_forward", e);
                    }
                    if let Err(e) = ops::iptables_delete_in_ns(
                        None,
                        "filter",
                        &["FORWARD", "-i", &veth_host, "-o", &gateway_iface, "-j", "ACCEPT"],
                    )
                    .await
                    {
                        errs.push("delete_host_forward", e);
                    }
                    if let Err(e) = ops::iptables_delete_in_ns(
                        None,
                        "nat",
                        &[
                            "POSTROUTING",
                            "-s",
                            &host_cloned_cidr,
                            "-o",
                            &gateway_iface,
                            "-j",
                            "MASQUERADE",
                        ],
                    )
                    .await
                    {
                        errs.push("delete_host_masquerade", e);
                    }
                }
                Teardown::DeleteHostVeth => {
                    if let Err(e) = ops::delete_link(&env.veth_host_name()).await {
                        errs.push("delete_host_veth", e);
                    }
                }
                Teardown::DeleteNetns => {
                    if let Err(e) = ops::delete_netns(&env.netns_name()).await {
                        errs.push("delete_netns", e);
                    }
                }
            }
        }

        if let Err(e) = hosts.remove(&self.sandbox_id).await {
            errs.push("remove_dns_entry", e);
        }

        self.set_state(NetState::Free);
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_starts_invalid() {
        let net = SandboxNetwork::new(NetworkEnv::new(1), "sbx-1");
        assert_eq!(net.state(), NetState::Invalid);
    }

    #[test]
    fn set_state_transitions() {
        let net = SandboxNetwork::new(NetworkEnv::new(1), "sbx-1");
        net.set_state(NetState::InUse);
        assert_eq!(net.state(), NetState::InUse);
        net.set_state(NetState::Free);
        assert_eq!(net.state(), NetState::Free);
    }
}
