//! C6: the routing adapter. Two mutually exclusive modes, selected per-node
//! (falling back to the cluster-wide `/config/L3-config` default): `static`
//! installs one connected route per link as it comes up, `isis` hands the
//! job to FRR and only ever touches interface/daemon config.

use crate::context::AgentContext;
use anyhow::{Context as _, Result};
use netsat_model::{IpVersion, RoutingProtocol};
use netsat_store::Store as StoreTrait;
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

const ISIS_INSTANCE: &str = "CORE";
const MASQUERADE_COMMENT: &str = "netsatbench-default-route";
const IFACE_UP_RETRY_ATTEMPTS: u32 = 5;
const IFACE_UP_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

pub struct RoutingAdapter<S: StoreTrait> {
    ctx: Arc<AgentContext<S>>,
    uplink: String,
}

impl<S: StoreTrait> RoutingAdapter<S> {
    pub fn new(ctx: Arc<AgentContext<S>>, uplink: impl Into<String>) -> Self {
        Self { ctx, uplink: uplink.into() }
    }

    pub fn effective_protocol(&self) -> RoutingProtocol {
        let node = self.ctx.node.read();
        if let Some(proto) = node.l3.as_ref().and_then(|l3| l3.routing_protocol) {
            return proto;
        }

        if self.ctx.l3_config.read().enable_isis {
            RoutingProtocol::Isis
        } else {
            RoutingProtocol::Static
        }
    }

    fn advertise_default_route(&self) -> bool {
        self.ctx
            .node
            .read()
            .l3
            .as_ref()
            .map(|l3| l3.advertise_default_route)
            .unwrap_or(false)
    }

    /// Called once at startup for ISIS nodes: brings up the daemon instance
    /// and, if configured, the default-route advertisement.
    pub async fn configure(&self) -> Result<()> {
        if self.effective_protocol() != RoutingProtocol::Isis {
            return Ok(());
        }

        self.configure_isis_instance().await?;

        if self.advertise_default_route() {
            self.configure_default_route_advertisement().await?;
        }

        Ok(())
    }

    /// §4.6: called by the link reconciler whenever a VXLAN interface comes
    /// up, so the new peer is reachable. `peer_v4`/`peer_v6` are the peer's
    /// own antenna address on this link, not its subnet -- a node with more
    /// than one antenna has one VXLAN tunnel per peer antenna, and routing
    /// to the shared subnet from each would clobber the others.
    pub async fn on_link_up(
        &self,
        ifname: &str,
        peer_v4: Option<Ipv4Addr>,
        peer_v6: Option<Ipv6Addr>,
    ) -> Result<()> {
        match self.effective_protocol() {
            RoutingProtocol::Static => self.install_static_routes(ifname, peer_v4, peer_v6).await,
            RoutingProtocol::Isis => self.enable_isis_on_interface(ifname).await,
        }
    }

    pub async fn on_link_down(
        &self,
        ifname: &str,
        peer_v4: Option<Ipv4Addr>,
        peer_v6: Option<Ipv6Addr>,
    ) -> Result<()> {
        match self.effective_protocol() {
            RoutingProtocol::Static => self.remove_static_routes(ifname, peer_v4, peer_v6).await,
            RoutingProtocol::Isis => self.disable_isis_on_interface(ifname).await,
        }
    }

    /// Installs a `/32`/`/128` host route to the peer's specific antenna
    /// address via the VXLAN interface (§4.6), never to its subnet.
    async fn install_static_routes(
        &self,
        ifname: &str,
        peer_v4: Option<Ipv4Addr>,
        peer_v6: Option<Ipv6Addr>,
    ) -> Result<()> {
        if peer_v4.is_none() && peer_v6.is_none() {
            return Ok(());
        }

        self.wait_for_interface_up(ifname).await;

        if let Some(v4) = peer_v4 {
            let dest = format!("{v4}/32");
            self.ctx.command.run_checked("ip", &["route", "replace", &dest, "dev", ifname]).await?;
        }

        if let Some(v6) = peer_v6 {
            let dest = format!("{v6}/128");

            match self.discover_link_local_v6(ifname).await {
                Some(ll) => {
                    self.ctx
                        .command
                        .run_checked("ip", &["-6", "route", "replace", &dest, "via", &ll.to_string(), "dev", ifname])
                        .await?;
                }
                None => {
                    self.ctx
                        .command
                        .run_checked("ip", &["-6", "route", "replace", &dest, "dev", ifname, "onlink"])
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn remove_static_routes(
        &self,
        ifname: &str,
        peer_v4: Option<Ipv4Addr>,
        peer_v6: Option<Ipv6Addr>,
    ) -> Result<()> {
        if let Some(v4) = peer_v4 {
            let dest = format!("{v4}/32");
            self.ctx.command.run("ip", &["route", "del", &dest, "dev", ifname]).await?;
        }

        if let Some(v6) = peer_v6 {
            let dest = format!("{v6}/128");
            self.ctx.command.run("ip", &["-6", "route", "del", &dest, "dev", ifname]).await?;
        }

        Ok(())
    }

    /// §4.6: waits for the VXLAN interface to report `UP` before installing
    /// a route over it, rather than racing the link reconciler.
    async fn wait_for_interface_up(&self, ifname: &str) {
        for attempt in 0..IFACE_UP_RETRY_ATTEMPTS {
            if let Ok(out) = self.ctx.command.run("ip", &["-o", "link", "show", ifname]).await {
                if out.stdout.contains("UP") {
                    return;
                }
            }

            if attempt + 1 < IFACE_UP_RETRY_ATTEMPTS {
                tokio::time::sleep(IFACE_UP_RETRY_INTERVAL).await;
            }
        }
    }

    /// Scans `ip -6 -o addr show dev <ifname> scope link` for the peer's
    /// auto-assigned link-local address; `None` means the interface hasn't
    /// finished duplicate-address-detection yet, so callers fall back to
    /// `onlink` rather than blocking the reconciler on it.
    async fn discover_link_local_v6(&self, ifname: &str) -> Option<Ipv6Addr> {
        let out = self
            .ctx
            .command
            .run("ip", &["-6", "-o", "addr", "show", "dev", ifname, "scope", "link"])
            .await
            .ok()?;

        for line in out.stdout.lines() {
            let field = line.split_whitespace().nth(3)?;
            let addr_str = field.split('/').next()?;
            if let Ok(addr) = addr_str.parse::<Ipv6Addr>() {
                return Some(addr);
            }
        }

        None
    }

    async fn configure_isis_instance(&self) -> Result<()> {
        let net = self.isis_net_address();

        self.ctx
            .command
            .run_checked(
                "vtysh",
                &[
                    "-c",
                    "configure terminal",
                    "-c",
                    &format!("router isis {ISIS_INSTANCE}"),
                    "-c",
                    &format!("net {net}"),
                    "-c",
                    "is-type level-2-only",
                ],
            )
            .await
            .context("configuring isis instance")?;

        Ok(())
    }

    async fn enable_isis_on_interface(&self, ifname: &str) -> Result<()> {
        self.ctx
            .command
            .run_checked(
                "vtysh",
                &[
                    "-c",
                    "configure terminal",
                    "-c",
                    &format!("interface {ifname}"),
                    "-c",
                    &format!("ip router isis {ISIS_INSTANCE}"),
                    "-c",
                    &format!("ipv6 router isis {ISIS_INSTANCE}"),
                    "-c",
                    "isis network point-to-point",
                    "-c",
                    "end",
                ],
            )
            .await?;

        Ok(())
    }

    /// Tolerates repeated application: `no interface <if>` on an interface
    /// FRR never configured is a no-op rather than an error.
    async fn disable_isis_on_interface(&self, ifname: &str) -> Result<()> {
        self.ctx
            .command
            .run(
                "vtysh",
                &["-c", "configure terminal", "-c", &format!("no interface {ifname}"), "-c", "end"],
            )
            .await?;

        Ok(())
    }

    /// Two default-covering `/1` statics plus `redistribute static
    /// level-2`, so the default route rides IS-IS instead of every node
    /// needing its own uplink visible in the IGP.
    async fn configure_default_route_advertisement(&self) -> Result<()> {
        self.ctx
            .command
            .run_checked(
                "vtysh",
                &[
                    "-c",
                    "configure terminal",
                    "-c",
                    &format!("ip route 0.0.0.0/1 {}", self.uplink),
                    "-c",
                    &format!("ip route 128.0.0.0/1 {}", self.uplink),
                    "-c",
                    &format!("router isis {ISIS_INSTANCE}"),
                    "-c",
                    "redistribute static level-2",
                ],
            )
            .await?;

        if self.ctx.l3_config.read().ip_version == IpVersion::V4 {
            self.ctx
                .command
                .run_checked(
                    "iptables",
                    &[
                        "-t", "nat", "-A", "POSTROUTING", "-o", &self.uplink, "-j", "MASQUERADE", "-m", "comment",
                        "--comment", MASQUERADE_COMMENT,
                    ],
                )
                .await?;
        }

        Ok(())
    }

    /// An 8-decimal-digit system-id: the high 32 bits of SHA-256(node name),
    /// reduced modulo 10^8 and left-padded, so node names map onto valid
    /// IS-IS NETs without a separately-assigned numbering scheme.
    fn system_id(&self) -> String {
        let digest = Sha256::digest(self.ctx.self_name.as_str().as_bytes());
        let high32 = u32::from_be_bytes(digest[..4].try_into().expect("4 bytes"));
        format!("{:08}", high32 % 100_000_000)
    }

    fn isis_net_address(&self) -> String {
        let area = self.ctx.l3_config.read().isis_area_id.clone();
        let id = self.system_id();
        format!("49.{area}.{}.{}.00", &id[0..4], &id[4..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::RecordingCommandRunner;
    use netsat_model::{L3Config, Node, NodeL3Config};
    use netsat_store::MemoryStore;

    fn ctx(protocol: Option<RoutingProtocol>) -> (Arc<AgentContext<MemoryStore>>, Arc<RecordingCommandRunner>) {
        let store = MemoryStore::new();
        let command = RecordingCommandRunner::new();
        let mut node = Node::new("sat1", "satellite", "w1", 1);
        node.l3 = protocol.map(|p| NodeL3Config {
            area_id: None,
            routing_protocol: Some(p),
            advertise_default_route: false,
        });

        let ctx = Arc::new(AgentContext::new(store, command.clone(), "sat1".into(), node, L3Config::default()));
        (ctx, command)
    }

    #[tokio::test]
    async fn static_mode_installs_v4_and_v6_onlink_route() {
        let (ctx, command) = ctx(Some(RoutingProtocol::Static));
        command.push_response(netsat_command::CommandOutput::ok("3: vl_sat2_1: <BROADCAST,UP> mtu 1350"));
        let adapter = RoutingAdapter::new(ctx, "eth0");

        let v4 = Ipv4Addr::new(10, 1, 0, 2);
        adapter.on_link_up("vl_sat2_1", Some(v4), None).await.unwrap();

        assert!(command.was_run("ip", &["route", "replace", "10.1.0.2/32", "dev", "vl_sat2_1"]));
    }

    #[tokio::test]
    async fn isis_mode_enables_the_interface_instead_of_adding_routes() {
        let (ctx, command) = ctx(Some(RoutingProtocol::Isis));
        let adapter = RoutingAdapter::new(ctx, "eth0");

        adapter.on_link_up("vl_sat2_1", None, None).await.unwrap();

        assert!(command
            .invocations()
            .iter()
            .any(|i| i.program == "vtysh" && i.args.iter().any(|a| a.contains("interface vl_sat2_1"))));
    }

    #[tokio::test]
    async fn falls_back_to_global_l3_config_when_node_has_no_override() {
        let (ctx, _command) = ctx(None);
        {
            let mut l3 = ctx.l3_config.write();
            l3.enable_isis = true;
        }

        let adapter = RoutingAdapter::new(ctx, "eth0");
        assert_eq!(adapter.effective_protocol(), RoutingProtocol::Isis);
    }
}
