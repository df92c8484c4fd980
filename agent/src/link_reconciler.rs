//! C5: the link reconciler. Watches `/config/links/` and reacts to
//! PUT/DELETE events touching this node by creating/destroying VXLAN
//! interfaces and applying `tc netem`.

use crate::context::AgentContext;
use crate::routing::RoutingAdapter;
use anyhow::{Context as _, Result};
use futures::StreamExt;
use netsat_model::{Keys, Link, Node, NodeName, Shaping};
use netsat_store::{EventKind, Store, WatchItem};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

pub const VXLAN_DSTPORT: u16 = 4789;
pub const VXLAN_MTU: u32 = 1350;

const PEER_IP_RETRY_ATTEMPTS: u32 = 10;
const PEER_IP_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Local view of an instantiated VXLAN interface (§3 per-node local state),
/// keyed by the link's store key so DELETE events -- which carry no value
/// -- can still find the interface to tear down.
#[derive(Debug, Clone)]
struct LinkIface {
    ifname: String,
    vni: u32,
    remote: IpAddr,
    shaping: Shaping,
    peer_addr_v4: Option<Ipv4Addr>,
    peer_addr_v6: Option<Ipv6Addr>,
}

/// §4.6: a route goes to the peer's specific antenna address, not its whole
/// subnet -- a node with more than one antenna has one VXLAN tunnel per
/// peer antenna, and two tunnels both routing to the same subnet would have
/// the second `ip route replace` silently clobber the first.
fn peer_antenna_addrs(peer_node: &Node, peer_antenna: u32) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let idx = (peer_antenna.saturating_sub(1)) as usize;

    let v4 = peer_node
        .subnet_v4
        .and_then(|net| netsat_net::bridge_and_loopback_v4(net, peer_node.antennas))
        .and_then(|(bridges, _)| bridges.get(idx).copied());

    let v6 = peer_node
        .subnet_v6
        .and_then(|net| netsat_net::bridge_and_loopback_v6(net, peer_node.antennas))
        .and_then(|(bridges, _)| bridges.get(idx).copied());

    (v4, v6)
}

pub struct LinkReconciler<S: Store> {
    ctx: Arc<AgentContext<S>>,
    uplink: String,
    routing: Arc<RoutingAdapter<S>>,
    instantiated: Mutex<HashMap<String, LinkIface>>,
}

pub fn ifname_for(peer: &NodeName, peer_antenna: u32) -> String {
    format!("vl_{peer}_{peer_antenna}")
}

impl<S: Store> LinkReconciler<S> {
    pub fn new(ctx: Arc<AgentContext<S>>, uplink: impl Into<String>, routing: Arc<RoutingAdapter<S>>) -> Self {
        Self {
            ctx,
            uplink: uplink.into(),
            routing,
            instantiated: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.initial_scan().await;

        // Watches the *entire* links prefix rather than a self-scoped one:
        // `Keys::link` canonicalizes on the lexicographically smaller
        // endpoint, so a node that never sorts first (any `usr*` node
        // against a `sat*`/`grd*` peer, for instance) would otherwise never
        // observe a PUT/DELETE for its own links. Filtering happens locally
        // in `handle_event` via `Link::peer_of`.
        let prefix = Keys::links_prefix();
        let mut stream = self.ctx.store.watch_prefix(prefix);

        while let Some(item) = stream.next().await {
            match item {
                WatchItem::Event(ev) => {
                    if let Err(e) = self.handle_event(ev.kind, &ev.key, ev.value).await {
                        tracing::warn!(error = %e, key = %ev.key, "link reconciliation failed");
                    }
                }
                WatchItem::Resync => self.initial_scan().await,
            }
        }

        Ok(())
    }

    /// §4.5 "On initial scan (epoch 0)": sweeps the entire links prefix and
    /// keeps only links touching this node, via `Link::peer_of`.
    async fn initial_scan(&self) {
        let all = match self.ctx.store.get_prefix(Keys::links_prefix()).await {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(error = %e, "initial link scan failed");
                return;
            }
        };

        for (key, value) in all {
            let link: Link = match serde_json::from_slice(&value) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, key, "corrupt link record, skipping");
                    continue;
                }
            };

            if link.peer_of(&self.ctx.self_name).is_none() {
                continue;
            }

            if let Err(e) = self.upsert(&key, &link).await {
                tracing::warn!(error = %e, key, "failed to reconcile link on initial scan");
            }
        }
    }

    async fn handle_event(&self, kind: EventKind, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        match kind {
            EventKind::Put => {
                let value = value.context("PUT event with no value")?;
                let link: Link = serde_json::from_slice(&value).context("corrupt link record")?;
                self.upsert(key, &link).await
            }
            EventKind::Delete => self.remove(key).await,
        }
    }

    async fn upsert(&self, key: &str, link: &Link) -> Result<()> {
        let Some((self_antenna, peer, peer_antenna)) = link.peer_of(&self.ctx.self_name) else {
            return Ok(());
        };

        let peer_node = self.resolve_peer(peer).await;
        let Some(peer_node) = peer_node else {
            tracing::warn!(peer = %peer, "peer eth0_ip unavailable after retry budget, skipping link (will retry on next PUT)");
            return Ok(());
        };
        let Some(peer_ip) = peer_node.eth0_ip else {
            tracing::warn!(peer = %peer, "peer eth0_ip unavailable after retry budget, skipping link (will retry on next PUT)");
            return Ok(());
        };

        let self_ip = self.ctx.node.read().eth0_ip;
        let Some(self_ip) = self_ip else {
            anyhow::bail!("own eth0_ip not yet known");
        };

        let ifname = ifname_for(peer, peer_antenna);
        let iface_lock = self.ctx.lock_interface(&ifname).await;
        let _guard = iface_lock.lock().await;

        self.create_vxlan_link(&ifname, link.vni.get(), peer_ip, self_ip, self_antenna).await?;
        self.apply_tc_settings(&ifname, &link.shaping).await?;

        let (peer_addr_v4, peer_addr_v6) = peer_antenna_addrs(&peer_node, peer_antenna);

        if let Err(e) = self.routing.on_link_up(&ifname, peer_addr_v4, peer_addr_v6).await {
            tracing::warn!(error = %e, ifname, "routing adapter failed to react to link up");
        }

        self.instantiated.lock().insert(
            key.to_owned(),
            LinkIface {
                ifname,
                vni: link.vni.get(),
                remote: peer_ip,
                shaping: link.shaping.clone(),
                peer_addr_v4,
                peer_addr_v6,
            },
        );

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let Some(iface) = self.instantiated.lock().remove(key) else {
            tracing::debug!(key, "DELETE for unknown link, nothing to tear down");
            return Ok(());
        };

        let iface_lock = self.ctx.lock_interface(&iface.ifname).await;
        let _guard = iface_lock.lock().await;

        if let Err(e) = self.routing.on_link_down(&iface.ifname, iface.peer_addr_v4, iface.peer_addr_v6).await {
            tracing::warn!(error = %e, ifname = %iface.ifname, "routing adapter failed to react to link down");
        }

        // `ip link del` drops the attached qdisc with it.
        self.ctx
            .command
            .run("ip", &["link", "del", &iface.ifname])
            .await
            .context("deleting vxlan interface")?;

        Ok(())
    }

    /// §4.5: "resolve the peer's `eth0_ip` via a bounded retry (<=10
    /// attempts, 2s apart)".
    async fn resolve_peer(&self, peer: &NodeName) -> Option<Node> {
        for attempt in 0..PEER_IP_RETRY_ATTEMPTS {
            if let Ok(Some(value)) = self.ctx.store.get(&Keys::node(peer)).await {
                if let Ok(node) = serde_json::from_slice::<Node>(&value) {
                    if node.eth0_ip.is_some() {
                        return Some(node);
                    }
                }
            }

            if attempt + 1 < PEER_IP_RETRY_ATTEMPTS {
                tokio::time::sleep(PEER_IP_RETRY_INTERVAL).await;
            }
        }

        None
    }

    /// §4.5 `create_vxlan_link`: idempotent upsert.
    async fn create_vxlan_link(
        &self,
        ifname: &str,
        vni: u32,
        remote: IpAddr,
        local: IpAddr,
        antenna: u32,
    ) -> Result<()> {
        let exists = self.ctx.command.run("ip", &["link", "show", ifname]).await?;

        if !exists.success() {
            let vni_s = vni.to_string();
            let remote_s = remote.to_string();
            let local_s = local.to_string();
            let dstport_s = VXLAN_DSTPORT.to_string();

            self.ctx
                .command
                .run_checked(
                    "ip",
                    &[
                        "link", "add", ifname, "type", "vxlan", "id", &vni_s, "remote", &remote_s, "local",
                        &local_s, "dev", &self.uplink, "dstport", &dstport_s,
                    ],
                )
                .await?;
        }

        let mtu_s = VXLAN_MTU.to_string();
        self.ctx.command.run_checked("ip", &["link", "set", ifname, "mtu", &mtu_s]).await?;

        let bridge = format!("br{antenna}");
        self.ctx
            .command
            .run_checked("ip", &["link", "set", ifname, "master", &bridge])
            .await?;
        self.ctx.command.run_checked("ip", &["link", "set", ifname, "up"]).await?;

        // Prevents transit through the bridge without going through routing.
        self.ctx
            .command
            .run_checked("bridge", &["link", "set", "dev", ifname, "isolated", "on"])
            .await?;

        Ok(())
    }

    /// §4.5 `apply_tc_settings`: a no-op when every netem field is empty,
    /// otherwise a single minimal `tc qdisc replace ... netem ...`.
    async fn apply_tc_settings(&self, ifname: &str, shaping: &Shaping) -> Result<()> {
        if shaping.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = vec![
            "qdisc".into(),
            "replace".into(),
            "dev".into(),
            ifname.into(),
            "root".into(),
            "netem".into(),
        ];

        if let Some(rate) = &shaping.rate {
            args.push("rate".into());
            args.push(rate.clone());
        }
        if let Some(loss) = &shaping.loss {
            args.push("loss".into());
            args.push(loss.clone());
        }
        if let Some(dup) = &shaping.duplicate {
            args.push("duplicate".into());
            args.push(dup.clone());
        }
        if let Some(corrupt) = &shaping.corrupt {
            args.push("corrupt".into());
            args.push(corrupt.clone());
        }
        if let Some(delay) = &shaping.delay {
            args.push("delay".into());
            args.push(delay.clone());

            if let Some(jitter) = &shaping.jitter {
                args.push(jitter.clone());

                if let Some(distribution) = &shaping.distribution {
                    args.push("distribution".into());
                    args.push(distribution.clone());
                }
            }
        }
        if let Some(reorder) = &shaping.reorder {
            args.push("reorder".into());
            args.push(reorder.clone());

            if let Some(gap) = &shaping.gap {
                args.push("gap".into());
                args.push(gap.clone());
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ctx.command.run_checked("tc", &arg_refs).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use netsat_command::RecordingCommandRunner;
    use netsat_model::{L3Config, Link, Vni};
    use netsat_store::MemoryStore;
    use std::net::Ipv4Addr;

    async fn ctx_with(self_name: &str, self_ip: &str) -> (Arc<AgentContext<MemoryStore>>, Arc<RecordingCommandRunner>) {
        let store = MemoryStore::new();
        let command = RecordingCommandRunner::new();
        let mut node = Node::new(self_name, "satellite", "w1", 2);
        node.eth0_ip = Some(self_ip.parse().unwrap());

        let ctx = Arc::new(AgentContext::new(store, command.clone(), self_name.into(), node, L3Config::default()));
        (ctx, command)
    }

    #[tokio::test]
    async fn s1_put_creates_vxlan_attaches_bridge_and_shapes() {
        let (ctx, command) = ctx_with("sat1", "10.0.0.1").await;
        // "ip link show" reports not-found so create_vxlan_link takes the add path.
        command.push_response(netsat_command::CommandOutput {
            status: 1,
            ..Default::default()
        });

        let peer = Node {
            eth0_ip: Some("10.0.0.2".parse().unwrap()),
            ..Node::new("sat2", "satellite", "w1", 2)
        };
        ctx.store
            .put(&Keys::node(&"sat2".into()), serde_json::to_vec(&peer).unwrap())
            .await
            .unwrap();

        let routing = Arc::new(RoutingAdapter::new(ctx.clone(), "eth0"));
        let reconciler = Arc::new(LinkReconciler::new(ctx.clone(), "eth0", routing));

        let link = Link {
            endpoint1: "sat1".into(),
            endpoint2: "sat2".into(),
            endpoint1_antenna: 1,
            endpoint2_antenna: 1,
            vni: Vni::new(1).unwrap(),
            shaping: Shaping {
                delay: Some("5ms".into()),
                rate: Some("100mbit".into()),
                ..Default::default()
            },
        };

        reconciler.upsert("/config/links/sat1_sat2_1_1", &link).await.unwrap();

        assert!(command.was_run(
            "ip",
            &[
                "link", "add", "vl_sat2_1", "type", "vxlan", "id", "1", "remote", "10.0.0.2", "local", "10.0.0.1",
                "dev", "eth0", "dstport", "4789"
            ]
        ));
        assert!(command.was_run("ip", &["link", "set", "vl_sat2_1", "master", "br1"]));
        assert!(command.was_run(
            "tc",
            &["qdisc", "replace", "dev", "vl_sat2_1", "root", "netem", "rate", "100mbit", "delay", "5ms"]
        ));
    }

    #[tokio::test]
    async fn delete_removes_interface_using_tracked_state() {
        let (ctx, command) = ctx_with("sat1", "10.0.0.1").await;
        let peer = Node {
            eth0_ip: Some("10.0.0.2".parse().unwrap()),
            ..Node::new("sat2", "satellite", "w1", 1)
        };
        ctx.store.put(&Keys::node(&"sat2".into()), serde_json::to_vec(&peer).unwrap()).await.unwrap();

        let routing = Arc::new(RoutingAdapter::new(ctx.clone(), "eth0"));
        let reconciler = Arc::new(LinkReconciler::new(ctx.clone(), "eth0", routing));
        let link = Link {
            endpoint1: "sat1".into(),
            endpoint2: "sat2".into(),
            endpoint1_antenna: 1,
            endpoint2_antenna: 1,
            vni: Vni::new(7).unwrap(),
            shaping: Shaping::default(),
        };
        reconciler.upsert("/config/links/sat1_sat2_1_1", &link).await.unwrap();
        reconciler.remove("/config/links/sat1_sat2_1_1").await.unwrap();

        assert!(command.was_run("ip", &["link", "del", "vl_sat2_1"]));
    }

    #[tokio::test]
    async fn tc_noop_when_every_field_absent() {
        let (ctx, command) = ctx_with("sat1", "10.0.0.1").await;
        let routing = Arc::new(RoutingAdapter::new(ctx.clone(), "eth0"));
        let reconciler = LinkReconciler::new(ctx, "eth0", routing);

        reconciler.apply_tc_settings("vl_sat2_1", &Shaping::default()).await.unwrap();
        assert!(command.invocations().is_empty());
    }
}
