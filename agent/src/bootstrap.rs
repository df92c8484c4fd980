//! C4: node agent bootstrap -- discover `eth0_ip`, create per-antenna
//! bridges, seed `/etc/hosts`.

use crate::context::AgentContext;
use anyhow::{Context as _, Result};
use netsat_command::CommandRunner;
use netsat_model::Keys;
use netsat_net::{bridge_and_loopback_v4, bridge_and_loopback_v6};
use netsat_store::Store;
use std::net::IpAddr;
use std::time::Duration;

const ETH0_DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// §4.4 step 3: "Retries until a non-zero, non-`.0` IP is observed."
pub async fn discover_eth0_ip(command: &dyn CommandRunner, uplink: &str) -> IpAddr {
    loop {
        if let Some(ip) = try_discover_eth0_ip(command, uplink).await {
            return ip;
        }

        tracing::debug!(uplink, "no usable address yet, retrying");
        tokio::time::sleep(ETH0_DISCOVERY_RETRY_INTERVAL).await;
    }
}

async fn try_discover_eth0_ip(command: &dyn CommandRunner, uplink: &str) -> Option<IpAddr> {
    let out = command
        .run("ip", &["-4", "-o", "addr", "show", "dev", uplink, "scope", "global"])
        .await
        .ok()?;

    for line in out.stdout.lines() {
        let Some(field) = line.split_whitespace().nth(3) else { continue };
        let Some(addr_str) = field.split('/').next() else { continue };
        let Ok(addr) = addr_str.parse::<IpAddr>() else { continue };

        if is_usable(&addr) {
            return Some(addr);
        }
    }

    None
}

fn is_usable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => !v4.is_unspecified() && v4.octets()[3] != 0,
        IpAddr::V6(v6) => !v6.is_unspecified(),
    }
}

/// §4.4 step 4: creates `br1..brN`, brings them up, assigns addresses from
/// the high end of the node's subnet(s). Resource exhaustion (subnet too
/// small) degrades to zero-address bridges rather than failing bootstrap
/// (§7.3).
pub async fn create_bridges<S: Store>(ctx: &AgentContext<S>, common_bridge_address: bool) -> Result<()> {
    let node = ctx.node.read().clone();

    let v4_addrs = node
        .subnet_v4
        .and_then(|net| bridge_and_loopback_v4(net, node.antennas))
        .map(|(bridges, _loopback)| bridges);

    let v6_addrs = node
        .subnet_v6
        .and_then(|net| bridge_and_loopback_v6(net, node.antennas))
        .map(|(bridges, _loopback)| bridges);

    if v4_addrs.is_none() && node.subnet_v4.is_some() {
        tracing::warn!(node = %node.name, "subnet too small for {} antennas + loopback, bridges will have no address", node.antennas);
    }

    for antenna in 1..=node.antennas {
        let ifname = format!("br{antenna}");

        ctx.command
            .run_checked("ip", &["link", "add", "name", &ifname, "type", "bridge"])
            .await
            .or_else(|e| ignore_exists(e))?;

        ctx.command.run_checked("ip", &["link", "set", &ifname, "up"]).await?;

        if let Some(addrs) = &v4_addrs {
            let idx = if common_bridge_address { 0 } else { (antenna - 1) as usize };
            if let Some(addr) = addrs.get(idx) {
                assign_address(ctx, &ifname, &addr.to_string(), 32).await?;
            }
        }

        if let Some(addrs) = &v6_addrs {
            let idx = if common_bridge_address { 0 } else { (antenna - 1) as usize };
            if let Some(addr) = addrs.get(idx) {
                assign_address(ctx, &ifname, &addr.to_string(), 128).await?;
            }
        }
    }

    Ok(())
}

async fn assign_address<S: Store>(ctx: &AgentContext<S>, ifname: &str, addr: &str, prefix: u8) -> Result<()> {
    let cidr = format!("{addr}/{prefix}");
    ctx.command
        .run_checked("ip", &["addr", "add", &cidr, "dev", ifname])
        .await
        .or_else(ignore_exists)?;
    Ok(())
}

fn ignore_exists(e: anyhow::Error) -> Result<netsat_command::CommandOutput> {
    if e.to_string().contains("exists") {
        Ok(netsat_command::CommandOutput::default())
    } else {
        Err(e)
    }
}

/// Writes the node's own `eth0_ip` back into its store record (§3:
/// "each agent exclusively owns its `eth0_ip` field").
pub async fn publish_eth0_ip<S: Store>(ctx: &AgentContext<S>, ip: IpAddr) -> Result<()> {
    {
        let mut node = ctx.node.write();
        node.eth0_ip = Some(ip);
    }

    let node = ctx.node.read().clone();
    let value = serde_json::to_vec(&node).context("serializing node record")?;
    ctx.store.put(&Keys::node(&node.name), value).await?;

    Ok(())
}
