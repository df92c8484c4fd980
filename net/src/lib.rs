//! Address arithmetic for bootstrap (§4.4): bridges and the routing
//! loopback are assigned from the high end of a node's subnet, one address
//! per antenna plus one reserved for the loopback.

use ip_network::{Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};

/// The `offset`-th usable address from the top of `net`, `offset = 0` being
/// the highest address below the broadcast address. Returns `None` once the
/// computed address would collide with (or precede) the network address.
pub fn top_host_v4(net: Ipv4Network, offset: u32) -> Option<Ipv4Addr> {
    let broadcast: u32 = net.broadcast_address().into();
    let network: u32 = net.network_address().into();

    let candidate = broadcast.checked_sub(offset + 1)?;
    if candidate <= network {
        return None;
    }

    Some(Ipv4Addr::from(candidate))
}

pub fn top_host_v6(net: Ipv6Network, offset: u128) -> Option<Ipv6Addr> {
    let network: u128 = net.network_address().into();
    let host_bits = 128u32.checked_sub(u32::from(net.netmask()))?;
    let size = 1u128.checked_shl(host_bits)?;
    let top = network.checked_add(size.checked_sub(1)?)?;

    let candidate = top.checked_sub(offset)?;
    if candidate <= network {
        return None;
    }

    Some(Ipv6Addr::from(candidate))
}

/// Returns `(per-antenna addresses, loopback address)`, all drawn from the
/// high end of `net`, or `None` if `net` has fewer than `antennas + 1`
/// usable host addresses (§7.3: resource exhaustion degrades, it is not
/// fatal at the agent).
pub fn bridge_and_loopback_v4(net: Ipv4Network, antennas: u32) -> Option<(Vec<Ipv4Addr>, Ipv4Addr)> {
    let loopback = top_host_v4(net, 0)?;
    let mut bridges = Vec::with_capacity(antennas as usize);

    for i in 0..antennas {
        bridges.push(top_host_v4(net, i + 1)?);
    }

    Some((bridges, loopback))
}

pub fn bridge_and_loopback_v6(net: Ipv6Network, antennas: u32) -> Option<(Vec<Ipv6Addr>, Ipv6Addr)> {
    let loopback = top_host_v6(net, 0)?;
    let mut bridges = Vec::with_capacity(antennas as usize);

    for i in 0..antennas {
        bridges.push(top_host_v6(net, u128::from(i) + 1)?);
    }

    Some((bridges, loopback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_from_top_of_range() {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 29).unwrap(); // .0-.7, hosts .1-.6
        let (bridges, loopback) = bridge_and_loopback_v4(net, 2).unwrap();

        assert_eq!(loopback, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(bridges, vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 4)]);
    }

    #[test]
    fn reports_exhaustion_instead_of_wrapping() {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap(); // only 2 usable hosts
        assert!(bridge_and_loopback_v4(net, 4).is_none());
    }
}
