use crate::NodeName;
use ip_network::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// An emulated participant: satellite, ground station, user, gateway, ...
///
/// `kind` is a free-form tag (`"satellite"`, `"gateway"`, `"user"`, ...); the
/// agent and mobility sub-protocol branch on it, the compiler never
/// validates it against a closed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub kind: String,
    pub worker: String,
    pub antennas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_v4: Option<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_v6: Option<Ipv6Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<NodeL3Config>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Written exclusively by the node's own agent, see §3 ownership rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth0_ip: Option<IpAddr>,
}

impl Node {
    pub fn new(name: impl Into<NodeName>, kind: impl Into<String>, worker: impl Into<String>, antennas: u32) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            worker: worker.into(),
            antennas,
            subnet_v4: None,
            subnet_v6: None,
            l3: None,
            metadata: BTreeMap::new(),
            eth0_ip: None,
        }
    }
}

/// Per-node override of the routing behavior; falls back to the global
/// [`L3Config`] when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeL3Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_protocol: Option<RoutingProtocol>,
    #[serde(default)]
    pub advertise_default_route: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingProtocol {
    /// C6's "single-hop connected-only routes" mode.
    Static,
    /// C6's FRR/IS-IS mode.
    Isis,
}

/// `/config/L3-config`: the cluster-wide routing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L3Config {
    #[serde(default)]
    pub enable_tc: bool,
    #[serde(default)]
    pub enable_isis: bool,
    #[serde(default = "default_area_id")]
    pub isis_area_id: String,
    #[serde(default, rename = "COMMON-BRIDGE-ADDRESS")]
    pub common_bridge_address: bool,
    #[serde(default)]
    pub ip_version: IpVersion,
}

fn default_area_id() -> String {
    "0001".to_owned()
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            enable_tc: true,
            enable_isis: false,
            isis_area_id: default_area_id(),
            common_bridge_address: false,
            ip_version: IpVersion::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
    Both,
}
