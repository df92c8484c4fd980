use ip_network::Ipv4Network;
use serde::{Deserialize, Serialize};

/// `/config/workers/<name>`: a host machine running the container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub ssh_user: String,
    pub ip: String,
    pub ssh_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_subnet: Option<Ipv4Network>,
}
