//! The on-disk shape `netsat init` reads: node/worker descriptors plus the
//! cluster-wide L3 config, exactly what [`netsat_compiler::Compiler::init`]
//! expects.

use netsat_model::{L3Config, Node, Worker};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct TopologyFile {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub l3_config: L3Config,
}
