use crate::{link::Shaping, NodeName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A timestamped delta, as read straight from an epoch JSON file. Never
/// persisted; the compiler turns it into store writes and discards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub time: DateTime<Utc>,
    #[serde(rename = "links-add", default)]
    pub links_add: Vec<LinkSpec>,
    #[serde(rename = "links-del", default)]
    pub links_del: Vec<LinkRef>,
    #[serde(rename = "links-update", default)]
    pub links_update: Vec<LinkSpec>,
    #[serde(default)]
    pub run: BTreeMap<String, Vec<String>>,
}

/// The add/update input shape: everything a [`crate::Link`] needs except the
/// VNI, which the compiler assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub endpoint1: NodeName,
    pub endpoint2: NodeName,
    pub endpoint1_antenna: u32,
    pub endpoint2_antenna: u32,
    #[serde(flatten)]
    pub shaping: Shaping,
}

/// Identifies an existing link for deletion; no shaping, no VNI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRef {
    pub endpoint1: NodeName,
    pub endpoint2: NodeName,
    pub endpoint1_antenna: u32,
    pub endpoint2_antenna: u32,
}

/// `/config/run/<name>` value: a batch of shell commands tagged with the
/// epoch counter so agents can deduplicate replays after a watch resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBatch {
    pub epoch_counter: u64,
    pub commands: Vec<String>,
}
