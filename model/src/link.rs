use crate::{NodeName, Vni};
use serde::{Deserialize, Serialize};

/// A live, provisioned point-to-point overlay between two node antennas.
///
/// This is the record written under `/config/links/<A>_<B>_<antA>_<antB>`;
/// `endpoint1`/`endpoint2` and their antennas are kept exactly as given at
/// creation time, they are not re-sorted after [`crate::canonical_pair`] has
/// chosen the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub endpoint1: NodeName,
    pub endpoint2: NodeName,
    pub endpoint1_antenna: u32,
    pub endpoint2_antenna: u32,
    pub vni: Vni,
    #[serde(default, skip_serializing_if = "Shaping::is_empty")]
    pub shaping: Shaping,
}

impl Link {
    /// The antenna and peer address relevant to `self_name`, if it is one of
    /// this link's endpoints.
    pub fn peer_of(&self, self_name: &NodeName) -> Option<(u32, &NodeName, u32)> {
        if &self.endpoint1 == self_name {
            Some((self.endpoint1_antenna, &self.endpoint2, self.endpoint2_antenna))
        } else if &self.endpoint2 == self_name {
            Some((self.endpoint2_antenna, &self.endpoint1, self.endpoint1_antenna))
        } else {
            None
        }
    }
}

/// `tc netem` / rate-shaping parameters. Every field is optional free text
/// (e.g. `"100mbit"`, `"5ms"`) and an absent field is simply omitted from the
/// emitted `tc` command -- see `apply_tc_settings` in the agent crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shaping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reorder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<String>,
}

impl Shaping {
    pub fn is_empty(&self) -> bool {
        self.rate.is_none()
            && self.delay.is_none()
            && self.jitter.is_none()
            && self.distribution.is_none()
            && self.loss.is_none()
            && self.duplicate.is_none()
            && self.corrupt.is_none()
            && self.reorder.is_none()
            && self.gap.is_none()
    }

    /// Parsed millisecond delay, used by the mobility sub-protocol's
    /// eligibility predicate. Returns `None` if `delay` is absent or not a
    /// plain `<number>ms` value.
    pub fn delay_ms(&self) -> Option<f64> {
        let raw = self.delay.as_deref()?.trim();
        raw.strip_suffix("ms")?.trim().parse().ok()
    }
}
