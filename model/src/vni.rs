use serde::{Deserialize, Serialize};
use std::fmt;

/// A 24-bit VXLAN Network Identifier. `0` is reserved and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vni(u32);

pub const MAX_VNI: u32 = (1 << 24) - 1;

impl Vni {
    pub fn new(v: u32) -> Result<Self, VniError> {
        if v == 0 || v > MAX_VNI {
            return Err(VniError::OutOfRange(v));
        }

        Ok(Self(v))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VniError {
    #[error("VNI {0} out of range 1..={MAX_VNI}")]
    OutOfRange(u32),
}
