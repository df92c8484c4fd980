use crate::{canonical_pair, NodeName};

/// Builds and parses the store's fixed key layout (§6). Centralizing this
/// keeps the canonicalization rule (§3: "A<B lexicographically") in one
/// place instead of scattered `format!`s.
pub struct Keys;

impl Keys {
    pub fn node(name: &NodeName) -> String {
        format!("/config/nodes/{name}")
    }

    pub fn nodes_prefix() -> &'static str {
        "/config/nodes/"
    }

    pub fn worker(name: &str) -> String {
        format!("/config/workers/{name}")
    }

    pub fn workers_prefix() -> &'static str {
        "/config/workers/"
    }

    pub fn l3_config() -> &'static str {
        "/config/L3-config"
    }

    pub fn epoch_config() -> &'static str {
        "/config/epoch-config"
    }

    pub fn links_prefix() -> &'static str {
        "/config/links/"
    }

    pub fn link(a: &NodeName, b: &NodeName, ant_a: u32, ant_b: u32) -> String {
        let (lo, hi) = canonical_pair(a, b);
        let (ant_lo, ant_hi) = if lo == a { (ant_a, ant_b) } else { (ant_b, ant_a) };
        format!("/config/links/{lo}_{hi}_{ant_lo}_{ant_hi}")
    }

    pub fn run(name: &NodeName) -> String {
        format!("/config/run/{name}")
    }

    pub fn run_prefix() -> &'static str {
        "/config/run/"
    }

    pub fn etchosts(name: &NodeName) -> String {
        format!("/config/etchosts/{name}")
    }

    pub fn etchosts_prefix() -> &'static str {
        "/config/etchosts/"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_key_is_order_independent() {
        let a: NodeName = "sat2".into();
        let b: NodeName = "sat1".into();

        assert_eq!(Keys::link(&a, &b, 1, 2), Keys::link(&b, &a, 2, 1));
        assert_eq!(Keys::link(&a, &b, 1, 2), "/config/links/sat1_sat2_2_1");
    }
}
