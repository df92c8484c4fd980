use netsat_command::CommandRunner;
use netsat_model::{L3Config, Node, NodeName};
use netsat_store::Store;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Replaces the teacher's module-level mutable state (§9 Design Notes:
/// "Global singletons ... are rewritten as explicit context objects passed
/// through"). One `AgentContext` is built at bootstrap and shared by every
/// watcher task.
pub struct AgentContext<S: Store> {
    pub store: Arc<S>,
    pub command: Arc<dyn CommandRunner>,
    pub self_name: NodeName,
    pub node: RwLock<Node>,
    pub l3_config: RwLock<L3Config>,
    /// §5: "operations on the same interface name are serialized by a
    /// per-interface lock". Entries are created lazily and never removed;
    /// interface churn in this system is bounded by node count, not
    /// traffic, so the map does not need eviction.
    interface_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: Store> AgentContext<S> {
    pub fn new(store: Arc<S>, command: Arc<dyn CommandRunner>, self_name: NodeName, node: Node, l3_config: L3Config) -> Self {
        Self {
            store,
            command,
            self_name,
            node: RwLock::new(node),
            l3_config: RwLock::new(l3_config),
            interface_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock_interface(&self, ifname: &str) -> Arc<Mutex<()>> {
        let mut map = self.interface_locks.lock().await;
        map.entry(ifname.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
