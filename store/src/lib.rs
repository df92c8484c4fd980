//! C1: a typed get/put/prefix-scan/watch wrapper over the shared key-value
//! store (§4.1). The rest of the system only ever sees [`Store`] and
//! [`WatchItem`]; nothing upstream knows this is etcd underneath.

mod backoff_stream;
mod etcd;
mod memory;

pub use etcd::{EtcdStore, StoreAuth};
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    /// `None` on delete.
    pub value: Option<Vec<u8>>,
}

/// An item from a watch stream. `Resync` is synthesized by the wrapper
/// itself (never by the store) whenever a watch has just been
/// re-established after a transport failure: events may have been missed
/// (in particular deletes), so the caller should re-scan the prefix to
/// recover (§4.1, §5 "Backpressure").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    Event(Event),
    Resync,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<i64>;

    fn watch(&self, key: String) -> BoxStream<'static, WatchItem>;
    fn watch_prefix(&self, prefix: String) -> BoxStream<'static, WatchItem>;
}
