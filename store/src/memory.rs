//! An in-memory [`Store`], used by every other crate's test suite instead of
//! standing up a real etcd. Watches never need a resync hint here since
//! there is no transport to drop.

use crate::{Event, EventKind, Store, WatchItem};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            data: Mutex::new(BTreeMap::new()),
            events: tx,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .lock()
            .await
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.data.lock().await.insert(key.to_owned(), value.clone());
        let _ = self.events.send(Event {
            kind: EventKind::Put,
            key: key.to_owned(),
            value: Some(value),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let existed = self.data.lock().await.remove(key).is_some();
        if existed {
            let _ = self.events.send(Event {
                kind: EventKind::Delete,
                key: key.to_owned(),
                value: None,
            });
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<i64> {
        let keys: Vec<String> = {
            let data = self.data.lock().await;
            data.range(prefix.to_owned()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect()
        };

        for key in &keys {
            self.data.lock().await.remove(key);
            let _ = self.events.send(Event {
                kind: EventKind::Delete,
                key: key.clone(),
                value: None,
            });
        }

        Ok(keys.len() as i64)
    }

    fn watch(&self, key: String) -> BoxStream<'static, WatchItem> {
        let rx = self.events.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(move |res| {
                let key = key.clone();
                async move {
                    let ev = res.ok()?;
                    (ev.key == key).then_some(WatchItem::Event(ev))
                }
            })
            .boxed()
    }

    fn watch_prefix(&self, prefix: String) -> BoxStream<'static, WatchItem> {
        let rx = self.events.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(move |res| {
                let prefix = prefix.clone();
                async move {
                    let ev = res.ok()?;
                    ev.key.starts_with(&prefix).then_some(WatchItem::Event(ev))
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_prefix_round_trips() {
        let store = MemoryStore::new();
        store.put("/config/links/a_b_1_1", b"x".to_vec()).await.unwrap();
        store.put("/config/nodes/a", b"y".to_vec()).await.unwrap();

        let got = store.get_prefix("/config/links/").await.unwrap();
        assert_eq!(got, vec![("/config/links/a_b_1_1".to_owned(), b"x".to_vec())]);
    }

    #[tokio::test]
    async fn delete_prefix_removes_everything_under_it() {
        let store = MemoryStore::new();
        store.put("/config/links/a_b_1_1", b"x".to_vec()).await.unwrap();
        store.put("/config/links/a_c_1_1", b"x".to_vec()).await.unwrap();

        let deleted = store.delete_prefix("/config/links/").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_prefix("/config/links/").await.unwrap().is_empty());
    }
}
