//! C8: the `/etc/hosts` reconciler. Scans and watches `/config/etchosts/`
//! and keeps a single managed block in the node's hosts file up to date,
//! replacing entries by name rather than appending duplicates.

use anyhow::{Context as _, Result};
use futures::StreamExt;
use netsat_store::{EventKind, Store, WatchItem};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const BLOCK_START: &str = "# BEGIN netsatbench managed hosts";
const BLOCK_END: &str = "# END netsatbench managed hosts";

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: String,
    pub name: String,
}

pub struct EtcHostsReconciler<S: Store> {
    store: Arc<S>,
    path: PathBuf,
    entries: Mutex<BTreeMap<String, HostEntry>>,
}

impl<S: Store> EtcHostsReconciler<S> {
    pub fn new(store: Arc<S>, path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { store, path: path.into(), entries: Mutex::new(BTreeMap::new()) })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.initial_scan().await;

        let mut stream = self.store.watch_prefix(netsat_model::Keys::etchosts_prefix().to_owned());

        while let Some(item) = stream.next().await {
            match item {
                WatchItem::Event(ev) => self.handle_event(ev.kind, &ev.key, ev.value).await,
                WatchItem::Resync => self.initial_scan().await,
            }
        }

        Ok(())
    }

    async fn initial_scan(&self) {
        let all = match self.store.get_prefix(netsat_model::Keys::etchosts_prefix()).await {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(error = %e, "initial etchosts scan failed");
                return;
            }
        };

        let mut entries = self.entries.lock().await;
        entries.clear();

        for (key, value) in all {
            if let Ok(entry) = serde_json::from_slice::<HostEntry>(&value) {
                entries.insert(key, entry);
            }
        }

        drop(entries);

        if let Err(e) = self.rewrite().await {
            tracing::warn!(error = %e, "failed to rewrite /etc/hosts after initial scan");
        }
    }

    async fn handle_event(&self, kind: EventKind, key: &str, value: Option<Vec<u8>>) {
        match kind {
            EventKind::Put => {
                let Some(value) = value else { return };
                let Ok(entry) = serde_json::from_slice::<HostEntry>(&value) else {
                    tracing::warn!(key, "corrupt etchosts record, ignoring");
                    return;
                };

                self.entries.lock().await.insert(key.to_owned(), entry);
            }
            EventKind::Delete => {
                self.entries.lock().await.remove(key);
            }
        }

        if let Err(e) = self.rewrite().await {
            tracing::warn!(error = %e, key, "failed to rewrite /etc/hosts");
        }
    }

    /// Idempotent: the same set of entries always produces the same
    /// managed block, byte for byte, so repeated rewrites don't thrash the
    /// file's mtime for no reason.
    async fn rewrite(&self) -> Result<()> {
        let entries = self.entries.lock().await;

        let mut seen_names = BTreeMap::new();
        for entry in entries.values() {
            seen_names.insert(entry.name.clone(), entry.ip.clone());
        }
        drop(entries);

        let base = self.read_base().await.unwrap_or_default();

        let mut out = String::new();
        out.push_str(&base);
        if !base.is_empty() && !base.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(BLOCK_START);
        out.push('\n');
        for (name, ip) in &seen_names {
            out.push_str(&format!("{ip}\t{name}\n"));
        }
        out.push_str(BLOCK_END);
        out.push('\n');

        atomic_write(&self.path, out.as_bytes()).await
    }

    async fn read_base(&self) -> Option<String> {
        let contents = tokio::fs::read_to_string(&self.path).await.ok()?;
        let Some(start) = contents.find(BLOCK_START) else {
            return Some(contents);
        };

        Some(contents[..start].to_owned())
    }
}

/// Writes to a sibling temp file and renames over the target, so readers
/// never observe a partially-written hosts file.
async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("netsatbench-tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_model::Keys;
    use netsat_store::MemoryStore;

    #[tokio::test]
    async fn writes_a_managed_block_preserving_the_rest_of_the_file() {
        let dir = tempdir("writes-managed-block");
        let path = dir.join("hosts");
        tokio::fs::write(&path, "127.0.0.1\tlocalhost\n").await.unwrap();

        let store = MemoryStore::new();
        store
            .put(&Keys::etchosts(&"sat1".into()), serde_json::to_vec(&HostEntry { ip: "10.0.0.1".into(), name: "sat1".into() }).unwrap())
            .await
            .unwrap();

        let reconciler = EtcHostsReconciler::new(store, path.clone());
        reconciler.initial_scan().await;

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(written.contains("10.0.0.1\tsat1"));
        assert!(written.contains(BLOCK_START));
        assert!(written.contains(BLOCK_END));
    }

    #[tokio::test]
    async fn rewrite_is_idempotent_across_repeated_scans() {
        let dir = tempdir("rewrite-is-idempotent");
        let path = dir.join("hosts");

        let store = MemoryStore::new();
        store
            .put(&Keys::etchosts(&"sat1".into()), serde_json::to_vec(&HostEntry { ip: "10.0.0.1".into(), name: "sat1".into() }).unwrap())
            .await
            .unwrap();

        let reconciler = EtcHostsReconciler::new(store, path.clone());
        reconciler.initial_scan().await;
        let first = tokio::fs::read_to_string(&path).await.unwrap();
        reconciler.initial_scan().await;
        let second = tokio::fs::read_to_string(&path).await.unwrap();

        assert_eq!(first, second);
    }

    fn tempdir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netsatbench-etchosts-test-{}-{label}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
