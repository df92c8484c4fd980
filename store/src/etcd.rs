use crate::backoff_stream::reconnect_backoff;
use crate::{Event, EventKind, Store, WatchItem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, TlsOptions, WatchOptions,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct StoreAuth {
    pub user: Option<String>,
    pub password: Option<String>,
    pub ca_cert_pem: Option<Vec<u8>>,
}

/// C1's production backend: a thin, reconnecting wrapper around
/// [`etcd_client::Client`].
pub struct EtcdStore {
    endpoints: Vec<String>,
    auth: StoreAuth,
    client: Arc<Mutex<Client>>,
}

impl EtcdStore {
    pub async fn connect(endpoints: Vec<String>, auth: StoreAuth) -> Result<Self> {
        let client = Self::connect_with_retry(&endpoints, &auth).await?;

        Ok(Self {
            endpoints,
            auth,
            client: Arc::new(Mutex::new(client)),
        })
    }

    fn connect_options(auth: &StoreAuth) -> ConnectOptions {
        let mut opts = ConnectOptions::new();

        if let (Some(user), Some(password)) = (&auth.user, &auth.password) {
            opts = opts.with_user(user.clone(), password.clone());
        }

        if let Some(ca) = &auth.ca_cert_pem {
            let tls = TlsOptions::new().ca_certificate(etcd_client::Certificate::from_pem(ca));
            opts = opts.with_tls(tls);
        }

        opts
    }

    async fn connect_with_retry(endpoints: &[String], auth: &StoreAuth) -> Result<Client> {
        let mut backoff = reconnect_backoff();

        loop {
            match Client::connect(endpoints, Some(Self::connect_options(auth))).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .context("exhausted retry budget connecting to the store")?;
                    tracing::warn!(error = %e, ?delay, "store connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.lock().await.clone();
        let resp = client.get(key, None).await.context("store get failed")?;

        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.lock().await.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .context("store prefix scan failed")?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| (String::from_utf8_lossy(kv.key()).into_owned(), kv.value().to_vec()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.lock().await.clone();
        client.put(key, value, None).await.context("store put failed")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.lock().await.clone();
        client.delete(key, None).await.context("store delete failed")?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<i64> {
        let mut client = self.client.lock().await.clone();
        let resp = client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .context("store prefix delete failed")?;

        Ok(resp.deleted())
    }

    fn watch(&self, key: String) -> BoxStream<'static, WatchItem> {
        self.watch_inner(key, false)
    }

    fn watch_prefix(&self, prefix: String) -> BoxStream<'static, WatchItem> {
        self.watch_inner(prefix, true)
    }
}

impl EtcdStore {
    fn watch_inner(&self, key: String, prefix: bool) -> BoxStream<'static, WatchItem> {
        let endpoints = self.endpoints.clone();
        let auth = self.auth.clone();
        let client = self.client.clone();

        async_stream::stream! {
            let mut backoff = reconnect_backoff();
            let mut resubscribe = false;

            loop {
                let watch_options = prefix.then(WatchOptions::new).map(|o| o.with_prefix());

                let mut guard = client.lock().await;
                let watch_result = guard.watch(key.clone(), watch_options).await;
                drop(guard);

                let (_watcher, mut stream) = match watch_result {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, key, "watch setup failed, reconnecting");
                        let _ = Self::reconnect(&endpoints, &auth, &client).await;
                        resubscribe = true;
                        tokio::time::sleep(backoff.next_backoff().unwrap_or(std::time::Duration::from_secs(30))).await;
                        continue;
                    }
                };

                if resubscribe {
                    yield WatchItem::Resync;
                    resubscribe = false;
                    backoff = reconnect_backoff();
                }

                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            for ev in resp.events() {
                                let Some(kv) = ev.kv() else { continue };
                                let key = String::from_utf8_lossy(kv.key()).into_owned();

                                let item = match ev.event_type() {
                                    EventType::Put => Event {
                                        kind: EventKind::Put,
                                        key,
                                        value: Some(kv.value().to_vec()),
                                    },
                                    EventType::Delete => Event {
                                        kind: EventKind::Delete,
                                        key,
                                        value: None,
                                    },
                                };

                                yield WatchItem::Event(item);
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(key, "watch stream closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, key, "watch stream error, reconnecting");
                            break;
                        }
                    }
                }

                let _ = Self::reconnect(&endpoints, &auth, &client).await;
                resubscribe = true;
            }
        }
        .boxed()
    }

    async fn reconnect(endpoints: &[String], auth: &StoreAuth, client: &Arc<Mutex<Client>>) -> Result<()> {
        let fresh = Self::connect_with_retry(endpoints, auth).await?;
        *client.lock().await = fresh;
        Ok(())
    }
}
