//! Thin adapter over the distributed watch/lease key-value store.
//!
//! Everything here is a plain remote call: no internal retry, no shared
//! local lock. A failed publish or read surfaces to the caller as
//! [`Error::Store`] and the caller decides what that failure is fatal to.

use std::time::Duration;

use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions, Watcher};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::DeltaBatch;

/// Handle to the store, scoped to one key prefix (which must end in `/`).
#[derive(Clone)]
pub struct KvStore {
    client: Client,
    root: String,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Connect to the store endpoints. `root` is prepended to every key
    /// this handle touches.
    pub async fn connect(endpoints: &[String], root: &str) -> Result<KvStore> {
        if !root.ends_with('/') {
            return Err(Error::Prefix(root.to_string()));
        }
        let client = Client::connect(endpoints, None).await?;
        info!(endpoints = ?endpoints, root = %root, "connected to config store");
        Ok(KvStore {
            client,
            root: root.to_string(),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// One-shot prefix read. Returns the key/value pairs plus the store
    /// revision the read was served at, for watch resume.
    pub async fn read_prefix(&self, prefix: &str) -> Result<(Vec<(String, String)>, i64)> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str()?.to_string();
            let value = kv.value_str()?.to_string();
            pairs.push((key, value));
        }
        Ok((pairs, revision))
    }

    /// Publish `value` under `key` with a lease of `ttl` seconds. The store
    /// drops the key once the lease expires; nothing ever deletes it
    /// explicitly.
    pub async fn publish_with_ttl(&self, key: &str, value: &str, ttl: i64) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl, None).await?;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
            .await?;
        debug!(key = %key, ttl, "published leased key");
        Ok(())
    }

    /// Open a long-lived watch on `prefix`, starting just after `revision`.
    pub async fn watch_prefix(&self, prefix: &str, revision: i64) -> Result<Watch> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;
        Ok(Watch {
            _watcher: watcher,
            stream,
        })
    }

    /// Publish a long-lived session key and keep its lease renewed in the
    /// background until the store rejects the renewal or the task is
    /// dropped at shutdown.
    pub async fn announce(&self, key: &str, value: &str, ttl: i64) -> Result<JoinHandle<()>> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl, None).await?;
        let lease_id = lease.id();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await?;
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        let key = key.to_string();
        let interval = Duration::from_secs((ttl as u64 / 2).max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!(key = %key, error = %e, "lease renewal failed, session key will expire");
                    return;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(_) => {
                        warn!(key = %key, "lease expired on the store side");
                        return;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "lease keep-alive stream failed");
                        return;
                    }
                }
            }
        });
        Ok(handle)
    }
}

/// A live prefix watch, consumed one delta batch at a time.
pub struct Watch {
    // Dropping the watcher cancels the server-side watch.
    _watcher: Watcher,
    stream: etcd_client::WatchStream,
}

impl Watch {
    /// Next delta batch, or `None` when the stream ends.
    pub async fn next_delta(&mut self) -> Result<Option<DeltaBatch>> {
        match self.stream.message().await? {
            Some(resp) => {
                let mut batch = DeltaBatch::default();
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = kv.key_str()?.to_string();
                    match event.event_type() {
                        EventType::Put => {
                            batch.additions.push((key, kv.value_str()?.to_string()));
                        }
                        EventType::Delete => batch.removals.push(key),
                    }
                }
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }
}

/// Normalize a comma-delimited endpoint list; hosts without an explicit
/// port get the store's default port.
pub fn sanitize_endpoints(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains(':') {
                s.to_string()
            } else {
                format!("{s}:2379")
            }
        })
        .collect()
}
