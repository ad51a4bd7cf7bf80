//! In-memory [`StoreBackend`] and a multi-replica test cluster.
//!
//! [`MemoryStore`] keeps strings, hashes and sets in `DashMap`s and fans
//! pub-sub messages out over `tokio::sync::broadcast`. [`MemoryStoreCluster`]
//! plays the replica list: each endpoint maps to its own store, and
//! endpoints can be marked down to exercise the client's fail-over.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;

use super::backend::{StoreBackend, StoreConnector, StoreError, StoreOp, StoreReply};

/// In-memory single-replica store.
#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, String>,
    hashes: DashMap<String, BTreeMap<String, String>>,
    sets: DashMap<String, BTreeSet<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all data, simulating a service restart (liveness keys vanish).
    pub fn wipe(&self) {
        self.strings.clear();
        self.hashes.clear();
        self.sets.clear();
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.get(key).is_some_and(|h| !h.is_empty())
            || self.sets.get(key).is_some_and(|s| !s.is_empty())
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, StoreError> {
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                StoreOp::Set { key, value } => {
                    self.strings.insert(key, value);
                    StoreReply::Unit
                }
                StoreOp::Exists { key } => StoreReply::Bool(self.exists(&key)),
                StoreOp::Del { key } => {
                    self.strings.remove(&key);
                    self.hashes.remove(&key);
                    self.sets.remove(&key);
                    StoreReply::Unit
                }
                StoreOp::HGet { key, field } => StoreReply::Value(
                    self.hashes.get(&key).and_then(|h| h.get(&field).cloned()),
                ),
                StoreOp::HSet { key, field, value } => {
                    self.hashes.entry(key).or_default().insert(field, value);
                    StoreReply::Unit
                }
                StoreOp::HDel { key, field } => {
                    if let Some(mut h) = self.hashes.get_mut(&key) {
                        h.remove(&field);
                    }
                    StoreReply::Unit
                }
                StoreOp::HGetAll { key } => StoreReply::Map(
                    self.hashes.get(&key).map(|h| h.clone()).unwrap_or_default(),
                ),
                StoreOp::SAdd { key, member } => {
                    self.sets.entry(key).or_default().insert(member);
                    StoreReply::Unit
                }
                StoreOp::SRem { key, member } => {
                    if let Some(mut s) = self.sets.get_mut(&key) {
                        s.remove(&member);
                    }
                    StoreReply::Unit
                }
                StoreOp::SMembers { key } => StoreReply::Members(
                    self.sets.get(&key).map(|s| s.clone()).unwrap_or_default(),
                ),
                StoreOp::Publish { channel, payload } => {
                    // A send only fails with no subscribers, which is fine.
                    let _ = self.channel(&channel).send(payload);
                    StoreReply::Unit
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channel(channel).subscribe()
    }
}

// ---------------------------------------------------------------------------
// MemoryStoreCluster
// ---------------------------------------------------------------------------

/// A set of named in-memory replicas for fail-over tests.
#[derive(Default)]
pub struct MemoryStoreCluster {
    stores: DashMap<String, Arc<MemoryStore>>,
    down: DashSet<String>,
}

impl MemoryStoreCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind an endpoint, created on first use.
    #[must_use]
    pub fn store(&self, endpoint: &str) -> Arc<MemoryStore> {
        Arc::clone(
            &self
                .stores
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new())),
        )
    }

    /// Marks an endpoint unreachable.
    pub fn set_down(&self, endpoint: &str, down: bool) {
        if down {
            self.down.insert(endpoint.to_string());
        } else {
            self.down.remove(endpoint);
        }
    }
}

impl StoreConnector for MemoryStoreCluster {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn StoreBackend>, StoreError> {
        if self.down.contains(endpoint) {
            return Err(StoreError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "marked down".to_string(),
            });
        }
        Ok(self.store(endpoint))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn op_set(key: &str, value: &str) -> StoreOp {
        StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn pipelined_replies_are_position_matched() {
        let store = MemoryStore::new();
        let replies = store
            .apply(vec![
                op_set("k", "v"),
                StoreOp::Exists {
                    key: "k".to_string(),
                },
                StoreOp::Exists {
                    key: "absent".to_string(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(replies[1], StoreReply::Bool(true));
        assert_eq!(replies[2], StoreReply::Bool(false));
    }

    #[tokio::test]
    async fn hash_and_set_operations() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                StoreOp::HSet {
                    key: "h".to_string(),
                    field: "f1".to_string(),
                    value: "v1".to_string(),
                },
                StoreOp::SAdd {
                    key: "s".to_string(),
                    member: "m1".to_string(),
                },
            ])
            .await
            .unwrap();

        let replies = store
            .apply(vec![
                StoreOp::HGetAll {
                    key: "h".to_string(),
                },
                StoreOp::SMembers {
                    key: "s".to_string(),
                },
            ])
            .await
            .unwrap();
        let map = replies[0].clone().into_map().unwrap();
        assert_eq!(map.get("f1").map(String::as_str), Some("v1"));
        assert!(replies[1].clone().into_members().unwrap().contains("m1"));
    }

    #[tokio::test]
    async fn empty_hash_does_not_exist() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                StoreOp::HSet {
                    key: "h".to_string(),
                    field: "f".to_string(),
                    value: "v".to_string(),
                },
                StoreOp::HDel {
                    key: "h".to_string(),
                    field: "f".to_string(),
                },
            ])
            .await
            .unwrap();
        let replies = store
            .apply(vec![StoreOp::Exists {
                key: "h".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(replies[0], StoreReply::Bool(false));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("chan");
        store
            .apply(vec![StoreOp::Publish {
                channel: "chan".to_string(),
                payload: "hello".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn cluster_failover_visibility() {
        let cluster = MemoryStoreCluster::new();
        cluster.set_down("a:1", true);
        assert!(cluster.connect("a:1").is_err());
        assert!(cluster.connect("b:1").is_ok());
        cluster.set_down("a:1", false);
        assert!(cluster.connect("a:1").is_ok());
    }
}
