//! Typed aggregate-store client.
//!
//! Store layout, all values JSON:
//!
//! - `AGPARTS:<instance>` -- hash: partition -> epoch (acquisition time, µs)
//! - `AGPARTKEYS:<instance>:<partition>` -- set of UVE keys in the partition
//! - `AGPARTVALUES:<instance>:<partition>:<key>` -- hash: type -> value
//! - `AGPARTPUB:<instance>:<partition>` -- channel carrying JSON arrays of
//!   `{"key": .., "type": ..}` (`type == null` means whole-key removal)
//!
//! The client pins the first healthy replica from its endpoint list and
//! falls over on connection errors. Liveness is asserted by writing
//! `"<module>:<instance>" = "True"` on every successful connect; the same
//! key disappearing later signals a remote restart, after which every
//! partition's data must be rewritten under a fresh epoch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::backend::{StoreBackend, StoreConnector, StoreError, StoreOp, StoreReply};

/// One aggregated output row.
///
/// `typ == None` removes the whole key; `val == None` removes one type.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub key: String,
    pub typ: Option<String>,
    pub val: Option<Value>,
}

#[derive(Clone)]
struct Connection {
    endpoint: String,
    backend: Arc<dyn StoreBackend>,
}

/// Client over the replica list, scoped to one generator instance.
pub struct AggStoreClient {
    endpoints: Vec<String>,
    connector: Arc<dyn StoreConnector>,
    module_id: String,
    instance_id: String,
    max_out_rows: usize,
    op_timeout: Duration,
    current: Mutex<Option<Connection>>,
}

impl AggStoreClient {
    #[must_use]
    pub fn new(
        endpoints: Vec<String>,
        connector: Arc<dyn StoreConnector>,
        module_id: impl Into<String>,
        instance_id: impl Into<String>,
        max_out_rows: usize,
    ) -> Self {
        Self {
            endpoints,
            connector,
            module_id: module_id.into(),
            instance_id: instance_id.into(),
            max_out_rows: max_out_rows.max(1),
            op_timeout: Duration::from_secs(30),
            current: Mutex::new(None),
        }
    }

    fn liveness_key(&self) -> String {
        format!("{}:{}", self.module_id, self.instance_id)
    }

    fn parts_key(&self) -> String {
        format!("AGPARTS:{}", self.instance_id)
    }

    fn keys_key(&self, partition: u32) -> String {
        format!("AGPARTKEYS:{}:{partition}", self.instance_id)
    }

    fn values_key(&self, partition: u32, key: &str) -> String {
        format!("AGPARTVALUES:{}:{partition}:{key}", self.instance_id)
    }

    /// Pub channel name for a partition.
    #[must_use]
    pub fn channel(&self, partition: u32) -> String {
        format!("AGPARTPUB:{}:{partition}", self.instance_id)
    }

    /// The endpoint currently pinned, if connected.
    #[must_use]
    pub fn connected_endpoint(&self) -> Option<String> {
        self.current.lock().as_ref().map(|c| c.endpoint.clone())
    }

    /// Drops the pinned replica; the next call fails over.
    pub fn mark_down(&self) {
        *self.current.lock() = None;
    }

    async fn ensure(&self) -> Result<Connection, StoreError> {
        if let Some(c) = self.current.lock().clone() {
            return Ok(c);
        }
        for endpoint in &self.endpoints {
            let backend = match self.connector.connect(endpoint) {
                Ok(b) => b,
                Err(e) => {
                    warn!(endpoint, error = %e, "store replica unreachable");
                    continue;
                }
            };
            let conn = Connection {
                endpoint: endpoint.clone(),
                backend,
            };
            let liveness = vec![StoreOp::Set {
                key: self.liveness_key(),
                value: "True".to_string(),
            }];
            match self.run_on(&conn, liveness).await {
                Ok(_) => {
                    info!(endpoint, "connected to aggregate store");
                    *self.current.lock() = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => warn!(endpoint, error = %e, "store liveness write failed"),
            }
        }
        Err(StoreError::NoReplica)
    }

    async fn run_on(
        &self,
        conn: &Connection,
        ops: Vec<StoreOp>,
    ) -> Result<Vec<StoreReply>, StoreError> {
        match tokio::time::timeout(self.op_timeout, conn.backend.apply(ops)).await {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(e)) => {
                self.mark_down();
                Err(e)
            }
            Err(_) => {
                self.mark_down();
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }

    async fn run(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, StoreError> {
        let conn = self.ensure().await?;
        self.run_on(&conn, ops).await
    }

    /// Connects (or re-pins) a replica, asserting liveness.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoReplica`] when every endpoint is down.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.ensure().await.map(|_| ())
    }

    /// Detects a remote restart: the liveness key vanished underneath us.
    /// Re-asserts liveness and returns `true`; the caller must rewrite every
    /// partition under a fresh epoch.
    pub async fn check_restart(&self) -> Result<bool, StoreError> {
        let replies = self
            .run(vec![StoreOp::Exists {
                key: self.liveness_key(),
            }])
            .await?;
        let alive = replies[0]
            .as_bool()
            .ok_or(StoreError::BadReply("exists"))?;
        if alive {
            return Ok(false);
        }
        info!("aggregate store restart detected");
        self.run(vec![StoreOp::Set {
            key: self.liveness_key(),
            value: "True".to_string(),
        }])
        .await?;
        Ok(true)
    }

    /// Stored epoch for a partition.
    pub async fn epoch_of(&self, partition: u32) -> Result<Option<i64>, StoreError> {
        let replies = self
            .run(vec![StoreOp::HGet {
                key: self.parts_key(),
                field: partition.to_string(),
            }])
            .await?;
        let v = replies[0].as_value().ok_or(StoreError::BadReply("hget"))?;
        Ok(v.and_then(|s| s.parse().ok()))
    }

    /// Keys currently present in a partition.
    pub async fn partition_keys(&self, partition: u32) -> Result<BTreeSet<String>, StoreError> {
        let replies = self
            .run(vec![StoreOp::SMembers {
                key: self.keys_key(partition),
            }])
            .await?;
        replies[0]
            .clone()
            .into_members()
            .ok_or(StoreError::BadReply("smembers"))
    }

    /// One stored type value, parsed from JSON.
    pub async fn read_value(
        &self,
        partition: u32,
        key: &str,
        typ: &str,
    ) -> Result<Option<Value>, StoreError> {
        let replies = self
            .run(vec![StoreOp::HGet {
                key: self.values_key(partition, key),
                field: typ.to_string(),
            }])
            .await?;
        let v = replies[0].as_value().ok_or(StoreError::BadReply("hget"))?;
        Ok(v.and_then(|s| serde_json::from_str(s).ok()))
    }

    /// Subscribes to a partition's pub channel.
    pub async fn subscribe(&self, partition: u32) -> Result<broadcast::Receiver<String>, StoreError> {
        let conn = self.ensure().await?;
        Ok(conn.backend.subscribe(&self.channel(partition)))
    }

    /// Removes everything stored for a partition; optionally stamps a new
    /// epoch afterwards (acquire and reconnect paths).
    pub async fn clear_partition(
        &self,
        partition: u32,
        new_epoch: Option<i64>,
    ) -> Result<(), StoreError> {
        let replies = self
            .run(vec![
                StoreOp::HDel {
                    key: self.parts_key(),
                    field: partition.to_string(),
                },
                StoreOp::SMembers {
                    key: self.keys_key(partition),
                },
            ])
            .await?;
        let members = replies[1]
            .clone()
            .into_members()
            .ok_or(StoreError::BadReply("smembers"))?;

        let mut ops: Vec<StoreOp> = members
            .iter()
            .map(|k| StoreOp::Del {
                key: self.values_key(partition, k),
            })
            .collect();
        ops.push(StoreOp::Del {
            key: self.keys_key(partition),
        });
        if let Some(epoch) = new_epoch {
            ops.push(StoreOp::HSet {
                key: self.parts_key(),
                field: partition.to_string(),
                value: epoch.to_string(),
            });
        }
        self.run(ops).await?;
        info!(partition, ?new_epoch, "cleared partition sub-tree");
        Ok(())
    }

    /// Writes aggregated rows for a partition in pipelined batches of at
    /// most `max_out_rows`, then announces each batch on the pub channel.
    ///
    /// The stored epoch is validated first; a mismatch means a stale owner
    /// wrote before us, so the partition sub-tree is cleared and restamped
    /// before any row lands.
    pub async fn publish_batch(
        &self,
        partition: u32,
        epoch: i64,
        rows: &[OutputRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.epoch_of(partition).await? {
            None => {
                info!(partition, epoch, "partition epoch is new");
                self.run(vec![StoreOp::HSet {
                    key: self.parts_key(),
                    field: partition.to_string(),
                    value: epoch.to_string(),
                }])
                .await?;
            }
            Some(stored) if stored != epoch => {
                info!(partition, stored, epoch, "stale partition epoch; clearing");
                self.clear_partition(partition, Some(epoch)).await?;
            }
            Some(_) => {}
        }

        for chunk in rows.chunks(self.max_out_rows) {
            let mut ops = Vec::new();
            let mut pub_list = Vec::new();
            let mut check_keys = BTreeSet::new();
            for row in chunk {
                pub_list.push(json!({"key": row.key, "type": row.typ}));
                match (&row.typ, &row.val) {
                    (None, _) => {
                        debug!(partition, key = %row.key, "remove key");
                        ops.push(StoreOp::SRem {
                            key: self.keys_key(partition),
                            member: row.key.clone(),
                        });
                        ops.push(StoreOp::Del {
                            key: self.values_key(partition, &row.key),
                        });
                    }
                    (Some(typ), None) => {
                        debug!(partition, key = %row.key, typ, "remove type");
                        ops.push(StoreOp::HDel {
                            key: self.values_key(partition, &row.key),
                            field: typ.clone(),
                        });
                        check_keys.insert(row.key.clone());
                    }
                    (Some(typ), Some(val)) => {
                        debug!(partition, key = %row.key, typ, "update type");
                        ops.push(StoreOp::SAdd {
                            key: self.keys_key(partition),
                            member: row.key.clone(),
                        });
                        ops.push(StoreOp::HSet {
                            key: self.values_key(partition, &row.key),
                            field: typ.clone(),
                            value: val.to_string(),
                        });
                    }
                }
            }
            self.run(ops).await?;

            // Keys whose last type was just removed fall out of the index.
            if !check_keys.is_empty() {
                let checks: Vec<StoreOp> = check_keys
                    .iter()
                    .map(|k| StoreOp::Exists {
                        key: self.values_key(partition, k),
                    })
                    .collect();
                let replies = self.run(checks).await?;
                let mut rems = Vec::new();
                for (k, reply) in check_keys.iter().zip(replies.iter()) {
                    if reply.as_bool() == Some(false) {
                        warn!(partition, key = %k, "key has no remaining types; dropping");
                        rems.push(StoreOp::SRem {
                            key: self.keys_key(partition),
                            member: k.clone(),
                        });
                    }
                }
                if !rems.is_empty() {
                    self.run(rems).await?;
                }
            }

            let payload =
                serde_json::to_string(&pub_list).map_err(|_| StoreError::BadReply("publish"))?;
            self.run(vec![StoreOp::Publish {
                channel: self.channel(partition),
                payload,
            }])
            .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
