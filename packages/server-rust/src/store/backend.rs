//! Low-level store backend trait and pipelined operation types.
//!
//! The aggregate store is an external key/value service with strings,
//! hashes, sets and pub-sub. Only those primitives are modelled; everything
//! service-specific lives in the typed client on top. Operations are
//! submitted in batches through [`StoreBackend::apply`], which mirrors the
//! pipelining the wire protocol offers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("no store replica available")]
    NoReplica,
    #[error("unexpected reply shape for {0}")]
    BadReply(&'static str),
}

/// One pipelined operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Exists { key: String },
    Del { key: String },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    HGetAll { key: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    SMembers { key: String },
    Publish { channel: String, payload: String },
}

/// Reply to one pipelined operation, position-matched to the request batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Unit,
    Bool(bool),
    Value(Option<String>),
    Map(BTreeMap<String, String>),
    Members(BTreeSet<String>),
}

impl StoreReply {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_value(&self) -> Option<Option<&str>> {
        match self {
            Self::Value(v) => Some(v.as_deref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_map(self) -> Option<BTreeMap<String, String>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_members(self) -> Option<BTreeSet<String>> {
        match self {
            Self::Members(m) => Some(m),
            _ => None,
        }
    }
}

/// One store replica connection.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Executes a pipelined batch, returning one reply per operation.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, StoreError>;

    /// Subscribes to a pub-sub channel.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// Connects to a replica endpoint. The client walks its endpoint list
/// through this on every fail-over.
pub trait StoreConnector: Send + Sync {
    /// # Errors
    ///
    /// [`StoreError::Unreachable`] when the endpoint is down.
    fn connect(&self, endpoint: &str) -> Result<std::sync::Arc<dyn StoreBackend>, StoreError>;
}
