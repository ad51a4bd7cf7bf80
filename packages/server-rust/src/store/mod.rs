//! Aggregate store client layer.
//!
//! [`backend`] defines the primitive operation set and replica connector,
//! [`memory`] implements them in-process, and [`client`] adds the
//! service-specific namespaces, epoch handling and batch publication.

pub mod backend;
pub mod client;
pub mod memory;

pub use backend::{StoreBackend, StoreConnector, StoreError, StoreOp, StoreReply};
pub use client::{AggStoreClient, OutputRow};
pub use memory::{MemoryStore, MemoryStoreCluster};
