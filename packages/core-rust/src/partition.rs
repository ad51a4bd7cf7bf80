//! Partition hashing and consistent-hash ownership.
//!
//! UVE keys shard across a fixed number of partitions via
//! `fnv1a_hash(key) % count`. Ownership of each partition is decided by
//! rendezvous (highest-random-weight) hashing over the cluster membership:
//! every process scores each `(member, partition)` pair with the same hash,
//! so all processes agree on the owner without coordination, and a
//! membership change only moves the partitions owned by the affected member.

use std::collections::BTreeSet;

use crate::hash::fnv1a_hash;

/// Default number of partitions in the UVE key space.
pub const PARTITION_COUNT: u32 = 30;

/// Computes the partition a UVE key belongs to.
///
/// # Examples
///
/// ```
/// use alarmflow_core::partition::partition_of;
///
/// assert!(partition_of("virtual-network:vn1", 30) < 30);
/// assert_eq!(partition_of("t:k", 30), partition_of("t:k", 30));
/// ```
#[must_use]
pub fn partition_of(key: &str, count: u32) -> u32 {
    fnv1a_hash(key) % count.max(1)
}

/// Rendezvous-hash partition assigner.
///
/// Member ids are `"<host_ip>:<instance_id>"` strings. The owner of a
/// partition is the member with the highest score for it; ties break on the
/// lexicographically larger member id so the outcome stays deterministic.
#[derive(Debug, Clone)]
pub struct PartitionAssigner {
    self_id: String,
    partition_count: u32,
    members: BTreeSet<String>,
}

impl PartitionAssigner {
    #[must_use]
    pub fn new(self_id: impl Into<String>, partition_count: u32) -> Self {
        Self {
            self_id: self_id.into(),
            partition_count,
            members: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    #[must_use]
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// Replaces the membership view. Returns `true` when it changed.
    pub fn set_members<I, S>(&mut self, members: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let new: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        if new == self.members {
            return false;
        }
        self.members = new;
        true
    }

    /// The member owning `partition` under the current view, if any member
    /// is registered.
    #[must_use]
    pub fn owner_of(&self, partition: u32) -> Option<&str> {
        self.members
            .iter()
            .max_by_key(|m| (score(m, partition), m.as_str()))
            .map(String::as_str)
    }

    /// Partitions owned by this process under the current view.
    #[must_use]
    pub fn owned(&self) -> BTreeSet<u32> {
        (0..self.partition_count)
            .filter(|p| self.owner_of(*p) == Some(self.self_id.as_str()))
            .collect()
    }
}

fn score(member: &str, partition: u32) -> u32 {
    fnv1a_hash(&format!("{member}|{partition}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
