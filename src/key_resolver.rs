//! Partition and sort key derivation.
//!
//! The partition key spreads aggregates over a fixed number of shards;
//! the sort key addresses one row within an aggregate, with `seq_nr = 0`
//! reserved for the current-state row.

use crate::types::AggregateId;

/// Derives table keys from an aggregate id.
pub trait KeyResolver<ID: AggregateId>: Send + Sync {
    /// Partition key for the aggregate, spread over `shard_count` shards.
    fn resolve_pkey(&self, id: &ID, shard_count: u64) -> String;

    /// Sort key for the row holding `seq_nr`. `seq_nr = 0` addresses the
    /// current-state row.
    fn resolve_skey(&self, id: &ID, seq_nr: u64) -> String;
}

/// Shards by a stable FNV-1a hash of the id value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyResolver;

impl<ID: AggregateId> KeyResolver<ID> for DefaultKeyResolver {
    fn resolve_pkey(&self, id: &ID, shard_count: u64) -> String {
        let shard = fnv1a64(id.value().as_bytes()) % shard_count;
        format!("{}-{}", id.type_name(), shard)
    }

    fn resolve_skey(&self, id: &ID, seq_nr: u64) -> String {
        format!("{}-{}", id.as_string(), seq_nr)
    }
}

/// FNV-1a, 64-bit. The std hasher is seeded per process and cannot be
/// used for keys that must stay stable across deployments.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
