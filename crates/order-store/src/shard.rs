//! Customer to shard routing.

use common::{CustomerId, MAX_SHARDS, ShardId};

use crate::{Result, StoreError};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Maps a customer to the physical partition that owns their orders.
///
/// The mapping is a pure function of the customer id and the shard count, so
/// every process in the fleet agrees on it without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u16,
}

impl ShardRouter {
    pub fn new(shard_count: u16) -> Result<Self> {
        if shard_count == 0 || shard_count > MAX_SHARDS {
            return Err(StoreError::InvalidShardConfig(format!(
                "shard count must be within 1..={MAX_SHARDS}, got {shard_count}"
            )));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    pub fn shard_for(&self, customer_id: CustomerId) -> ShardId {
        let hash = fnv1a(&customer_id.as_i64().to_le_bytes());
        ShardId::new((hash % u64::from(self.shard_count)) as u16)
    }

    /// Fails unless `shard` is served by this router.
    pub fn check(&self, shard: ShardId) -> Result<ShardId> {
        if shard.as_u16() < self.shard_count {
            Ok(shard)
        } else {
            Err(StoreError::ShardOutOfRange {
                shard,
                shard_count: self.shard_count,
            })
        }
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.shard_count).map(ShardId::new)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
