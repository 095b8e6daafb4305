//! Snowflake-style id generator.
//!
//! Layout (63 bits, always positive):
//! ```text
//! | 41 bits millis since EPOCH | 6 bits shard | 6 bits worker | 10 bits sequence |
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::IdError;
use crate::types::{OrderId, OrderNo, ShardId};

/// 2024-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const SEQUENCE_BITS: u32 = 10;
const WORKER_BITS: u32 = 6;
const SHARD_BITS: u32 = 6;

pub(crate) const WORKER_SHIFT: u32 = SEQUENCE_BITS;
pub(crate) const SHARD_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS + SHARD_BITS;

const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
pub(crate) const SHARD_MASK: i64 = (1 << SHARD_BITS) - 1;

/// Number of shards addressable by the id layout.
pub const MAX_SHARDS: u16 = 1 << SHARD_BITS;

/// Number of distinct generator instances.
pub const MAX_WORKERS: u16 = 1 << WORKER_BITS;

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// Generates globally unique order ids that carry their shard.
///
/// Uniqueness across processes requires every instance to run with a
/// distinct `worker_id`.
#[derive(Debug)]
pub struct IdGenerator {
    worker_id: u16,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new(worker_id: u16) -> Result<Self, IdError> {
        if worker_id >= MAX_WORKERS {
            return Err(IdError::WorkerOutOfRange {
                worker: worker_id,
                max: MAX_WORKERS - 1,
            });
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Generates the next id for an order living on `shard`.
    pub fn next_id(&self, shard: ShardId) -> Result<OrderId, IdError> {
        if shard.as_u16() >= MAX_SHARDS {
            return Err(IdError::ShardOutOfRange {
                shard: shard.as_u16(),
                max: MAX_SHARDS - 1,
            });
        }

        let mut state = self.state.lock();
        // A clock that steps backwards is pinned to the last observed millisecond.
        let mut now = current_millis().max(state.last_ms);

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let raw = ((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | ((shard.as_u16() as i64) << SHARD_SHIFT)
            | ((self.worker_id as i64) << WORKER_SHIFT)
            | state.sequence;
        Ok(OrderId::from_raw(raw))
    }

    /// Generates an id and its order number in one step.
    pub fn next_order(&self, shard: ShardId) -> Result<(OrderId, OrderNo), IdError> {
        let id = self.next_id(shard)?;
        Ok((id, OrderNo::generate(id, Utc::now())))
    }
}

/// Returns the creation time encoded in an id.
pub fn timestamp_of(id: OrderId) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((id.as_i64() >> TIMESTAMP_SHIFT) + EPOCH_MS)
}

fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let generator = IdGenerator::new(1).unwrap();
        let shard = ShardId::new(2);

        let ids: Vec<OrderId> = (0..5000).map(|_| generator.next_id(shard).unwrap()).collect();

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ids_embed_shard() {
        let generator = IdGenerator::new(7).unwrap();
        for shard in [0u16, 1, 17, 63] {
            let id = generator.next_id(ShardId::new(shard)).unwrap();
            assert_eq!(id.shard(), ShardId::new(shard));
            assert!(id.as_i64() > 0);
        }
    }

    #[test]
    fn rejects_out_of_range_shard_and_worker() {
        assert!(matches!(
            IdGenerator::new(MAX_WORKERS),
            Err(IdError::WorkerOutOfRange { .. })
        ));

        let generator = IdGenerator::new(0).unwrap();
        assert!(matches!(
            generator.next_id(ShardId::new(MAX_SHARDS)),
            Err(IdError::ShardOutOfRange { .. })
        ));
    }

    #[test]
    fn concurrent_generation_never_collides() {
        let generator = Arc::new(IdGenerator::new(3).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..2000)
                        .map(|_| generator.next_id(ShardId::new(1)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 8000);
    }

    #[test]
    fn next_order_number_matches_id() {
        let generator = IdGenerator::new(0).unwrap();
        let (id, no) = generator.next_order(ShardId::new(9)).unwrap();
        assert_eq!(no.order_id(), id);
        assert_eq!(no.shard(), ShardId::new(9));
    }

    #[test]
    fn timestamp_is_recoverable() {
        let generator = IdGenerator::new(0).unwrap();
        let before = Utc::now().timestamp_millis();
        let id = generator.next_id(ShardId::new(0)).unwrap();
        let ts = timestamp_of(id).unwrap().timestamp_millis();
        assert!(ts >= before - 1);
    }
}
