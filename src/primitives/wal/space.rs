//! Log space accounting.
//!
//! Free bytes are spread over independently locked shards so concurrent
//! reservations rarely meet on the same lock. A separate padding pool holds
//! bytes set aside so the flush helper can always complete a partial page.

use parking_lot::Mutex;
use rand::Rng;
use tracing::warn;

use crate::types::{Result, WalError};

/// Number of independently locked shards.
pub const SPACE_SHARDS: usize = 16;

#[derive(Debug, Default)]
struct PaddingPool {
    available: i64,
    target: i64,
}

/// Sharded pool of free log bytes plus the padding reserve.
#[derive(Debug)]
pub struct SpaceAccountant {
    shards: Box<[Mutex<i64>]>,
    padding: Mutex<PaddingPool>,
}

impl SpaceAccountant {
    /// Splits `total` evenly across the shards; the remainder goes to shard 0.
    pub fn new(total: i64) -> Self {
        let share = total / SPACE_SHARDS as i64;
        let shards = (0..SPACE_SHARDS)
            .map(|i| {
                let extra = if i == 0 { total % SPACE_SHARDS as i64 } else { 0 };
                Mutex::new(share + extra)
            })
            .collect();
        Self {
            shards,
            padding: Mutex::new(PaddingPool::default()),
        }
    }

    /// Free bytes across all shards, excluding the padding pool.
    pub fn available(&self) -> i64 {
        self.shards.iter().map(|shard| *shard.lock()).sum()
    }

    /// Bytes currently held by the padding pool.
    pub fn padding_available(&self) -> i64 {
        self.padding.lock().available
    }

    /// Size the padding pool is kept at.
    pub fn padding_target(&self) -> i64 {
        self.padding.lock().target
    }

    /// Reserves `delta` bytes, or returns them when negative. A reservation
    /// either succeeds whole or leaves the shards untouched.
    pub fn reserve(&self, delta: i64) -> Result<()> {
        let unavailable = self.reserve_from_shards(delta);
        if unavailable == 0 {
            return Ok(());
        }
        Err(WalError::LogFull {
            requested: delta,
            available: self.available(),
        })
    }

    /// Walks the shards from a random starting point taking what each can
    /// give. Returns the amount that could not be reserved, after handing any
    /// partial take back.
    pub fn reserve_from_shards(&self, delta: i64) -> i64 {
        let start = rand::thread_rng().gen_range(0..self.shards.len());
        let mut still_to_reserve = delta;
        for step in 0..self.shards.len() {
            let index = (start + step) % self.shards.len();
            let mut shard = self.shards[index].lock();
            if still_to_reserve <= *shard {
                *shard -= still_to_reserve;
                return 0;
            }
            still_to_reserve -= *shard;
            *shard = 0;
        }
        let taken = delta - still_to_reserve;
        self.spread(taken, start);
        still_to_reserve
    }

    fn spread(&self, amount: i64, start: usize) {
        let share = amount / self.shards.len() as i64;
        for (index, shard) in self.shards.iter().enumerate() {
            let extra = if index == start {
                amount % self.shards.len() as i64
            } else {
                0
            };
            *shard.lock() += share + extra;
        }
    }

    /// Takes `delta` bytes from the padding pool, or returns them when
    /// negative. A pool driven below zero is refilled from the shards;
    /// returned bytes beyond the target flow back to the shards.
    pub fn adjust_padding(&self, delta: i64) -> Result<()> {
        let (shortfall, surplus) = {
            let mut pool = self.padding.lock();
            pool.available -= delta;
            if pool.available < 0 {
                let shortfall = -pool.available;
                pool.available = 0;
                (shortfall, 0)
            } else if pool.available > pool.target {
                let surplus = pool.available - pool.target;
                pool.available = pool.target;
                (0, surplus)
            } else {
                (0, 0)
            }
        };
        if shortfall > 0 {
            warn!(shortfall, "wal.space.padding_exhausted");
            if let Err(err) = self.reserve(shortfall) {
                self.padding.lock().available += delta - shortfall;
                return Err(err);
            }
        }
        if surplus > 0 {
            self.reserve_from_shards(-surplus);
        }
        Ok(())
    }

    /// Moves the padding target, topping the pool up from the shards when
    /// it grows. The target is left unchanged if the shards cannot cover it.
    pub fn set_padding_target(&self, target: i64) -> Result<()> {
        let previous = {
            let mut pool = self.padding.lock();
            std::mem::replace(&mut pool.target, target)
        };
        let delta = target - previous;
        if delta <= 0 {
            return Ok(());
        }
        if let Err(err) = self.reserve(delta) {
            self.padding.lock().target = previous;
            return Err(err);
        }
        self.adjust_padding(-delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remainder_lands_in_first_shard() {
        let space = SpaceAccountant::new(16 * 10 + 7);
        assert_eq!(*space.shards[0].lock(), 17);
        assert_eq!(*space.shards[1].lock(), 10);
        assert_eq!(space.available(), 167);
    }

    #[test]
    fn reservation_spanning_shards_succeeds() -> Result<()> {
        let space = SpaceAccountant::new(1600);
        space.reserve(1500)?;
        assert_eq!(space.available(), 100);
        space.reserve(-1500)?;
        assert_eq!(space.available(), 1600);
        Ok(())
    }

    #[test]
    fn failed_reservation_changes_nothing() {
        let space = SpaceAccountant::new(1600);
        let err = space.reserve(1601).unwrap_err();
        assert!(matches!(err, WalError::LogFull { requested: 1601, .. }));
        assert_eq!(space.available(), 1600);
    }

    #[test]
    fn padding_target_is_funded_from_shards() -> Result<()> {
        let space = SpaceAccountant::new(10_000);
        space.set_padding_target(4096)?;
        assert_eq!(space.padding_available(), 4096);
        assert_eq!(space.available(), 10_000 - 4096);

        space.adjust_padding(1000)?;
        assert_eq!(space.padding_available(), 3096);
        // Returned space refills padding first, the rest goes to the shards.
        space.adjust_padding(-1500)?;
        assert_eq!(space.padding_available(), 4096);
        assert_eq!(space.available(), 10_000 - 4096 + 500);
        Ok(())
    }

    #[test]
    fn exhausted_padding_borrows_from_shards() -> Result<()> {
        let space = SpaceAccountant::new(10_000);
        space.set_padding_target(100)?;
        space.adjust_padding(300)?;
        assert_eq!(space.padding_available(), 0);
        assert_eq!(space.available(), 10_000 - 300);
        Ok(())
    }

    #[test]
    fn unaffordable_target_is_rolled_back() -> Result<()> {
        let space = SpaceAccountant::new(1000);
        space.set_padding_target(400)?;
        assert!(space.set_padding_target(2000).is_err());
        assert_eq!(space.padding_target(), 400);
        assert_eq!(space.padding_available(), 400);
        assert_eq!(space.available(), 600);
        Ok(())
    }

    #[derive(Clone, Debug)]
    enum Op {
        Reserve(i64),
        Release(usize),
        Pad(i64),
        Target(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..5_000).prop_map(Op::Reserve),
            (0usize..8).prop_map(Op::Release),
            (1i64..4_096).prop_map(Op::Pad),
            (0i64..20_000).prop_map(Op::Target),
        ]
    }

    proptest! {
        #[test]
        fn space_is_conserved(ops in proptest::collection::vec(op(), 1..64)) {
            let total = 100_000i64;
            let space = SpaceAccountant::new(total);
            let mut held: Vec<i64> = Vec::new();
            let mut consumed = 0i64;
            for op in ops {
                match op {
                    Op::Reserve(n) => {
                        if space.reserve(n).is_ok() {
                            held.push(n);
                        }
                    }
                    Op::Release(i) => {
                        if !held.is_empty() {
                            let n = held.remove(i % held.len());
                            space.reserve(-n).unwrap();
                        }
                    }
                    Op::Pad(n) => {
                        if space.adjust_padding(n).is_ok() {
                            consumed += n;
                        }
                    }
                    Op::Target(t) => {
                        let _ = space.set_padding_target(t);
                    }
                }
                let outstanding: i64 = held.iter().sum::<i64>() + consumed;
                prop_assert!(space.available() >= 0);
                prop_assert!(space.padding_available() >= 0);
                prop_assert_eq!(space.available() + space.padding_available() + outstanding, total);
            }
        }
    }
}
