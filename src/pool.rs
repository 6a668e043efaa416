//! Bounded free lists for commands and parameters.
//!
//! Renting never waits: an empty list allocates a new object. Returning never waits
//! either: a full list drops the object. Both lists sit on
//! [`deadpool::unmanaged::Pool`], whose internal semaphore keeps concurrent rent and
//! return consistent without a global lock.

mod command;

pub use command::{CommandPool, RentedCommand};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use deadpool::unmanaged::{Object, Pool};
use tracing::trace;

/// Counters describing one free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    /// Idle objects currently held for reuse.
    pub retained: usize,
    /// Objects allocated because the list was empty.
    pub created: u64,
    /// Objects dropped on return because the list was full.
    pub discarded: u64,
}

/// A bounded free list of reusable objects.
pub struct ObjectPool<T> {
    name: &'static str,
    capacity: usize,
    free: Option<Pool<T>>,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<T> ObjectPool<T> {
    /// A capacity of zero disables retention entirely.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            free: (capacity > 0).then(|| Pool::new(capacity)),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Take an idle object, or build one with `make`.
    pub fn rent(&self, make: impl FnOnce() -> T) -> T {
        if let Some(free) = &self.free
            && let Ok(object) = free.try_get()
        {
            return Object::take(object);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        make()
    }

    /// Hand an object back; the caller must already have reset it.
    pub fn give_back(&self, item: T) {
        let rejected = match &self.free {
            Some(free) => free.try_add(item).err().map(|(item, _)| item),
            None => Some(item),
        };
        if let Some(item) = rejected {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!(pool = self.name, capacity = self.capacity, "free list full, dropping object");
            drop(item);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            retained: self.free.as_ref().map_or(0, |free| free.status().size),
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_until_capacity_then_discards() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new("bytes", 1);
        let first = pool.rent(Vec::new);
        let second = pool.rent(Vec::new);
        pool.give_back(first);
        pool.give_back(second);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.discarded, 1);

        let _reused = pool.rent(Vec::new);
        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.stats().retained, 0);
    }

    #[test]
    fn zero_capacity_never_retains() {
        let pool: ObjectPool<u32> = ObjectPool::new("none", 0);
        pool.give_back(pool.rent(|| 1));
        assert_eq!(pool.stats().retained, 0);
        assert_eq!(pool.stats().discarded, 1);
    }
}
