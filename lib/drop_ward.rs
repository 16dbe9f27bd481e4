//! Reference counting with cleanup that needs an external context.
//!
//! [`DropWard`] counts live references per key and calls a cleanup hook when a
//! key's count reaches zero. The hook is chosen at the type level by a
//! zero-sized tag implementing [`StatelessDrop`], so the ward stores nothing
//! per key beyond the count.
//!
//! The FUSE adapter uses it for kernel lookup counts: each entry reply is one
//! reference to an inode, `forget` drops references, and the tag removes the
//! inode from the inode map when none are left.
//!
//! ```ignore
//! struct PathForget;
//!
//! impl StatelessDrop<Arc<InodeMap>, InodeAddr> for PathForget {
//!     fn delete(map: &Arc<InodeMap>, ino: &InodeAddr) {
//!         map.remove(*ino);
//!     }
//! }
//!
//! let mut ward: DropWard<Arc<InodeMap>, InodeAddr, PathForget> = DropWard::new(map);
//! ward.inc(7);            // 1
//! ward.inc(7);            // 2
//! ward.dec_count(&7, 2);  // Some(0), calls PathForget::delete(&map, &7)
//! ```

use std::marker::PhantomData;

use rustc_hash::FxHashMap;

/// Cleanup hook selected by a zero-sized tag type.
pub trait StatelessDrop<Ctx, K> {
    /// Called when `key`'s count reaches zero, with the ward's context.
    ///
    /// Runs synchronously inside [`DropWard::dec`] and
    /// [`DropWard::dec_count`].
    fn delete(ctx: &Ctx, key: &K);
}

/// Per-key reference counts that call `T::delete` on reaching zero.
///
/// `T` must be zero-sized; this is checked at compile time. Not thread-safe:
/// wrap it in a mutex to share it.
#[derive(Debug, Clone)]
pub struct DropWard<Ctx, K, T> {
    map: FxHashMap<K, usize>,
    ctx: Ctx,
    _marker: PhantomData<T>,
}

impl<Ctx, K, T> DropWard<Ctx, K, T>
where
    K: Eq + std::hash::Hash,
    T: StatelessDrop<Ctx, K>,
{
    const _ASSERT_ZST: () = assert!(size_of::<T>() == 0, "T must be zero-sized");

    /// Create a ward that passes `ctx` to `T::delete`.
    pub fn new(ctx: Ctx) -> Self {
        Self {
            map: FxHashMap::default(),
            ctx,
            _marker: PhantomData,
        }
    }

    /// Add one reference to `key`. Returns the new count.
    pub fn inc(&mut self, key: K) -> usize {
        *self
            .map
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1)
    }

    /// Subtract `by` from `key`'s count (saturating).
    ///
    /// The new count is stored before `T::delete` runs and the key is removed
    /// only after it returns, so if the hook panics the key stays tracked at
    /// zero and the next decrement retries the cleanup.
    fn dec_by(&mut self, key: &K, by: usize) -> Option<usize> {
        let slot = self.map.get_mut(key)?;
        let new_count = slot.saturating_sub(by);
        *slot = new_count;
        if new_count == 0 {
            T::delete(&self.ctx, key);
            self.map.remove(key);
        }
        Some(new_count)
    }

    /// Remove one reference to `key`. `None` if the key is not tracked.
    pub fn dec(&mut self, key: &K) -> Option<usize> {
        self.dec_by(key, 1)
    }

    /// Remove `count` references to `key`. `None` if the key is not tracked.
    pub fn dec_count(&mut self, key: &K, count: usize) -> Option<usize> {
        self.dec_by(key, count)
    }

    /// Current count for `key`, or zero.
    #[must_use]
    pub fn count(&self, key: &K) -> usize {
        self.map.get(key).copied().unwrap_or(0)
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
