//! Per-directory snapshot cache.
//!
//! Each directory path owns a [`DirSlot`] holding the most recently published
//! [`CacheRecord`]. Records are replaced, never mutated: a reader clones the
//! `Arc<SortedListing>` out of the slot and keeps using it no matter what is
//! published afterwards.
//!
//! Refreshes go through a two-state claim flag per slot, so at most one
//! backing-store listing per path is in flight. Callers that lose the claim
//! reuse the previously published record when there is one, and otherwise
//! wait for the winner to publish.

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{FsError, SortedListing, VPath};

/// One published snapshot of a directory.
#[derive(Debug)]
pub struct CacheRecord {
    /// The directory this record describes.
    pub path: VPath,
    /// The sorted entries.
    pub listing: Arc<SortedListing>,
    /// Slot generation at the time the refresh that produced this record
    /// was claimed. A later invalidation bumps the slot past it.
    pub generation: u64,
    /// When the backing store was last consulted for this record.
    pub verified_at: Instant,
}

const REFRESH_IDLE: u8 = 0;
const REFRESH_IN_PROGRESS: u8 = 1;

/// Result of attempting to claim a slot for refresh.
enum RefreshStatus {
    /// This caller won and must refresh. Carries the generation at claim time.
    Claimed(u64),
    /// Another caller is refreshing.
    InProgress,
}

struct DirSlot {
    record: RwLock<Option<Arc<CacheRecord>>>,
    refresh: AtomicU8,
    /// Bumped by every [`SnapshotCache::invalidate`].
    generation: AtomicU64,
    /// Wakes waiters when `refresh` returns to idle.
    notify: Notify,
}

impl DirSlot {
    fn new() -> Self {
        Self {
            record: RwLock::new(None),
            refresh: AtomicU8::new(REFRESH_IDLE),
            generation: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn current(&self) -> Option<Arc<CacheRecord>> {
        self.record
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, record: CacheRecord) {
        let previous = self
            .record
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(Arc::new(record));
        // Drop the previous record outside the lock.
        drop(previous);
    }

    fn try_claim(&self) -> RefreshStatus {
        match self.refresh.compare_exchange(
            REFRESH_IDLE,
            REFRESH_IN_PROGRESS,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => RefreshStatus::Claimed(self.generation.load(Ordering::Acquire)),
            Err(_) => RefreshStatus::InProgress,
        }
    }

    fn release_claim(&self) {
        self.refresh.store(REFRESH_IDLE, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wait until no refresh is in progress.
    ///
    /// The `Notified` future is enabled before the flag is checked so that a
    /// `notify_waiters` racing with the check is not lost.
    async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.refresh.load(Ordering::Acquire) != REFRESH_IN_PROGRESS {
                return;
            }
            notified.await;
        }
    }
}

/// Releases a refresh claim when dropped, including when the refreshing
/// future errors out or is cancelled mid-flight.
struct ClaimGuard<'a> {
    slot: &'a DirSlot,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.slot.release_claim();
    }
}

/// Slot count below which no sweep is attempted.
const SWEEP_MIN: usize = 64;

/// Map of directory path to its latest sorted snapshot.
///
/// Slots whose record has gone stale and that no caller is using are swept
/// whenever the map doubles in size since the last sweep, so directories
/// that are deleted or never revisited do not pin their listings forever.
pub struct SnapshotCache {
    dirs: scc::HashMap<VPath, Arc<DirSlot>>,
    freshness: Duration,
    /// Slot count at which the next insertion triggers a sweep.
    sweep_at: AtomicUsize,
}

impl SnapshotCache {
    /// Create an empty cache whose records stay fresh for `freshness`.
    #[must_use]
    pub fn new(freshness: Duration) -> Self {
        Self {
            dirs: scc::HashMap::new(),
            freshness,
            sweep_at: AtomicUsize::new(SWEEP_MIN),
        }
    }

    /// How long a record is served without consulting the backing store.
    #[must_use]
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    fn slot(&self, path: &VPath) -> Arc<DirSlot> {
        if let Some(slot) = self.dirs.read_sync(path, |_, v| Arc::clone(v)) {
            return slot;
        }
        let (slot, inserted) = match self.dirs.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => (Arc::clone(occ.get()), false),
            scc::hash_map::Entry::Vacant(vac) => {
                let slot = Arc::new(DirSlot::new());
                vac.insert_entry(Arc::clone(&slot));
                (slot, true)
            }
        };
        // The entry lock is released by now; sweeping takes bucket locks.
        if inserted && self.dirs.len() >= self.sweep_at.load(Ordering::Relaxed) {
            let removed = self.sweep();
            let remaining = self.dirs.len();
            self.sweep_at
                .store(SWEEP_MIN.max(remaining.saturating_mul(2)), Ordering::Relaxed);
            debug!(removed, remaining, "swept snapshot slots");
        }
        slot
    }

    /// Drop every slot whose record is missing or no longer fresh and that
    /// no caller currently holds. Returns how many were dropped.
    ///
    /// A held slot is one with a refresh in flight or a caller between
    /// creating it and claiming it; those are always kept.
    pub fn sweep(&self) -> usize {
        let before = self.dirs.len();
        self.dirs.retain_sync(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            slot.current()
                .is_some_and(|record| self.is_fresh(slot, &record))
        });
        before.saturating_sub(self.dirs.len())
    }

    fn is_fresh(&self, slot: &DirSlot, record: &CacheRecord) -> bool {
        record.generation == slot.generation.load(Ordering::Acquire)
            && record.verified_at.elapsed() < self.freshness
    }

    /// The last published listing for `path`, fresh or not. Never refreshes.
    #[must_use]
    pub fn cached(&self, path: &VPath) -> Option<Arc<SortedListing>> {
        let slot = self.dirs.read_sync(path, |_, v| Arc::clone(v))?;
        slot.current().map(|r| Arc::clone(&r.listing))
    }

    /// The last published record for `path`, fresh or not.
    #[must_use]
    pub fn record(&self, path: &VPath) -> Option<Arc<CacheRecord>> {
        let slot = self.dirs.read_sync(path, |_, v| Arc::clone(v))?;
        slot.current()
    }

    /// Return the listing for `path`, refreshing it with `refresh` if the
    /// published record is missing, expired or invalidated.
    ///
    /// `refresh` runs with no lock held. If it fails, nothing is published,
    /// the claim is released and the error is returned to this caller only.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        path: &VPath,
        refresh: F,
    ) -> Result<Arc<SortedListing>, FsError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<SortedListing, FsError>>,
    {
        let slot = self.slot(path);
        loop {
            let current = slot.current();
            if let Some(record) = &current
                && self.is_fresh(&slot, record)
            {
                trace!(%path, "snapshot hit");
                return Ok(Arc::clone(&record.listing));
            }

            match slot.try_claim() {
                RefreshStatus::Claimed(generation) => {
                    let _guard = ClaimGuard { slot: &slot };
                    debug!(%path, generation, "refreshing snapshot");
                    let listing = Arc::new(refresh().await?);
                    slot.publish(CacheRecord {
                        path: path.clone(),
                        listing: Arc::clone(&listing),
                        generation,
                        verified_at: Instant::now(),
                    });
                    return Ok(listing);
                }
                RefreshStatus::InProgress => {
                    if let Some(record) = current {
                        trace!(%path, "refresh in flight, serving prior snapshot");
                        return Ok(Arc::clone(&record.listing));
                    }
                    slot.wait_idle().await;
                    // Re-check: the refresher may have failed without publishing.
                }
            }
        }
    }

    /// Mark the record for `path` stale so the next read refreshes it.
    ///
    /// Bumping the generation also covers a refresh that is already in
    /// flight: its result is still returned to the caller that ran it, but is
    /// published under the old generation and therefore not served again.
    ///
    /// Returns `true` if the path had a slot.
    pub fn invalidate(&self, path: &VPath) -> bool {
        match self.dirs.read_sync(path, |_, v| Arc::clone(v)) {
            Some(slot) => {
                slot.generation.fetch_add(1, Ordering::AcqRel);
                debug!(%path, "snapshot invalidated");
                true
            }
            None => false,
        }
    }

    /// Drop the slot for `path` entirely.
    ///
    /// Used when the directory itself turned out not to exist, so the map
    /// does not accumulate slots for dead paths. An in-flight refresh keeps
    /// its own reference to the old slot and publishes into it harmlessly.
    pub fn evict(&self, path: &VPath) -> bool {
        self.dirs.remove_sync(path).is_some()
    }

    /// Number of directories with a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Whether no directory has a slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
