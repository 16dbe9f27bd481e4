//! Handles issued to the kernel for open files and directories.
//!
//! A [`Handle`] packs a slot index and that slot's generation into one `u64`.
//! Every reuse of a slot bumps its generation, so a token from a released
//! handle can never resolve to a resource opened later in the same slot. A
//! slot whose generation would wrap is retired instead of reused.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::FsError;

/// Opaque token for an open resource, as handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// Reinterpret a raw token received from the kernel.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token to give to the kernel. Never zero.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }

    fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    fn index(self) -> usize {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "lower half of a u64 fits in usize on supported targets"
        )]
        let index = (self.0 & u64::from(u32::MAX)) as usize;
        index
    }

    fn generation(self) -> u32 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "upper half of a u64 always fits in u32"
        )]
        let generation = (self.0 >> 32) as u32;
        generation
    }
}

struct Slot<R> {
    /// Starts at 1 so that no token is ever 0.
    generation: u32,
    resource: Option<Arc<R>>,
}

struct Arena<R> {
    slots: Vec<Slot<R>>,
    free: Vec<u32>,
    live: usize,
}

/// Owner of every open resource.
///
/// The lock is held only for index bookkeeping. Resources are dropped after
/// it is released, so closing a backing descriptor never blocks other
/// handle operations.
pub struct HandleTable<R> {
    arena: Mutex<Arena<R>>,
}

impl<R> Default for HandleTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> HandleTable<R> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Store `resource` and return a fresh handle for it.
    ///
    /// Fails with `EMFILE` only when every one of the 2^32 slots is either
    /// live or retired.
    pub fn create(&self, resource: R) -> Result<Handle, FsError> {
        let resource = Arc::new(resource);
        let mut arena = self.arena.lock();
        let handle = if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.resource = Some(resource);
            Handle::new(index, slot.generation)
        } else {
            let Ok(index) = u32::try_from(arena.slots.len()) else {
                warn!("handle table exhausted");
                return Err(FsError::Io(std::io::Error::from_raw_os_error(
                    libc::EMFILE,
                )));
            };
            arena.slots.push(Slot {
                generation: 1,
                resource: Some(resource),
            });
            Handle::new(index, 1)
        };
        arena.live += 1;
        Ok(handle)
    }

    /// The resource behind `handle`, or `None` if it is unknown or released.
    #[must_use]
    pub fn resolve(&self, handle: Handle) -> Option<Arc<R>> {
        let arena = self.arena.lock();
        let slot = arena.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.resource.clone()
    }

    /// Release `handle`. Returns `false` if it was already released or was
    /// never issued; that is not an error.
    ///
    /// Outstanding `Arc`s returned by [`resolve`](Self::resolve) keep the
    /// resource alive until the operations holding them finish.
    pub fn destroy(&self, handle: Handle) -> bool {
        let removed = {
            let mut arena = self.arena.lock();
            let index = handle.index();
            let Some(slot) = arena.slots.get_mut(index) else {
                return false;
            };
            if slot.generation != handle.generation() {
                return false;
            }
            let Some(resource) = slot.resource.take() else {
                return false;
            };
            let retired = slot.generation == u32::MAX;
            if !retired {
                slot.generation += 1;
            }
            arena.live -= 1;
            if !retired {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "index came from a u32 handle field"
                )]
                arena.free.push(index as u32);
            }
            resource
        };
        drop(removed);
        true
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    /// Whether no handle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
