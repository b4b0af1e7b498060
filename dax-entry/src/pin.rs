//! # External Pins
//!
//! Locks a single entry by frame or by (map, index) for callers that hold a
//! frame outside the fault path, such as memory-failure handling. The lock
//! is represented by a [`PinCookie`] that unlocks on drop.
//!
//! A frame is resolved to its map through its ownership record. The record
//! can change until the owning map's index lock is held, so it is checked
//! again under that lock before the entry is locked.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::entry::{Entry, OrderClass, Pfn};
use crate::error::Result;
use crate::frame::{FramePool, Ownership};
use crate::lock::Lookup;
use crate::mapping::{lookup_mapping, Mapping};
use crate::wait_table::WakeMode;

/// Proof that one entry is locked. Unlocks on drop.
pub struct PinCookie {
    mapping: Arc<Mapping>,
    base: u64,
    entry: Entry,
    armed: bool,
}

impl PinCookie {
    /// The map holding the entry.
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Base index of the locked entry.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The locked entry.
    pub fn entry(&self) -> Entry {
        self.entry
    }

    /// Unlock the entry.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.mapping.unlock_entry(self.base, self.entry);
        }
    }
}

impl Drop for PinCookie {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PinCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinCookie")
            .field("map", &self.mapping.id())
            .field("base", &self.base)
            .field("entry", &self.entry)
            .finish()
    }
}

/// Lock the entry that maps `frame`.
///
/// Returns None when the frame is unowned, shared copy-on-write, or owned
/// by a map that no longer exists, and when its owner has no entry there.
pub fn lock_for_external_pin(pool: &FramePool, frame: Pfn) -> Result<Option<PinCookie>> {
    loop {
        let Some(owner @ Ownership::Exclusive { map, position }) = pool.ownership(frame) else {
            return Ok(None);
        };
        let Some(mapping) = lookup_mapping(map) else {
            return Ok(None);
        };

        let mut guard = mapping.index.lock();
        let lookup = mapping.get_unlocked_entry(&mut guard, position, OrderClass::Small)?;
        if pool.ownership(frame) != Some(owner) {
            // Moved while we waited; resolve again.
            mapping.put_unlocked_held(&mut guard, lookup, WakeMode::Next);
            continue;
        }
        let Lookup::Found { base, entry } = lookup else {
            return Ok(None);
        };
        mapping.lock_entry(&mut guard, base, entry)?;
        drop(guard);

        trace!(map = %mapping.id(), base, %frame, "locked for external pin");
        return Ok(Some(PinCookie { mapping, base, entry, armed: true }));
    }
}

/// Unlock an entry locked by [`lock_for_external_pin`] or
/// [`Mapping::lock_index`].
pub fn unlock_with_cookie(cookie: PinCookie) {
    cookie.unlock();
}

impl Mapping {
    /// Lock the entry covering `index`.
    ///
    /// Returns None when nothing is there or the entry is a placeholder,
    /// which is a normal state for an index that has not been faulted in.
    pub fn lock_index(self: &Arc<Self>, index: u64) -> Result<Option<PinCookie>> {
        let mut guard = self.index.lock();
        let lookup = self.get_unlocked_entry(&mut guard, index, OrderClass::Small)?;
        let Lookup::Found { base, entry } = lookup else {
            return Ok(None);
        };
        if entry.is_placeholder() {
            self.put_unlocked_held(&mut guard, lookup, WakeMode::Next);
            return Ok(None);
        }
        self.lock_entry(&mut guard, base, entry)?;
        Ok(Some(PinCookie {
            mapping: Arc::clone(self),
            base,
            entry,
            armed: true,
        }))
    }
}
