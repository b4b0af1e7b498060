//! # Region Lock Manager
//!
//! Per-entry mutual exclusion on top of the single index lock.
//!
//! Each stored [`Slot`] carries a lock bit. The bit is only ever read or
//! written with the index lock held, so setting it needs no atomics: any
//! thread that reaches [`Mapping::lock_entry`] has just seen the entry
//! unlocked under the same lock acquisition.
//!
//! ## State Machine
//!
//! ```text
//!             lock_entry                 unlock_entry
//!  Unlocked ─────────────▶ Locked ─────────────────────▶ Unlocked
//!                            │  ▲                           │
//!                 lookup sees│  │ wake(Next)                │
//!                   locked   ▼  │                           │
//!                          Waiting ─── recheck from top ◀───┘
//! ```
//!
//! ## Wake Discipline
//!
//! Unlocking wakes one waiter (`Next`): the rest would only find the entry
//! relocked by that waiter. A thread that was woken but does not lock the
//! entry must pass the wake on through [`Mapping::put_unlocked`]. Removal
//! wakes everyone (`All`).

use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{trace, warn};

use crate::entry::{Entry, OrderClass, Slot};
use crate::error::{EntryError, IndexError, Result};
use crate::index::{AtOrder, IndexValue};
use crate::mapping::{IndexState, Mapping};
use crate::wait_table::{key_for, wait_table, WakeMode};

/// The index lock, held.
pub(crate) type IndexGuard<'a> = MutexGuard<'a, IndexState>;

/// Outcome of an unlocked-entry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Nothing covers the index.
    Vacant,
    /// A smaller entry blocks the requested order.
    Conflict,
    /// An unlocked entry covers the index.
    Found {
        /// Base index of the entry.
        base: u64,
        /// The entry.
        entry: Entry,
    },
}

impl Lookup {
    /// Entry view of the lookup; sentinels for `Vacant` and `Conflict`.
    pub fn entry(&self) -> Entry {
        match *self {
            Lookup::Vacant => Entry::Vacant,
            Lookup::Conflict => Entry::Conflict,
            Lookup::Found { entry, .. } => entry,
        }
    }
}

impl Mapping {
    /// Find the entry covering `index` at `order`, waiting while it is locked.
    ///
    /// The index lock is held on entry and on return, but is released while
    /// sleeping, so the result reflects the index after the last wait.
    pub(crate) fn get_unlocked_entry(
        &self,
        guard: &mut IndexGuard<'_>,
        index: u64,
        order: OrderClass,
    ) -> Result<Lookup> {
        let deadline = self.config.wait_timeout.map(|t| Instant::now() + t);
        loop {
            let (base, slot) = match guard.tree.load_at_order(index, order) {
                AtOrder::Vacant => return Ok(Lookup::Vacant),
                AtOrder::Conflict => return Ok(Lookup::Conflict),
                AtOrder::Found { value: IndexValue::Foreign(raw), base } => {
                    warn!(map = %self.id, index, base, raw, "index holds a value that is not an entry");
                    return Err(EntryError::Corrupted { index });
                }
                AtOrder::Found { value: IndexValue::Region(slot), base } => (base, slot),
            };
            if !slot.is_locked() {
                return Ok(Lookup::Found { base, entry: slot.entry });
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(EntryError::TimedOut);
            }
            self.sleep_on_entry(guard, base, slot.entry.order(), deadline);
        }
    }

    /// Sleep until the entry at `base` is woken, with the index lock dropped.
    fn sleep_on_entry(
        &self,
        guard: &mut IndexGuard<'_>,
        base: u64,
        order: OrderClass,
        deadline: Option<Instant>,
    ) {
        let table = wait_table();
        // Queue before the index lock goes so the unlocker's wake is not lost.
        let handle = table.prepare(key_for(self.id, base, order));
        self.stats.waits();
        trace!(map = %self.id, base, ?order, "waiting for locked entry");
        MutexGuard::unlocked(guard, || {
            table.sleep(&handle, deadline);
        });
        table.finish(handle);
    }

    /// Set the lock bit of the unlocked `entry` stored at `base`.
    pub(crate) fn lock_entry(
        &self,
        guard: &mut IndexGuard<'_>,
        base: u64,
        entry: Entry,
    ) -> std::result::Result<Entry, IndexError> {
        guard.tree.store(base, IndexValue::Region(Slot::locked(entry)))?;
        Ok(entry)
    }

    /// Store `entry` at `base` with the lock bit clear, index lock held.
    pub(crate) fn store_unlocked(
        &self,
        guard: &mut IndexGuard<'_>,
        base: u64,
        entry: Entry,
    ) -> std::result::Result<(), IndexError> {
        match guard.tree.load(base) {
            Some((b, IndexValue::Region(slot))) if b == base && slot.is_locked() => {}
            other => warn!(map = %self.id, base, ?other, "unlocking an entry that is not locked"),
        }
        guard.tree.store(base, IndexValue::Region(Slot::unlocked(entry)))
    }

    /// Store `entry` unlocked at `base` and hand the entry to one waiter.
    pub fn unlock_entry(&self, base: u64, entry: Entry) {
        let mut guard = self.index.lock();
        if let Err(err) = self.store_unlocked(&mut guard, base, entry) {
            warn!(map = %self.id, base, %err, "failed to store unlocked entry");
        }
        drop(guard);
        wait_table().wake(key_for(self.id, base, entry.order()), WakeMode::Next);
    }

    /// Pass on a wake for an entry that was looked up but not locked.
    ///
    /// Must be called without the index lock.
    pub fn put_unlocked(&self, base: u64, entry: Entry, mode: WakeMode) {
        if matches!(entry, Entry::Vacant | Entry::Conflict) {
            return;
        }
        wait_table().wake(key_for(self.id, base, entry.order()), mode);
    }

    /// [`put_unlocked`](Self::put_unlocked) from inside a held index lock.
    pub(crate) fn put_unlocked_held(
        &self,
        guard: &mut IndexGuard<'_>,
        lookup: Lookup,
        mode: WakeMode,
    ) {
        if let Lookup::Found { base, entry } = lookup {
            MutexGuard::unlocked(guard, || self.put_unlocked(base, entry, mode));
        }
    }

    /// Wait until the entry covering `index` is unlocked and return it.
    ///
    /// The entry is left unlocked. Returns the base and entry, or None when
    /// nothing covers `index`.
    pub fn wait_entry_unlocked(&self, index: u64) -> Result<Option<(u64, Entry)>> {
        let mut guard = self.index.lock();
        let lookup = self.get_unlocked_entry(&mut guard, index, OrderClass::Small)?;
        drop(guard);
        match lookup {
            Lookup::Found { base, entry } => {
                self.put_unlocked(base, entry, WakeMode::Next);
                Ok(Some((base, entry)))
            }
            _ => Ok(None),
        }
    }
}
