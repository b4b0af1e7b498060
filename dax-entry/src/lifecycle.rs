//! # Entry Lifecycle
//!
//! Grab-or-create, order negotiation, insertion of real backing, and removal.
//!
//! ## Order Negotiation
//!
//! ```text
//!   vacant ──grab(order)──▶ empty(order), locked ──insert──▶ mapped(order)
//!
//!   empty/zero(Large) ──grab(Small)──▶ unmap zero range, delete Large
//!                                      ──▶ retry ──▶ empty(Small), locked
//!
//!   Small entry present ──grab(Large)──▶ Fallback (caller retries at Small)
//! ```
//!
//! Only placeholders are split. A Large entry with real frames serves Small
//! requests as is.

use std::thread;

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::entry::{Entry, OrderClass, Pfn, Slot};
use crate::error::{EntryError, IndexError, Result};
use crate::index::{IndexValue, Tag};
use crate::lock::{IndexGuard, Lookup};
use crate::mapping::Mapping;
use crate::wait_table::{key_for, wait_table, WakeMode};

/// How [`EntryGuard::insert_entry`] installs new backing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertFlags {
    /// The fault writes and the write must reach writeback.
    ///
    /// Tags the stored entry `Dirty`, and also `Towrite` when combined with
    /// `cow`, so the next [`Mapping::writeback_range`] flushes it. Set it for
    /// every COW write, including a synchronous fault that flushes its own
    /// range, or the shared copy is never queued. Placeholders are never
    /// tagged.
    pub dirty: bool,
    /// The backing is shared copy-on-write with other maps.
    pub cow: bool,
    /// Install the shared zero frame instead of `frame`.
    pub zero: bool,
}

/// A locked entry. Unlocks on drop.
#[derive(Debug)]
pub struct EntryGuard<'a> {
    mapping: &'a Mapping,
    index: u64,
    base: u64,
    entry: Entry,
    armed: bool,
}

impl<'a> EntryGuard<'a> {
    fn new(mapping: &'a Mapping, index: u64, base: u64, entry: Entry) -> Self {
        Self { mapping, index, base, entry, armed: true }
    }

    /// The locked entry as currently stored.
    pub fn entry(&self) -> Entry {
        self.entry
    }

    /// Index the entry was grabbed for.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Base index of the entry.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Map the entry belongs to.
    pub fn mapping(&self) -> &'a Mapping {
        self.mapping
    }

    /// Unlock now and wake one waiter.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.mapping.unlock_entry(self.base, self.entry);
        }
    }

    /// Install backing for the locked entry and return the stored entry.
    ///
    /// A placeholder is always replaced; a backed entry only when `cow` is
    /// set. Replacing a zero placeholder, or any COW replacement, first
    /// removes the user mappings of the old region. The new frames are
    /// associated before the old ones are released, so a double claim
    /// ([`EntryError::Sigbus`]) leaves the entry as it was.
    ///
    /// `frame` is ignored when `flags.zero` is set.
    pub fn insert_entry(&mut self, frame: Pfn, flags: InsertFlags) -> Result<Entry> {
        let map = self.mapping;
        let old = self.entry;
        let order = old.order();
        let new = if flags.zero {
            Entry::zero(order)
        } else {
            Entry::mapped(frame, order)
        };

        if (flags.cow || old.is_zero()) && !flags.zero {
            map.page_tables.unmap_range(map.id, self.base, order.nr_frames());
        }

        let mut guard = map.index.lock();
        if flags.cow || old.is_placeholder() {
            map.frames.associate(&new, map.id, self.base, flags.cow)?;
            if let Err(err) = map.lock_entry(&mut guard, self.base, new) {
                map.frames.disassociate(&new, map.id, false);
                return Err(err.into());
            }
            map.frames.disassociate(&old, map.id, false);
            self.entry = new;
        }
        if flags.dirty && !self.entry.is_placeholder() {
            guard.tree.set_tag(self.base, Tag::Dirty);
            if flags.cow {
                guard.tree.set_tag(self.base, Tag::Towrite);
            }
        }
        drop(guard);

        trace!(map = %map.id, base = self.base, %old, new = %self.entry, ?flags, "inserted");
        Ok(self.entry)
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Mapping {
    /// Return the entry covering `index` at `order`, locked, creating an
    /// empty placeholder when nothing is there.
    ///
    /// # Errors
    ///
    /// - [`EntryError::Fallback`] when a smaller entry sits inside the
    ///   requested range; the index is left untouched
    /// - [`EntryError::Corrupted`] when the index holds a foreign value
    /// - [`EntryError::OutOfMemory`] when index growth keeps failing past the
    ///   configured retry limit
    /// - [`EntryError::TimedOut`] when a bounded wait expires
    pub fn grab_entry(&self, index: u64, order: OrderClass) -> Result<EntryGuard<'_>> {
        let mut nomem_retries = 0u32;
        loop {
            let mut guard = self.index.lock();
            match self.get_unlocked_entry(&mut guard, index, order)? {
                Lookup::Conflict => {
                    drop(guard);
                    self.stats.fallbacks();
                    debug!(map = %self.id, index, ?order, "smaller entry present, falling back");
                    return Err(EntryError::Fallback);
                }
                Lookup::Found { base, entry } if entry.order() > order && entry.is_placeholder() => {
                    self.downgrade(&mut guard, base, entry)?;
                    drop(guard);
                    wait_table().wake(key_for(self.id, base, entry.order()), WakeMode::All);
                }
                Lookup::Found { base, entry } => {
                    let entry = self.lock_entry(&mut guard, base, entry)?;
                    return Ok(EntryGuard::new(self, index, base, entry));
                }
                Lookup::Vacant => {
                    let base = order.align_down(index);
                    let entry = Entry::empty(order);
                    match guard.tree.store(base, IndexValue::Region(Slot::locked(entry))) {
                        Ok(()) => {
                            guard.nr_pages += order.nr_frames();
                            drop(guard);
                            self.stats.created();
                            trace!(map = %self.id, base, ?order, "created placeholder");
                            return Ok(EntryGuard::new(self, index, base, entry));
                        }
                        Err(IndexError::NoMemory) => {
                            drop(guard);
                            self.stats.nomem_retries();
                            nomem_retries += 1;
                            if self
                                .config
                                .nomem_retry_limit
                                .map_or(false, |limit| nomem_retries > limit)
                            {
                                return Err(EntryError::OutOfMemory);
                            }
                            thread::yield_now();
                        }
                    }
                }
            }
        }
    }

    /// Delete a larger placeholder so a smaller entry can take its place.
    ///
    /// Returns with the index lock held and the placeholder gone; the caller
    /// wakes its waiters once the lock is dropped.
    fn downgrade(&self, guard: &mut IndexGuard<'_>, base: u64, entry: Entry) -> Result<()> {
        let span = entry.order().nr_frames();
        // Lock it so nobody uses the placeholder while its mappings go away.
        self.lock_entry(guard, base, entry)?;
        if entry.is_zero() {
            MutexGuard::unlocked(guard, || self.page_tables.unmap_range(self.id, base, span));
        }
        self.frames.disassociate(&entry, self.id, false);
        guard.tree.erase(base);
        guard.nr_pages = guard.nr_pages.saturating_sub(span);
        self.stats.downgrades();
        debug!(map = %self.id, base, %entry, "split placeholder");
        Ok(())
    }

    /// Remove the entry covering `index`.
    ///
    /// With `require_clean`, an entry tagged `Dirty` or `Towrite` is kept and
    /// false is returned. Otherwise the entry is removed as part of a
    /// truncation. Every waiter on the entry is woken either way.
    pub fn invalidate_entry(&self, index: u64, require_clean: bool) -> Result<bool> {
        let mut guard = self.index.lock();
        let Lookup::Found { base, entry } = self.get_unlocked_entry(&mut guard, index, OrderClass::Small)? else {
            return Ok(false);
        };
        if require_clean
            && (guard.tree.get_tag(base, Tag::Dirty) || guard.tree.get_tag(base, Tag::Towrite))
        {
            drop(guard);
            self.put_unlocked(base, entry, WakeMode::All);
            return Ok(false);
        }
        self.frames.disassociate(&entry, self.id, !require_clean);
        guard.tree.erase(base);
        guard.nr_pages = guard.nr_pages.saturating_sub(entry.order().nr_frames());
        drop(guard);

        self.stats.removed();
        trace!(map = %self.id, base, %entry, require_clean, "invalidated");
        self.put_unlocked(base, entry, WakeMode::All);
        Ok(true)
    }

    /// Remove every entry covering `start..=end`, waiting for locked ones.
    ///
    /// Entries are released as truncated, so entries that were never zapped
    /// are reported. Returns the number of entries removed.
    pub fn delete_range(&self, start: u64, end: u64) -> Result<usize> {
        let mut guard = self.index.lock();
        let mut cursor = start;
        let mut removed = 0usize;
        while let Some(next) = guard.tree.next_entry(cursor, end) {
            let lookup = self.get_unlocked_entry(&mut guard, next, OrderClass::Small)?;
            let Lookup::Found { base, entry } = lookup else {
                continue;
            };
            let span = entry.order().nr_frames();
            self.frames.disassociate(&entry, self.id, true);
            guard.tree.erase(base);
            guard.nr_pages = guard.nr_pages.saturating_sub(span);
            self.stats.removed();
            removed += 1;
            self.put_unlocked_held(&mut guard, lookup, WakeMode::All);

            if removed % self.config.scan_batch == 0 {
                MutexGuard::unlocked(&mut guard, thread::yield_now);
            }
            match base.checked_add(span) {
                Some(after) => cursor = after,
                None => break,
            }
        }
        drop(guard);
        debug!(map = %self.id, start, end, removed, "deleted range");
        Ok(removed)
    }
}
