//! # Writeback
//!
//! Flushes dirty regions to stable media without racing a fault that is
//! redirtying the same region.
//!
//! ## Protocol
//!
//! 1. Copy `Dirty` to `Towrite` over the range, so entries dirtied after
//!    this point are left for the next pass.
//! 2. For each `Towrite` entry: wait until it is unlocked, check it is still
//!    the entry that was tagged, then lock it and clear `Towrite` with the
//!    index lock held.
//! 3. Drop the index lock, write-protect and flush the region.
//! 4. Retake the index lock, unlock the entry, clear `Dirty`, wake one waiter.
//!
//! A fault that wants to redirty the region has to lock the entry first, so
//! it either runs before step 2 or after step 4, and its `Dirty` tag is
//! never cleared without a flush.

use std::thread;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::entry::{Entry, OrderClass};
use crate::error::{EntryError, Result};
use crate::index::{IndexValue, Tag};
use crate::lock::{IndexGuard, Lookup};
use crate::mapping::Mapping;
use crate::wait_table::{key_for, wait_table, WakeMode};

/// Which writeback is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Background writeback with nothing to wait for. Does no work.
    #[default]
    None,
    /// Data integrity sync: flush every dirty entry in range.
    All,
}

/// What one writeback pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritebackStats {
    /// Entries copied from `Dirty` to `Towrite`.
    pub tagged: usize,
    /// Entries flushed.
    pub flushed: usize,
    /// Tagged entries skipped because they changed or were already handled.
    pub skipped: usize,
}

enum Outcome {
    Flushed,
    Skipped,
}

impl Mapping {
    /// Flush every dirty entry covering `start..=end`.
    ///
    /// A flush failure stops the pass, is recorded on the map's
    /// [`WritebackErrors`](crate::mapping::WritebackErrors) and is returned.
    /// The failed entry keeps its `Dirty` tag.
    pub fn writeback_range(&self, start: u64, end: u64, mode: SyncMode) -> Result<WritebackStats> {
        let mut stats = WritebackStats::default();
        if mode == SyncMode::None {
            return Ok(stats);
        }

        let mut guard = self.index.lock();
        stats.tagged = self.tag_for_writeback(&mut guard, start, end);

        let mut cursor = start;
        let mut scanned = 0usize;
        while let Some(base) = guard.tree.next_tagged(cursor, end, Tag::Towrite) {
            let tagged = match guard.tree.load(base) {
                Some((_, IndexValue::Region(slot))) => slot,
                Some((_, IndexValue::Foreign(raw))) => {
                    warn!(map = %self.id, base, raw, "tagged value is not an entry");
                    return Err(EntryError::Corrupted { index: base });
                }
                None => break,
            };
            let span = tagged.entry.order().nr_frames();

            match self.writeback_one(&mut guard, base, tagged.entry, tagged.is_locked()) {
                Ok(Outcome::Flushed) => stats.flushed += 1,
                Ok(Outcome::Skipped) => stats.skipped += 1,
                Err(err) => {
                    drop(guard);
                    if let EntryError::Flush { source, .. } = &err {
                        self.wb_err.record(source);
                    }
                    warn!(map = %self.id, base, %err, "writeback failed");
                    return Err(err);
                }
            }

            scanned += 1;
            if scanned % self.config.scan_batch == 0 {
                MutexGuard::unlocked(&mut guard, thread::yield_now);
            }
            match base.checked_add(span) {
                Some(after) => cursor = after,
                None => break,
            }
        }
        drop(guard);

        debug!(map = %self.id, start, end, ?stats, "writeback done");
        Ok(stats)
    }

    /// Copy `Dirty` to `Towrite` over the range. Returns how many were tagged.
    fn tag_for_writeback(&self, guard: &mut IndexGuard<'_>, start: u64, end: u64) -> usize {
        let mut cursor = start;
        let mut tagged = 0usize;
        while let Some(base) = guard.tree.next_tagged(cursor, end, Tag::Dirty) {
            guard.tree.set_tag(base, Tag::Towrite);
            tagged += 1;
            if tagged % self.config.scan_batch == 0 {
                MutexGuard::unlocked(guard, thread::yield_now);
            }
            let span = guard
                .tree
                .load(base)
                .map_or(OrderClass::Small, |(_, v)| v.order())
                .nr_frames();
            match base.checked_add(span) {
                Some(after) => cursor = after,
                None => break,
            }
        }
        tagged
    }

    fn writeback_one(
        &self,
        guard: &mut IndexGuard<'_>,
        base: u64,
        tagged: Entry,
        locked: bool,
    ) -> Result<Outcome> {
        let mut entry = tagged;
        if locked {
            let lookup = self.get_unlocked_entry(guard, base, OrderClass::Small)?;
            let current = match lookup {
                // Punched out, or replaced by an entry at another base.
                Lookup::Found { base: b, entry } if b == base => entry,
                _ => {
                    self.put_unlocked_held(guard, lookup, WakeMode::Next);
                    return Ok(Outcome::Skipped);
                }
            };
            if current.frame() != tagged.frame() {
                self.put_unlocked_held(guard, lookup, WakeMode::Next);
                return Ok(Outcome::Skipped);
            }
            if current.is_placeholder() {
                warn!(map = %self.id, base, entry = %current, "placeholder queued for writeback");
                self.put_unlocked_held(guard, lookup, WakeMode::Next);
                return Err(EntryError::Corrupted { index: base });
            }
            // Another sync already flushed it.
            if !guard.tree.get_tag(base, Tag::Towrite) {
                self.put_unlocked_held(guard, lookup, WakeMode::Next);
                return Ok(Outcome::Skipped);
            }
            entry = current;
        } else if entry.is_placeholder() {
            warn!(map = %self.id, base, %entry, "placeholder queued for writeback");
            return Err(EntryError::Corrupted { index: base });
        }

        self.lock_entry(guard, base, entry)?;
        guard.tree.clear_tag(base, Tag::Towrite);

        let nr_frames = entry.order().nr_frames();
        let result = match entry.frame() {
            Some(frame) => MutexGuard::unlocked(guard, || {
                self.page_tables.write_protect(self.id, base, nr_frames, frame);
                self.flusher
                    .flush(frame, nr_frames)
                    .map_err(|source| EntryError::Flush { frame, source })
            }),
            None => Ok(()),
        };

        let stored = self.store_unlocked(guard, base, entry);
        if result.is_ok() {
            guard.tree.clear_tag(base, Tag::Dirty);
        }
        MutexGuard::unlocked(guard, || {
            wait_table().wake(key_for(self.id, base, entry.order()), WakeMode::Next);
        });
        stored?;
        result?;

        self.stats.flushed();
        Ok(Outcome::Flushed)
    }
}
