//! # Zap
//!
//! Forces a range idle before a destructive operation (truncate, hole punch,
//! COW unsharing).
//!
//! [`Mapping::zap_range`] unmaps the whole range first, so no new user can
//! appear, then drops each entry's frame references once and reports the
//! first frame that still has external users. The caller sleeps in
//! [`Mapping::wait_until_idle`] and scans again; [`Mapping::break_layout`]
//! runs that loop to completion.

use std::thread;

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::entry::{OrderClass, Pfn, Slot};
use crate::error::Result;
use crate::index::IndexValue;
use crate::lock::Lookup;
use crate::mapping::Mapping;
use crate::wait_table::WakeMode;

impl Mapping {
    /// Zap every entry covering `start..=end`.
    ///
    /// Returns the first frame found with external users, or None when the
    /// whole range is idle.
    pub fn zap_range(&self, start: u64, end: u64) -> Result<Option<Pfn>> {
        if end < start {
            return Ok(None);
        }
        self.page_tables
            .unmap_range(self.id, start, (end - start).saturating_add(1));

        let mut guard = self.index.lock();
        let mut cursor = start;
        let mut scanned = 0usize;
        let mut busy = None;
        while let Some(next) = guard.tree.next_entry(cursor, end) {
            let lookup = self.get_unlocked_entry(&mut guard, next, OrderClass::Small)?;
            let Lookup::Found { base, mut entry } = lookup else {
                continue;
            };
            if entry.size() > 0 && !entry.is_zapped() {
                entry = self.frames.zap(&entry);
                guard
                    .tree
                    .store(base, IndexValue::Region(Slot::unlocked(entry)))?;
                self.stats.zapped();
                trace!(map = %self.id, base, %entry, "zapped");
            }
            busy = self.frames.busy_frame(&entry);
            self.put_unlocked_held(&mut guard, Lookup::Found { base, entry }, WakeMode::Next);
            if busy.is_some() {
                break;
            }

            scanned += 1;
            if scanned % self.config.scan_batch == 0 {
                MutexGuard::unlocked(&mut guard, thread::yield_now);
            }
            match base.checked_add(entry.order().nr_frames()) {
                Some(after) => cursor = after,
                None => break,
            }
        }
        drop(guard);

        if let Some(frame) = busy {
            self.stats.busy();
            debug!(map = %self.id, start, end, %frame, "busy frame in zapped range");
        }
        Ok(busy)
    }

    /// Sleep until `frame` has no external users.
    ///
    /// Bounded by [`EngineConfig::idle_timeout`](crate::config::EngineConfig::idle_timeout).
    pub fn wait_until_idle(&self, frame: Pfn) -> Result<()> {
        self.frames.wait_until_idle(frame, self.config.idle_timeout)
    }

    /// Zap `start..=end` and wait out every busy frame until none is left.
    pub fn break_layout(&self, start: u64, end: u64) -> Result<()> {
        while let Some(frame) = self.zap_range(start, end)? {
            self.wait_until_idle(frame)?;
        }
        Ok(())
    }
}
