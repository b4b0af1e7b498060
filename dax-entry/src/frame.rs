//! # Frame Metadata and the Association / COW Tracker
//!
//! Every frame of the device has an [`Ownership`] record and two reference
//! counts:
//!
//! - **entry references**: one per live, non-zapped association of the
//!   frame with a region entry
//! - **pins**: external users (DMA, direct I/O) that hold the frame outside
//!   any page table
//!
//! A frame is *busy* while it has pins. Zapping drops the entry reference,
//! so an idle frame that has been zapped everywhere has a refcount of zero.
//!
//! ## Locking Context
//!
//! `associate` and `disassociate` are only called for an entry that the
//! caller holds locked, or while holding the owning map's index lock, so the
//! per-frame metadata never sees two writers for the same region.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::entry::{Entry, Pfn};
use crate::error::{EntryError, Result};
use crate::mapping::MapId;
use crate::wait_table::{key_for_frame, wait_table, WakeMode};

/// Who a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Not part of any file.
    #[default]
    Unowned,
    /// Owned by one map at one logical position.
    Exclusive {
        /// Owning map.
        map: MapId,
        /// Page offset within the owning map.
        position: u64,
    },
    /// Shared copy-on-write by `refcount` maps.
    Shared {
        /// Number of sharers.
        refcount: u64,
    },
}

#[derive(Debug, Default)]
struct FrameMeta {
    ownership: Mutex<Ownership>,
    entry_refs: AtomicU32,
    pins: AtomicU32,
}

/// Metadata for a contiguous range of device frames.
pub struct FramePool {
    base: Pfn,
    frames: Box<[FrameMeta]>,
}

impl FramePool {
    /// Create metadata for `nr_frames` frames starting at `base`.
    pub fn new(base: Pfn, nr_frames: usize) -> Self {
        let frames = (0..nr_frames).map(|_| FrameMeta::default()).collect();
        Self { base, frames }
    }

    /// First frame of the pool.
    pub fn base(&self) -> Pfn {
        self.base
    }

    /// Number of frames in the pool.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the pool has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether `frame` belongs to this pool.
    pub fn contains(&self, frame: Pfn) -> bool {
        self.meta(frame).is_some()
    }

    fn meta(&self, frame: Pfn) -> Option<&FrameMeta> {
        let offset = frame.0.checked_sub(self.base.0)?;
        self.frames.get(usize::try_from(offset).ok()?)
    }

    /// Ownership record of `frame`.
    pub fn ownership(&self, frame: Pfn) -> Option<Ownership> {
        self.meta(frame).map(|m| *m.ownership.lock())
    }

    /// Number of maps sharing `frame`; zero unless it is COW-shared.
    pub fn share_count(&self, frame: Pfn) -> u64 {
        match self.ownership(frame) {
            Some(Ownership::Shared { refcount }) => refcount,
            _ => 0,
        }
    }

    /// Total references: entry references plus pins.
    pub fn refcount(&self, frame: Pfn) -> u32 {
        self.meta(frame).map_or(0, |m| {
            m.entry_refs.load(Ordering::Acquire) + m.pins.load(Ordering::Acquire)
        })
    }

    /// External users of `frame`.
    pub fn pins(&self, frame: Pfn) -> u32 {
        self.meta(frame).map_or(0, |m| m.pins.load(Ordering::Acquire))
    }

    /// Take an external reference. Returns false for frames outside the pool.
    pub fn pin(&self, frame: Pfn) -> bool {
        match self.meta(frame) {
            Some(meta) => {
                meta.pins.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Drop an external reference, waking idle waiters on the last one.
    pub fn unpin(&self, frame: Pfn) {
        let Some(meta) = self.meta(frame) else {
            return;
        };
        let prev = meta
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                wait_table().wake(key_for_frame(frame), WakeMode::All);
            }
            Ok(_) => {}
            Err(_) => warn!(%frame, "unpin of frame without pins"),
        }
    }

    /// First frame of `entry` that still has external users.
    pub fn busy_frame(&self, entry: &Entry) -> Option<Pfn> {
        entry.frames().find(|f| self.pins(*f) > 0)
    }

    /// Attach the frames of `entry` to `map` at logical `position`.
    ///
    /// For COW the frames become shared and their sharer count goes up.
    /// Otherwise each frame must be unowned; a frame already claimed is a
    /// double mapping and fails with [`EntryError::Sigbus`], after undoing
    /// the frames claimed so far.
    pub fn associate(&self, entry: &Entry, map: MapId, position: u64, is_cow: bool) -> Result<()> {
        for (i, frame) in entry.frames().enumerate() {
            let claimed = self
                .meta(frame)
                .ok_or(EntryError::Sigbus { frame })
                .and_then(|meta| {
                    self.claim(meta, frame, map, position + i as u64, is_cow)?;
                    meta.entry_refs.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                });
            if let Err(err) = claimed {
                for undo in entry.frames().take(i) {
                    self.release(undo, map);
                }
                return Err(err);
            }
        }
        trace!(%map, position, is_cow, entry = %entry, "associated");
        Ok(())
    }

    fn claim(&self, meta: &FrameMeta, frame: Pfn, map: MapId, position: u64, is_cow: bool) -> Result<()> {
        let mut owner = meta.ownership.lock();
        *owner = match (*owner, is_cow) {
            (Ownership::Shared { refcount }, true) => Ownership::Shared { refcount: refcount + 1 },
            // A previous exclusive owner counts as the first sharer.
            (Ownership::Exclusive { .. }, true) => Ownership::Shared { refcount: 2 },
            (Ownership::Unowned, true) => Ownership::Shared { refcount: 1 },
            (Ownership::Unowned, false) => Ownership::Exclusive { map, position },
            (current, false) => {
                warn!(%frame, %map, position, ?current, "frame already owned");
                return Err(EntryError::Sigbus { frame });
            }
        };
        Ok(())
    }

    fn release(&self, frame: Pfn, map: MapId) {
        if let Some(meta) = self.meta(frame) {
            Self::drop_ownership(meta, frame, map);
            Self::put_entry_ref(meta, frame);
        }
    }

    fn drop_ownership(meta: &FrameMeta, frame: Pfn, map: MapId) {
        let mut owner = meta.ownership.lock();
        *owner = match *owner {
            Ownership::Shared { refcount } if refcount > 1 => Ownership::Shared { refcount: refcount - 1 },
            Ownership::Shared { .. } => Ownership::Unowned,
            Ownership::Exclusive { map: owner_map, .. } => {
                if owner_map != map {
                    warn!(%frame, %map, %owner_map, "disassociating frame owned by another map");
                }
                Ownership::Unowned
            }
            Ownership::Unowned => {
                warn!(%frame, %map, "disassociating unowned frame");
                Ownership::Unowned
            }
        };
    }

    fn put_entry_ref(meta: &FrameMeta, frame: Pfn) {
        let prev = meta
            .entry_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!(%frame, "entry reference underflow");
        }
    }

    /// Detach the frames of `entry` from `map`.
    ///
    /// Shared frames lose one sharer and keep their ownership while others
    /// remain. The entry's reference is dropped unless a zap already did.
    /// With `is_truncating`, a non-zapped entry or a frame that still has
    /// users is reported; the detach goes ahead regardless.
    pub fn disassociate(&self, entry: &Entry, map: MapId, is_truncating: bool) {
        if is_truncating && entry.size() > 0 && !entry.is_zapped() {
            warn!(%map, entry = %entry, "truncating an entry that was never zapped");
        }
        for frame in entry.frames() {
            let Some(meta) = self.meta(frame) else {
                warn!(%frame, %map, "disassociating frame outside the pool");
                continue;
            };
            Self::drop_ownership(meta, frame, map);
            if !entry.is_zapped() {
                Self::put_entry_ref(meta, frame);
            }
            if is_truncating && meta.pins.load(Ordering::Acquire) > 0 {
                warn!(%frame, %map, "truncating a frame that still has users");
            }
        }
        trace!(%map, is_truncating, entry = %entry, "disassociated");
    }

    /// Drop the entry reference of every frame of a non-zapped entry.
    ///
    /// Returns the zapped entry to store in its place.
    pub(crate) fn zap(&self, entry: &Entry) -> Entry {
        if entry.is_zapped() {
            return *entry;
        }
        for frame in entry.frames() {
            if let Some(meta) = self.meta(frame) {
                Self::put_entry_ref(meta, frame);
            }
        }
        entry.into_zapped()
    }

    /// Sleep until `frame` has no external users.
    ///
    /// `timeout` of None waits forever.
    pub fn wait_until_idle(&self, frame: Pfn, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let table = wait_table();
        loop {
            let handle = table.prepare(key_for_frame(frame));
            if self.pins(frame) == 0 {
                table.finish(handle);
                return Ok(());
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                table.finish(handle);
                return Err(EntryError::TimedOut);
            }
            table.sleep(&handle, deadline);
            table.finish(handle);
        }
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("len", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OrderClass;
    use std::sync::Arc;
    use std::thread;

    fn pool() -> FramePool {
        FramePool::new(Pfn(0x100), 2048)
    }

    fn map(n: u64) -> MapId {
        MapId::from_raw(n)
    }

    #[test]
    fn test_exclusive_round_trip() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x100), OrderClass::Small);
        let before = pool.refcount(Pfn(0x100));

        pool.associate(&entry, map(1), 40, false).unwrap();
        assert_eq!(
            pool.ownership(Pfn(0x100)),
            Some(Ownership::Exclusive { map: map(1), position: 40 })
        );
        assert_eq!(pool.refcount(Pfn(0x100)), before + 1);

        pool.disassociate(&entry, map(1), false);
        assert_eq!(pool.ownership(Pfn(0x100)), Some(Ownership::Unowned));
        assert_eq!(pool.refcount(Pfn(0x100)), before);
    }

    #[test]
    fn test_large_entry_positions() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x200), OrderClass::Large);
        pool.associate(&entry, map(1), 512, false).unwrap();

        assert_eq!(
            pool.ownership(Pfn(0x200 + 7)),
            Some(Ownership::Exclusive { map: map(1), position: 519 })
        );
        pool.disassociate(&entry, map(1), false);
        assert!(entry.frames().all(|f| pool.refcount(f) == 0));
    }

    #[test]
    fn test_double_claim_is_sigbus() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x100), OrderClass::Small);
        pool.associate(&entry, map(1), 0, false).unwrap();

        let err = pool.associate(&entry, map(2), 0, false).unwrap_err();
        assert!(matches!(err, EntryError::Sigbus { frame: Pfn(0x100) }));
        assert_eq!(
            pool.ownership(Pfn(0x100)),
            Some(Ownership::Exclusive { map: map(1), position: 0 })
        );
        assert_eq!(pool.refcount(Pfn(0x100)), 1);
    }

    #[test]
    fn test_partial_claim_is_undone() {
        let pool = pool();
        // Claim one frame in the middle of a large region first.
        let single = Entry::mapped(Pfn(0x300), OrderClass::Small);
        pool.associate(&single, map(9), 0, false).unwrap();

        let large = Entry::mapped(Pfn(0x200), OrderClass::Large);
        assert!(pool.associate(&large, map(1), 0, false).is_err());
        assert_eq!(pool.ownership(Pfn(0x200)), Some(Ownership::Unowned));
        assert_eq!(pool.refcount(Pfn(0x200)), 0);
        assert_eq!(pool.refcount(Pfn(0x300)), 1);
    }

    #[test]
    fn test_frame_outside_pool_is_sigbus() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x10), OrderClass::Small);
        assert!(matches!(
            pool.associate(&entry, map(1), 0, false),
            Err(EntryError::Sigbus { .. })
        ));
    }

    #[test]
    fn test_cow_share_counting() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x101), OrderClass::Small);

        pool.associate(&entry, map(1), 0, true).unwrap();
        pool.associate(&entry, map(2), 0, true).unwrap();
        assert_eq!(pool.share_count(Pfn(0x101)), 2);

        pool.disassociate(&entry, map(1), false);
        assert_eq!(pool.share_count(Pfn(0x101)), 1);
        assert_eq!(pool.ownership(Pfn(0x101)), Some(Ownership::Shared { refcount: 1 }));

        pool.disassociate(&entry, map(2), false);
        assert_eq!(pool.ownership(Pfn(0x101)), Some(Ownership::Unowned));
        assert_eq!(pool.refcount(Pfn(0x101)), 0);
    }

    #[test]
    fn test_exclusive_becomes_shared() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x102), OrderClass::Small);
        pool.associate(&entry, map(1), 5, false).unwrap();
        pool.associate(&entry, map(2), 5, true).unwrap();
        assert_eq!(pool.share_count(Pfn(0x102)), 2);
    }

    #[test]
    fn test_placeholder_has_no_frames() {
        let pool = pool();
        pool.associate(&Entry::zero(OrderClass::Large), map(1), 0, false).unwrap();
        assert_eq!(pool.refcount(Pfn(0x100)), 0);
    }

    #[test]
    fn test_zap_drops_entry_ref_once() {
        let pool = pool();
        let entry = Entry::mapped(Pfn(0x110), OrderClass::Small);
        pool.associate(&entry, map(1), 0, false).unwrap();
        assert!(pool.pin(Pfn(0x110)));

        let zapped = pool.zap(&entry);
        assert!(zapped.is_zapped());
        assert_eq!(pool.refcount(Pfn(0x110)), 1);
        assert_eq!(pool.zap(&zapped), zapped);
        assert_eq!(pool.refcount(Pfn(0x110)), 1);
        assert_eq!(pool.busy_frame(&zapped), Some(Pfn(0x110)));

        pool.unpin(Pfn(0x110));
        assert_eq!(pool.busy_frame(&zapped), None);
        pool.disassociate(&zapped, map(1), true);
        assert_eq!(pool.refcount(Pfn(0x110)), 0);
    }

    #[test]
    fn test_unpin_without_pin_is_harmless() {
        let pool = pool();
        pool.unpin(Pfn(0x100));
        assert_eq!(pool.pins(Pfn(0x100)), 0);
        assert!(!pool.pin(Pfn(0)));
    }

    #[test]
    fn test_wait_until_idle() {
        let pool = Arc::new(pool());
        let frame = Pfn(0x120);
        pool.pin(frame);

        let releaser = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.unpin(frame);
            })
        };

        pool.wait_until_idle(frame, None).unwrap();
        assert_eq!(pool.pins(frame), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_wait_until_idle_times_out() {
        let pool = pool();
        pool.pin(Pfn(0x121));
        let err = pool
            .wait_until_idle(Pfn(0x121), Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, EntryError::TimedOut));
    }
}
