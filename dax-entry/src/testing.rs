//! Test doubles shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::entry::{OrderClass, Pfn};
use crate::error::IndexError;
use crate::frame::FramePool;
use crate::host::{FlushOps, PageTableOps};
use crate::index::{AtOrder, BTreeIndex, IndexValue, SparseIndex, Tag};
use crate::mapping::{MapId, Mapping};

pub(crate) const POOL_BASE: Pfn = Pfn(0x1000);
pub(crate) const POOL_FRAMES: usize = 4096;

/// Host that records every call and can be told to fail flushes.
#[derive(Debug, Default)]
pub(crate) struct RecordingHost {
    pub(crate) unmaps: Mutex<Vec<(u64, u64)>>,
    pub(crate) protects: Mutex<Vec<(u64, u64, Pfn)>>,
    pub(crate) flushes: Mutex<Vec<(Pfn, u64)>>,
    pub(crate) fail_flushes: AtomicUsize,
}

impl PageTableOps for RecordingHost {
    fn unmap_range(&self, _map: MapId, start: u64, nr_pages: u64) {
        self.unmaps.lock().push((start, nr_pages));
    }

    fn write_protect(&self, _map: MapId, start: u64, nr_pages: u64, frame: Pfn) {
        self.protects.lock().push((start, nr_pages, frame));
    }
}

impl FlushOps for RecordingHost {
    fn flush(&self, frame: Pfn, nr_frames: u64) -> io::Result<()> {
        let failing = self
            .fail_flushes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::Other, "media error"));
        }
        self.flushes.lock().push((frame, nr_frames));
        Ok(())
    }
}

/// Index whose first `failures` inserts at a new base report `NoMemory`.
#[derive(Debug, Default)]
pub(crate) struct FlakyIndex {
    inner: BTreeIndex,
    failures: usize,
}

impl FlakyIndex {
    pub(crate) fn new(failures: usize) -> Self {
        Self { inner: BTreeIndex::new(), failures }
    }
}

impl SparseIndex for FlakyIndex {
    fn load(&self, index: u64) -> Option<(u64, IndexValue)> {
        self.inner.load(index)
    }

    fn load_at_order(&self, index: u64, order: OrderClass) -> AtOrder {
        self.inner.load_at_order(index, order)
    }

    fn store(&mut self, base: u64, value: IndexValue) -> Result<(), IndexError> {
        let replacing = matches!(self.inner.load(base), Some((b, _)) if b == base);
        if !replacing && self.failures > 0 {
            self.failures -= 1;
            return Err(IndexError::NoMemory);
        }
        self.inner.store(base, value)
    }

    fn erase(&mut self, base: u64) -> Option<IndexValue> {
        self.inner.erase(base)
    }

    fn get_tag(&self, base: u64, tag: Tag) -> bool {
        self.inner.get_tag(base, tag)
    }

    fn set_tag(&mut self, base: u64, tag: Tag) {
        self.inner.set_tag(base, tag)
    }

    fn clear_tag(&mut self, base: u64, tag: Tag) {
        self.inner.clear_tag(base, tag)
    }

    fn next_entry(&self, from: u64, last: u64) -> Option<u64> {
        self.inner.next_entry(from, last)
    }

    fn next_tagged(&self, from: u64, last: u64, tag: Tag) -> Option<u64> {
        self.inner.next_tagged(from, last, tag)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

pub(crate) fn frame_pool() -> Arc<FramePool> {
    Arc::new(FramePool::new(POOL_BASE, POOL_FRAMES))
}

/// A map over a fresh pool with a recording host.
pub(crate) fn mapping() -> (Arc<Mapping>, Arc<RecordingHost>) {
    mapping_with(EngineConfig::default())
}

pub(crate) fn mapping_with(config: EngineConfig) -> (Arc<Mapping>, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::default());
    let map = Mapping::builder(frame_pool())
        .host(Arc::clone(&host))
        .config(config)
        .build()
        .unwrap();
    (map, host)
}
