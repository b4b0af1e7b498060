//! # Index Maps
//!
//! A [`Mapping`] is the entry cache of one file: the sparse index behind its
//! index lock, the number of frames the index accounts for, and the hooks
//! into the host's page tables and device.
//!
//! Every live map is listed in a process-wide registry keyed by [`MapId`],
//! so a frame's ownership record can be resolved back to its map.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{ConfigError, EngineConfig};
use crate::entry::{Entry, OrderClass};
use crate::frame::FramePool;
use crate::host::{FlushOps, NoopHost, PageTableOps};
use crate::index::{BTreeIndex, IndexValue, SparseIndex, Tag};
use crate::stats::EngineStats;

// ============================================================================
// Map identity
// ============================================================================

/// Stable identity of a map. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u64);

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

impl MapId {
    fn next() -> Self {
        Self(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

// ============================================================================
// Registry
// ============================================================================

fn registry() -> &'static RwLock<HashMap<MapId, Weak<Mapping>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<MapId, Weak<Mapping>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Resolve a live map by id.
pub fn lookup_mapping(id: MapId) -> Option<Arc<Mapping>> {
    registry().read().get(&id).and_then(Weak::upgrade)
}

// ============================================================================
// Writeback error sequence
// ============================================================================

/// Position in a map's writeback error stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrSeq(u64);

#[derive(Debug, Default)]
struct ErrState {
    seq: u64,
    last: Option<(io::ErrorKind, String)>,
}

/// Writeback errors recorded against a map for a later sync to collect.
///
/// Each sync caller keeps its own [`ErrSeq`]; an error is reported once to
/// every caller that sampled before it was recorded.
#[derive(Debug, Default)]
pub struct WritebackErrors {
    state: Mutex<ErrState>,
}

impl WritebackErrors {
    /// Record a failed flush.
    pub fn record(&self, err: &io::Error) {
        let mut state = self.state.lock();
        state.seq += 1;
        state.last = Some((err.kind(), err.to_string()));
    }

    /// Current position, for a caller that starts watching now.
    pub fn sample(&self) -> ErrSeq {
        ErrSeq(self.state.lock().seq)
    }

    /// Report the newest error recorded after `since` and move `since` up.
    pub fn check_and_advance(&self, since: &mut ErrSeq) -> io::Result<()> {
        let state = self.state.lock();
        if state.seq == since.0 {
            return Ok(());
        }
        since.0 = state.seq;
        match &state.last {
            Some((kind, message)) => Err(io::Error::new(*kind, message.clone())),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// State protected by the index lock.
pub(crate) struct IndexState {
    pub(crate) tree: Box<dyn SparseIndex>,
    /// Frames accounted by the stored entries.
    pub(crate) nr_pages: u64,
}

/// The entry cache of one file.
pub struct Mapping {
    pub(crate) id: MapId,
    pub(crate) index: Mutex<IndexState>,
    pub(crate) frames: Arc<FramePool>,
    pub(crate) page_tables: Arc<dyn PageTableOps>,
    pub(crate) flusher: Arc<dyn FlushOps>,
    pub(crate) config: EngineConfig,
    pub(crate) wb_err: WritebackErrors,
    pub(crate) stats: EngineStats,
}

impl Mapping {
    /// Start building a map whose frames come from `frames`.
    pub fn builder(frames: Arc<FramePool>) -> MappingBuilder {
        MappingBuilder::new(frames)
    }

    /// Identity of this map.
    pub fn id(&self) -> MapId {
        self.id
    }

    /// Frame pool backing this map.
    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    /// Engine configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Frames accounted by the entries currently stored.
    pub fn nr_pages(&self) -> u64 {
        self.index.lock().nr_pages
    }

    /// Number of stored entries.
    pub fn nr_entries(&self) -> usize {
        self.index.lock().tree.len()
    }

    /// Entry covering `index` with its base and lock bit, if any.
    pub fn entry_at(&self, index: u64) -> Option<(u64, Entry, bool)> {
        match self.index.lock().tree.load(index)? {
            (base, IndexValue::Region(slot)) => Some((base, slot.entry, slot.locked)),
            (_, IndexValue::Foreign(_)) => None,
        }
    }

    /// Whether the entry covering `index` carries `tag`.
    pub fn is_tagged(&self, index: u64, tag: Tag) -> bool {
        let state = self.index.lock();
        state
            .tree
            .load(index)
            .map_or(false, |(base, _)| state.tree.get_tag(base, tag))
    }

    /// Writeback errors recorded against this map.
    pub fn wb_errors(&self) -> &WritebackErrors {
        &self.wb_err
    }

    /// Operation counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.id)
            .field("frames", &self.frames)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        registry().write().remove(&self.id);

        // Release whatever frames the entries still hold.
        let state = self.index.get_mut();
        let mut released = 0usize;
        while let Some(base) = state.tree.next_entry(0, u64::MAX) {
            if let Some(IndexValue::Region(slot)) = state.tree.erase(base) {
                self.frames.disassociate(&slot.entry, self.id, false);
            }
            released += 1;
        }
        state.nr_pages = 0;
        debug!(map = %self.id, released, "mapping dropped");
    }
}

/// Builder for [`Mapping`].
pub struct MappingBuilder {
    frames: Arc<FramePool>,
    index: Option<Box<dyn SparseIndex>>,
    page_tables: Arc<dyn PageTableOps>,
    flusher: Arc<dyn FlushOps>,
    config: EngineConfig,
}

impl MappingBuilder {
    /// Create a builder with an empty [`BTreeIndex`], a no-op host and the
    /// default configuration.
    pub fn new(frames: Arc<FramePool>) -> Self {
        Self {
            frames,
            index: None,
            page_tables: Arc::new(NoopHost),
            flusher: Arc::new(NoopHost),
            config: EngineConfig::default(),
        }
    }

    /// Use a caller-supplied sparse index.
    pub fn index(mut self, index: Box<dyn SparseIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the page-table hooks.
    pub fn page_tables(mut self, ops: Arc<dyn PageTableOps>) -> Self {
        self.page_tables = ops;
        self
    }

    /// Set the flush hook.
    pub fn flusher(mut self, ops: Arc<dyn FlushOps>) -> Self {
        self.flusher = ops;
        self
    }

    /// Use one object for both page-table and flush hooks.
    pub fn host<H>(mut self, host: Arc<H>) -> Self
    where
        H: PageTableOps + FlushOps + 'static,
    {
        self.page_tables = host.clone();
        self.flusher = host;
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration, create the map and register it.
    pub fn build(self) -> Result<Arc<Mapping>, ConfigError> {
        self.config.validate()?;
        let tree = self.index.unwrap_or_else(|| Box::new(BTreeIndex::new()));
        let nr_pages = count_pages(tree.as_ref());
        let mapping = Arc::new(Mapping {
            id: MapId::next(),
            index: Mutex::new(IndexState { tree, nr_pages }),
            frames: self.frames,
            page_tables: self.page_tables,
            flusher: self.flusher,
            config: self.config,
            wb_err: WritebackErrors::default(),
            stats: EngineStats::default(),
        });
        registry()
            .write()
            .insert(mapping.id, Arc::downgrade(&mapping));
        debug!(map = %mapping.id, nr_pages, "mapping created");
        Ok(mapping)
    }
}

/// Frames accounted by the entries of a pre-populated index.
fn count_pages(tree: &dyn SparseIndex) -> u64 {
    let mut total = 0;
    let mut cursor = 0;
    while let Some(base) = tree.next_entry(cursor, u64::MAX) {
        let order = tree.load(base).map_or(OrderClass::Small, |(_, v)| v.order());
        total += order.nr_frames();
        match base.checked_add(order.nr_frames()) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Pfn, Slot};

    fn pool() -> Arc<FramePool> {
        Arc::new(FramePool::new(Pfn(0), 1024))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Mapping::builder(pool()).build().unwrap();
        let b = Mapping::builder(pool()).build().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id().get(), 0);
    }

    #[test]
    fn test_registry_tracks_lifetime() {
        let map = Mapping::builder(pool()).build().unwrap();
        let id = map.id();
        assert!(lookup_mapping(id).is_some());
        drop(map);
        assert!(lookup_mapping(id).is_none());
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let config = EngineConfig::builder().scan_batch(0).build_unchecked();
        assert!(Mapping::builder(pool()).config(config).build().is_err());
    }

    #[test]
    fn test_prepopulated_index_is_counted() {
        let mut tree = BTreeIndex::new();
        tree.store(0, IndexValue::Region(Slot::unlocked(Entry::empty(OrderClass::Large))))
            .unwrap();
        tree.store(600, IndexValue::Region(Slot::unlocked(Entry::empty(OrderClass::Small))))
            .unwrap();

        let map = Mapping::builder(pool()).index(Box::new(tree)).build().unwrap();
        assert_eq!(map.nr_pages(), 513);
        assert_eq!(map.nr_entries(), 2);
        assert_eq!(map.entry_at(100).map(|(base, _, _)| base), Some(0));
        assert!(!map.is_tagged(100, Tag::Dirty));
    }

    #[test]
    fn test_drop_releases_frames() {
        let frames = pool();
        let map = Mapping::builder(Arc::clone(&frames)).build().unwrap();
        let entry = Entry::mapped(Pfn(5), OrderClass::Small);
        frames.associate(&entry, map.id(), 5, false).unwrap();
        map.index
            .lock()
            .tree
            .store(5, IndexValue::Region(Slot::unlocked(entry)))
            .unwrap();

        drop(map);
        assert_eq!(frames.refcount(Pfn(5)), 0);
    }

    #[test]
    fn test_errseq_reports_once_per_sampler() {
        let errs = WritebackErrors::default();
        let mut early = errs.sample();
        errs.record(&io::Error::new(io::ErrorKind::Other, "media error"));
        let mut late = errs.sample();

        let err = errs.check_and_advance(&mut early).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(errs.check_and_advance(&mut early).is_ok());
        assert!(errs.check_and_advance(&mut late).is_ok());
    }
}
