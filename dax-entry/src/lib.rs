//! # DAX Entry Engine
//!
//! Entry locking and lifecycle for the page cache of a memory-mapped,
//! byte-addressable storage device:
//!
//! - **Entry Codec**: one tagged value per cached region
//! - **Region Locks**: per-entry exclusion on top of one index lock
//! - **Wait Table**: process-wide hashed wait queues, no per-entry condvar
//! - **Lifecycle**: grab-or-create, order downgrade, insert, invalidate
//! - **COW Tracking**: frame ownership as an explicit tagged union
//! - **Writeback & Zap**: flush and idle protocols that cannot race a fault
//!
//! Page tables, the device flush and the sparse index itself belong to the
//! host and are reached through [`PageTableOps`], [`FlushOps`] and
//! [`SparseIndex`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      fault / writeback / truncate               │
//! └──────────┬──────────────────┬──────────────────┬────────────────┘
//!            │                  │                  │
//!   ┌────────▼───────┐ ┌────────▼───────┐ ┌────────▼───────┐
//!   │   lifecycle    │ │   writeback    │ │   zap / pin    │
//!   └────────┬───────┘ └────────┬───────┘ └────────┬───────┘
//!            └──────────────────┼──────────────────┘
//!                      ┌────────▼───────┐     ┌──────────────┐
//!                      │      lock      │────▶│  wait_table  │
//!                      └────────┬───────┘     └──────────────┘
//!            ┌──────────────────┼──────────────────┐
//!   ┌────────▼───────┐ ┌────────▼───────┐ ┌────────▼───────┐
//!   │    mapping     │ │     index      │ │     frame      │
//!   └────────────────┘ └────────────────┘ └────────────────┘
//!                               │
//!                      ┌────────▼───────┐
//!                      │     entry      │
//!                      └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dax_entry::{FramePool, InsertFlags, Mapping, OrderClass, Pfn};
//!
//! let frames = Arc::new(FramePool::new(Pfn(0x1000), 1024));
//! let map = Mapping::builder(frames).build().unwrap();
//!
//! let mut entry = map.grab_entry(10, OrderClass::Small).unwrap();
//! entry.insert_entry(Pfn(0x100a), InsertFlags { dirty: true, ..Default::default() }).unwrap();
//! entry.unlock();
//!
//! assert_eq!(map.nr_pages(), 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod entry;
pub mod error;
pub mod frame;
pub mod host;
pub mod index;
pub mod lifecycle;
pub mod lock;
pub mod mapping;
pub mod pin;
pub mod stats;
pub mod wait_table;
pub mod writeback;
pub mod zap;

#[cfg(test)]
mod testing;

use std::sync::Arc;

// Re-exports
pub use config::{ConfigError, EngineConfig, EngineConfigBuilder};
pub use entry::{DecodedEntry, Entry, EntryFlags, OrderClass, Pfn, Slot};
pub use error::{EntryError, IndexError, Result};
pub use frame::{FramePool, Ownership};
pub use host::{FlushOps, NoopHost, PageTableOps};
pub use index::{AtOrder, BTreeIndex, IndexValue, SparseIndex, Tag};
pub use lifecycle::{EntryGuard, InsertFlags};
pub use lock::Lookup;
pub use mapping::{lookup_mapping, ErrSeq, MapId, Mapping, MappingBuilder, WritebackErrors};
pub use pin::{lock_for_external_pin, unlock_with_cookie, PinCookie};
pub use stats::{EngineStats, StatsSnapshot};
pub use wait_table::{key_for, wait_table, WaitKey, WaitTable, WakeMode};
pub use writeback::{SyncMode, WritebackStats};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set up the process-wide wait table ahead of the first wait.
///
/// Optional: the table is created on first use otherwise.
pub fn init() -> &'static WaitTable {
    wait_table()
}

/// Build a map over `frames` configured from `DAX_*` environment variables.
///
/// See [`EngineConfig::from_env`] for the variables read.
pub fn mapping_from_env(frames: Arc<FramePool>) -> std::result::Result<Arc<Mapping>, ConfigError> {
    Mapping::builder(frames).config(EngineConfig::from_env()).build()
}
