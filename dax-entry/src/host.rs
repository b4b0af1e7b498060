//! Collaborators supplied by the surrounding filesystem and mm layer.
//!
//! The engine never touches page tables or device memory itself. It calls
//! these hooks, always without holding any map's index lock.

use std::io;

use crate::entry::Pfn;
use crate::mapping::MapId;

/// Page-table operations over every address space mapping a file.
pub trait PageTableOps: Send + Sync {
    /// Remove all user mappings of `nr_pages` file pages starting at `start`.
    fn unmap_range(&self, map: MapId, start: u64, nr_pages: u64);

    /// Write-protect the user mappings of a region so the next store faults.
    fn write_protect(&self, map: MapId, start: u64, nr_pages: u64, frame: Pfn) {
        let _ = (map, start, nr_pages, frame);
    }
}

/// Durable write-back of frame contents to media.
pub trait FlushOps: Send + Sync {
    /// Flush `nr_frames` frames starting at `frame`. Synchronous.
    fn flush(&self, frame: Pfn, nr_frames: u64) -> io::Result<()>;
}

/// Host with no page tables and an always-durable device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl PageTableOps for NoopHost {
    fn unmap_range(&self, _map: MapId, _start: u64, _nr_pages: u64) {}
}

impl FlushOps for NoopHost {
    fn flush(&self, _frame: Pfn, _nr_frames: u64) -> io::Result<()> {
        Ok(())
    }
}
