//! Per-map operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters kept by every [`Mapping`](crate::mapping::Mapping).
#[derive(Debug, Default)]
pub struct EngineStats {
    waits: AtomicU64,
    fallbacks: AtomicU64,
    downgrades: AtomicU64,
    nomem_retries: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
    flushed: AtomicU64,
    zapped: AtomicU64,
    busy: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sleeps on a locked entry.
    pub waits: u64,
    /// Grabs that returned `Fallback`.
    pub fallbacks: u64,
    /// Placeholders split to satisfy a smaller request.
    pub downgrades: u64,
    /// Index growth failures that were retried.
    pub nomem_retries: u64,
    /// Placeholder entries created.
    pub created: u64,
    /// Entries removed by invalidation or range deletion.
    pub removed: u64,
    /// Regions flushed by writeback.
    pub flushed: u64,
    /// Entries zapped.
    pub zapped: u64,
    /// Busy frames reported by zap scans.
    pub busy: u64,
}

macro_rules! counter {
    ($($name:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Read every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counter!(waits, fallbacks, downgrades, nomem_retries, created, removed, flushed, zapped, busy);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = EngineStats::default();
        stats.waits();
        stats.waits();
        stats.busy();

        let snap = stats.snapshot();
        assert_eq!(snap.waits, 2);
        assert_eq!(snap.busy, 1);
        assert_eq!(snap.fallbacks, 0);
    }
}
