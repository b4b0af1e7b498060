//! # Wait Table
//!
//! A process-wide, fixed-size table of wait queues shared by every map.
//! Threads that find an entry locked sleep on the bucket its key hashes to;
//! unrelated entries may share a bucket, so every waiter records its full
//! key and a wake only touches waiters whose key matches.
//!
//! ## Protocol
//!
//! ```text
//! waiter                                  waker
//! ------                                  -----
//! index lock held, entry seen locked
//! prepare(key)      (enqueue)
//! release index lock
//! sleep()                                 store entry unlocked
//!                                         release index lock
//!                                         wake(key, Next)
//! finish()          (dequeue)
//! retake index lock, look again
//! ```
//!
//! Because the waiter is queued before the index lock is released, a wake
//! issued after the unlock can never be missed.
//!
//! ## Allocation
//!
//! Waits happen under memory pressure, so the wait path does not allocate.
//! Every bucket queue is created with room for [`BUCKET_CAPACITY`] waiters
//! and every thread keeps one waiter record that it reuses for each wait.
//! A thread that prepares a second wait while its first is still queued
//! gets a fresh record.
//!
//! ## Lock Ordering
//!
//! A map's index lock may be held while taking a bucket lock, never the
//! other way round.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::entry::{OrderClass, Pfn};
use crate::mapping::MapId;

/// log2 of the bucket count.
pub const WAIT_TABLE_BITS: u32 = 12;

/// Number of buckets.
pub const WAIT_TABLE_ENTRIES: usize = 1 << WAIT_TABLE_BITS;

/// Waiters each bucket queue holds before it has to grow.
pub const BUCKET_CAPACITY: usize = 8;

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

/// Key space reserved for frame idle waits. Map ids start at 1.
const FRAME_SPACE: u64 = 0;

/// Identity of the thing being waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitKey {
    space: u64,
    index: u64,
}

impl WaitKey {
    /// The map (or frame space) part of the key.
    pub fn space(&self) -> u64 {
        self.space
    }

    /// The index part of the key.
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Key for an entry of `order` at `index` in `map`.
///
/// For orders of `Large` and up the index is rounded down to the region
/// boundary, so every index inside one large region shares a key.
pub fn key_for(map: MapId, index: u64, order: OrderClass) -> WaitKey {
    let index = if order >= OrderClass::Large {
        order.align_down(index)
    } else {
        index
    };
    WaitKey { space: map.get(), index }
}

/// Key for waiting on a frame to become idle.
pub fn key_for_frame(frame: Pfn) -> WaitKey {
    WaitKey { space: FRAME_SPACE, index: frame.0 }
}

/// How many matching waiters a wake releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    /// Every matching waiter.
    All,
    /// The longest-waiting matching waiter only.
    Next,
}

/// Waiter record. The key fields are written before the record is queued
/// and read under the bucket lock.
#[derive(Debug, Default)]
struct Waiter {
    space: AtomicU64,
    index: AtomicU64,
    woken: AtomicBool,
}

impl Waiter {
    fn key(&self) -> WaitKey {
        WaitKey {
            space: self.space.load(Ordering::Relaxed),
            index: self.index.load(Ordering::Relaxed),
        }
    }

    fn arm(&self, key: WaitKey) {
        self.space.store(key.space, Ordering::Relaxed);
        self.index.store(key.index, Ordering::Relaxed);
        self.woken.store(false, Ordering::Release);
    }
}

thread_local! {
    static THREAD_WAITER: Arc<Waiter> = Arc::new(Waiter::default());
}

/// This thread's waiter record, or a new one if it is still queued or held.
fn idle_waiter() -> Arc<Waiter> {
    THREAD_WAITER
        .try_with(|cached| {
            if Arc::strong_count(cached) == 1 {
                Some(Arc::clone(cached))
            } else {
                None
            }
        })
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// A queued waiter, returned by [`WaitTable::prepare`].
#[derive(Debug)]
pub struct WaitHandle {
    bucket: usize,
    waiter: Arc<Waiter>,
}

impl WaitHandle {
    /// Whether a matching wake has been delivered.
    pub fn is_woken(&self) -> bool {
        self.waiter.woken.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Bucket {
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
    cond: Condvar,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::with_capacity(BUCKET_CAPACITY)),
            cond: Condvar::new(),
        }
    }
}

/// Fixed-size table of hashed wait queues.
#[derive(Debug)]
pub struct WaitTable {
    buckets: Box<[Bucket]>,
}

impl WaitTable {
    fn new() -> Self {
        let buckets = (0..WAIT_TABLE_ENTRIES).map(|_| Bucket::default()).collect();
        Self { buckets }
    }

    /// Bucket a key hashes to. Pure function of the key.
    pub fn queue_for(key: WaitKey) -> usize {
        let h = (key.space ^ key.index).wrapping_mul(GOLDEN_RATIO_64);
        (h >> (64 - WAIT_TABLE_BITS)) as usize
    }

    /// Enqueue a waiter for `key`.
    ///
    /// Call this while still holding whatever lock protects the condition
    /// being waited on.
    pub fn prepare(&self, key: WaitKey) -> WaitHandle {
        let bucket = Self::queue_for(key);
        let waiter = idle_waiter();
        waiter.arm(key);
        self.buckets[bucket].waiters.lock().push_back(Arc::clone(&waiter));
        WaitHandle { bucket, waiter }
    }

    /// Block until woken or `deadline` passes. Returns whether a wake arrived.
    pub fn sleep(&self, handle: &WaitHandle, deadline: Option<Instant>) -> bool {
        let bucket = &self.buckets[handle.bucket];
        let mut queue = bucket.waiters.lock();
        while !handle.is_woken() {
            match deadline {
                Some(deadline) => {
                    if bucket.cond.wait_until(&mut queue, deadline).timed_out() {
                        break;
                    }
                }
                None => bucket.cond.wait(&mut queue),
            }
        }
        handle.is_woken()
    }

    /// Dequeue a waiter that was not consumed by a wake.
    pub fn finish(&self, handle: WaitHandle) {
        if handle.is_woken() {
            return;
        }
        let mut queue = self.buckets[handle.bucket].waiters.lock();
        queue.retain(|w| !Arc::ptr_eq(w, &handle.waiter));
    }

    /// Wake waiters whose key equals `key`. Returns how many were woken.
    pub fn wake(&self, key: WaitKey, mode: WakeMode) -> usize {
        let bucket = &self.buckets[Self::queue_for(key)];
        let mut queue = bucket.waiters.lock();
        let mut woken = 0;
        queue.retain(|w| {
            let hit = w.key() == key && (mode == WakeMode::All || woken == 0);
            if hit {
                w.woken.store(true, Ordering::Release);
                woken += 1;
            }
            !hit
        });
        if woken > 0 {
            bucket.cond.notify_all();
        }
        woken
    }

    /// Whether anyone is queued on `key`.
    pub fn has_waiters(&self, key: WaitKey) -> bool {
        self.buckets[Self::queue_for(key)]
            .waiters
            .lock()
            .iter()
            .any(|w| w.key() == key)
    }
}

static WAIT_TABLE: OnceLock<WaitTable> = OnceLock::new();

/// The process-wide wait table, created on first use.
pub fn wait_table() -> &'static WaitTable {
    WAIT_TABLE.get_or_init(WaitTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn map(n: u64) -> MapId {
        MapId::from_raw(n)
    }

    /// Find a key in another space that lands in the same bucket as `key`.
    fn colliding_key(key: WaitKey) -> WaitKey {
        let target = WaitTable::queue_for(key);
        (1..)
            .map(|i| WaitKey { space: key.space + 1, index: key.index + i })
            .find(|k| WaitTable::queue_for(*k) == target)
            .unwrap()
    }

    #[test]
    fn test_key_rounding() {
        let m = map(7);
        assert_eq!(key_for(m, 700, OrderClass::Large), key_for(m, 512, OrderClass::Large));
        assert_eq!(key_for(m, 700, OrderClass::Large).index(), 512);
        assert_eq!(key_for(m, 700, OrderClass::Small).index(), 700);
        assert_eq!(key_for(m, 300_000, OrderClass::Huge).index(), 262_144);
        assert_ne!(key_for(m, 3, OrderClass::Small), key_for(map(8), 3, OrderClass::Small));
    }

    #[test]
    fn test_bucket_is_pure_and_in_range() {
        let key = key_for(map(3), 42, OrderClass::Small);
        assert_eq!(WaitTable::queue_for(key), WaitTable::queue_for(key));
        for i in 0..1000 {
            assert!(WaitTable::queue_for(key_for(map(i), i * 31, OrderClass::Small)) < WAIT_TABLE_ENTRIES);
        }
    }

    #[test]
    fn test_wake_without_waiters() {
        let table = WaitTable::new();
        assert_eq!(table.wake(key_for(map(1), 1, OrderClass::Small), WakeMode::All), 0);
    }

    #[test]
    fn test_wake_next_releases_one() {
        let table = WaitTable::new();
        let key = key_for(map(1), 10, OrderClass::Small);
        let a = table.prepare(key);
        let b = table.prepare(key);

        assert_eq!(table.wake(key, WakeMode::Next), 1);
        assert!(a.is_woken());
        assert!(!b.is_woken());
        assert!(table.has_waiters(key));

        assert_eq!(table.wake(key, WakeMode::All), 1);
        assert!(b.is_woken());
        assert!(!table.has_waiters(key));
    }

    #[test]
    fn test_collision_filters_on_key() {
        let table = WaitTable::new();
        let key = key_for(map(1), 10, OrderClass::Small);
        let other = colliding_key(key);
        assert_eq!(WaitTable::queue_for(key), WaitTable::queue_for(other));

        let mine = table.prepare(key);
        let theirs = table.prepare(other);

        assert_eq!(table.wake(other, WakeMode::All), 1);
        assert!(theirs.is_woken());
        assert!(!mine.is_woken());
        table.finish(mine);
        assert!(!table.has_waiters(key));
    }

    #[test]
    fn test_sleep_times_out() {
        let table = WaitTable::new();
        let key = key_for(map(2), 0, OrderClass::Small);
        let handle = table.prepare(key);
        let woken = table.sleep(&handle, Some(Instant::now() + Duration::from_millis(20)));
        assert!(!woken);
        table.finish(handle);
        assert!(!table.has_waiters(key));
    }

    #[test]
    fn test_sleep_is_woken_across_threads() {
        let table = Arc::new(WaitTable::new());
        let key = key_for(map(4), 99, OrderClass::Small);
        let handle = table.prepare(key);

        let waker = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.wake(key, WakeMode::Next)
            })
        };

        assert!(table.sleep(&handle, None));
        table.finish(handle);
        assert_eq!(waker.join().unwrap(), 1);
    }

    #[test]
    fn test_thread_reuses_waiter_record() {
        let table = WaitTable::new();
        let first = key_for(map(5), 1, OrderClass::Small);
        let handle = table.prepare(first);
        let record = Arc::as_ptr(&handle.waiter);
        table.wake(first, WakeMode::Next);
        table.finish(handle);

        let second = key_for(map(5), 2, OrderClass::Small);
        let handle = table.prepare(second);
        assert_eq!(Arc::as_ptr(&handle.waiter), record);
        assert!(!handle.is_woken());
        assert_eq!(handle.waiter.key(), second);
        table.finish(handle);
        assert!(!table.has_waiters(second));
    }

    #[test]
    fn test_nested_prepare_gets_own_record() {
        let table = WaitTable::new();
        let key = key_for(map(6), 1, OrderClass::Small);
        let outer = table.prepare(key);
        let inner = table.prepare(key_for(map(6), 2, OrderClass::Small));
        assert!(!Arc::ptr_eq(&outer.waiter, &inner.waiter));
        assert_eq!(outer.waiter.key(), key);
        table.finish(inner);
        table.finish(outer);
    }

    #[test]
    fn test_buckets_start_with_capacity() {
        let table = WaitTable::new();
        assert!(table.buckets.iter().all(|b| b.waiters.lock().capacity() >= BUCKET_CAPACITY));
    }

    #[test]
    fn test_global_table_is_singleton() {
        assert!(std::ptr::eq(wait_table(), wait_table()));
    }
}
