//! # Entry Codec
//!
//! One cached region is described by one [`Entry`]. The index stores it in a
//! [`Slot`] together with the out-of-band lock bit.
//!
//! ## Order classes
//!
//! | Class | Frame shift | Frames |
//! |-------|-------------|--------|
//! | `Small` | 0 | 1 |
//! | `Large` | 9 | 512 |
//! | `Huge` | 18 | 262144 |
//!
//! A region of order N always starts at an index aligned to its frame count.

use std::fmt;

/// Physical frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pfn(pub u64);

impl Pfn {
    /// Frame `n` positions after this one.
    pub const fn offset(self, n: u64) -> Pfn {
        Pfn(self.0 + n)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Span class of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OrderClass {
    /// One frame.
    #[default]
    Small,
    /// 512 frames (second-level page table block).
    Large,
    /// 262144 frames (third-level page table block).
    Huge,
}

impl OrderClass {
    /// All classes, finest first.
    pub const ALL: [OrderClass; 3] = [OrderClass::Small, OrderClass::Large, OrderClass::Huge];

    /// log2 of the frame count.
    pub const fn shift(self) -> u32 {
        match self {
            OrderClass::Small => 0,
            OrderClass::Large => 9,
            OrderClass::Huge => 18,
        }
    }

    /// Number of frames covered by a region of this class.
    pub const fn nr_frames(self) -> u64 {
        1 << self.shift()
    }

    /// Round `index` down to the start of the region containing it.
    pub const fn align_down(self, index: u64) -> u64 {
        index & !(self.nr_frames() - 1)
    }

    /// Class with the given frame shift, if any.
    pub fn from_shift(shift: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.shift() == shift)
    }
}

/// Marker flags accepted by [`Entry::encode`] and produced by [`Entry::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// No markers: a region backed by real frames.
    pub const NONE: Self = Self(0);
    /// Region is mapped to the shared zero frame.
    pub const ZERO: Self = Self(1 << 0);
    /// Region is reserved but has no backing yet.
    pub const EMPTY: Self = Self(1 << 1);
    /// Region has been unmapped and its frame references dropped.
    pub const ZAPPED: Self = Self(1 << 2);

    /// Create from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if every flag in `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A region entry, or one of the two lookup sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Entry {
    /// Nothing stored.
    #[default]
    Vacant,
    /// Reserved region without real frames; `zero` when it maps the zero frame.
    Placeholder {
        /// Span class.
        order: OrderClass,
        /// Mapped to the shared zero frame.
        zero: bool,
    },
    /// Region backed by `order.nr_frames()` frames starting at `frame`.
    Mapped {
        /// First backing frame.
        frame: Pfn,
        /// Span class.
        order: OrderClass,
        /// Frame references already dropped by a zap.
        zapped: bool,
    },
    /// A smaller entry blocks a request at a larger order. Never stored.
    Conflict,
}

/// Decoded view of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEntry {
    /// First frame; zero for placeholders.
    pub frame: Pfn,
    /// Span class.
    pub order: OrderClass,
    /// Markers.
    pub flags: EntryFlags,
}

impl Entry {
    /// Build an entry from its parts.
    ///
    /// `EMPTY` wins over `ZERO`; `ZAPPED` is only meaningful for backed regions.
    pub fn encode(frame: Pfn, order: OrderClass, flags: EntryFlags) -> Entry {
        if flags.contains(EntryFlags::EMPTY) {
            Entry::Placeholder { order, zero: false }
        } else if flags.contains(EntryFlags::ZERO) {
            Entry::Placeholder { order, zero: true }
        } else {
            Entry::Mapped {
                frame,
                order,
                zapped: flags.contains(EntryFlags::ZAPPED),
            }
        }
    }

    /// Split into parts. `None` for the sentinels.
    pub fn decode(&self) -> Option<DecodedEntry> {
        match *self {
            Entry::Vacant | Entry::Conflict => None,
            Entry::Placeholder { order, zero } => Some(DecodedEntry {
                frame: Pfn(0),
                order,
                flags: if zero { EntryFlags::ZERO } else { EntryFlags::EMPTY },
            }),
            Entry::Mapped { frame, order, zapped } => Some(DecodedEntry {
                frame,
                order,
                flags: if zapped { EntryFlags::ZAPPED } else { EntryFlags::NONE },
            }),
        }
    }

    /// An empty placeholder of the given class.
    pub const fn empty(order: OrderClass) -> Entry {
        Entry::Placeholder { order, zero: false }
    }

    /// A zero-frame placeholder of the given class.
    pub const fn zero(order: OrderClass) -> Entry {
        Entry::Placeholder { order, zero: true }
    }

    /// A freshly backed region.
    pub const fn mapped(frame: Pfn, order: OrderClass) -> Entry {
        Entry::Mapped { frame, order, zapped: false }
    }

    /// Span class. Sentinels report `Small`.
    pub fn order(&self) -> OrderClass {
        match *self {
            Entry::Placeholder { order, .. } | Entry::Mapped { order, .. } => order,
            Entry::Vacant | Entry::Conflict => OrderClass::Small,
        }
    }

    /// First backing frame of a mapped region.
    pub fn frame(&self) -> Option<Pfn> {
        match *self {
            Entry::Mapped { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Number of backing frames: zero for placeholders and sentinels.
    pub fn size(&self) -> u64 {
        match *self {
            Entry::Mapped { order, .. } => order.nr_frames(),
            _ => 0,
        }
    }

    /// Iterate over the backing frames.
    pub fn frames(&self) -> impl Iterator<Item = Pfn> {
        let base = self.frame().unwrap_or_default();
        (0..self.size()).map(move |i| base.offset(i))
    }

    /// Mapped to the zero frame.
    pub fn is_zero(&self) -> bool {
        matches!(self, Entry::Placeholder { zero: true, .. })
    }

    /// Reserved without any backing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Entry::Placeholder { zero: false, .. })
    }

    /// Zero or empty.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Entry::Placeholder { .. })
    }

    /// Frame references already dropped.
    pub fn is_zapped(&self) -> bool {
        matches!(self, Entry::Mapped { zapped: true, .. })
    }

    /// The lookup conflict sentinel.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Entry::Conflict)
    }

    /// Copy of this entry with the zapped marker set.
    pub fn into_zapped(self) -> Entry {
        match self {
            Entry::Mapped { frame, order, .. } => Entry::Mapped { frame, order, zapped: true },
            other => other,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Vacant => write!(f, "vacant"),
            Entry::Conflict => write!(f, "conflict"),
            Entry::Placeholder { order, zero } => {
                write!(f, "{}({:?})", if *zero { "zero" } else { "empty" }, order)
            }
            Entry::Mapped { frame, order, zapped } => {
                write!(f, "mapped({}, {:?}{})", frame, order, if *zapped { ", zapped" } else { "" })
            }
        }
    }
}

/// The value stored per region in the index: the entry plus its lock bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// The region entry.
    pub entry: Entry,
    /// Exclusive-access bit.
    pub locked: bool,
}

impl Slot {
    /// An unlocked slot.
    pub const fn unlocked(entry: Entry) -> Self {
        Self { entry, locked: false }
    }

    /// A locked slot.
    pub const fn locked(entry: Entry) -> Self {
        Self { entry, locked: true }
    }

    /// Whether the lock bit is set.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_geometry() {
        assert_eq!(OrderClass::Small.nr_frames(), 1);
        assert_eq!(OrderClass::Large.nr_frames(), 512);
        assert_eq!(OrderClass::Huge.nr_frames(), 512 * 512);
        assert_eq!(OrderClass::Large.align_down(1000), 512);
        assert_eq!(OrderClass::Small.align_down(1000), 1000);
        assert!(OrderClass::Small < OrderClass::Large);
        assert!(OrderClass::Large < OrderClass::Huge);
        assert_eq!(OrderClass::from_shift(9), Some(OrderClass::Large));
        assert_eq!(OrderClass::from_shift(3), None);
    }

    #[test]
    fn test_encode_markers() {
        let e = Entry::encode(Pfn(10), OrderClass::Large, EntryFlags::EMPTY);
        assert!(e.is_empty());
        assert!(!e.is_zero());
        assert_eq!(e.size(), 0);

        let z = Entry::encode(Pfn(10), OrderClass::Small, EntryFlags::ZERO);
        assert!(z.is_zero());
        assert!(z.is_placeholder());
        assert_eq!(z.frame(), None);

        let m = Entry::encode(Pfn(10), OrderClass::Large, EntryFlags::NONE);
        assert_eq!(m.frame(), Some(Pfn(10)));
        assert_eq!(m.size(), 512);
        assert!(!m.is_zapped());

        let zapped = Entry::encode(Pfn(10), OrderClass::Small, EntryFlags::ZAPPED);
        assert!(zapped.is_zapped());
    }

    #[test]
    fn test_decode_sentinels() {
        assert_eq!(Entry::Vacant.decode(), None);
        assert_eq!(Entry::Conflict.decode(), None);
        assert!(Entry::Conflict.is_conflict());
        assert_eq!(Entry::Conflict.size(), 0);
    }

    #[test]
    fn test_decode_mapped() {
        let d = Entry::mapped(Pfn(64), OrderClass::Small).into_zapped().decode().unwrap();
        assert_eq!(d.frame, Pfn(64));
        assert_eq!(d.order, OrderClass::Small);
        assert!(d.flags.contains(EntryFlags::ZAPPED));
    }

    #[test]
    fn test_frames_iter() {
        let frames: Vec<_> = Entry::mapped(Pfn(4), OrderClass::Small).frames().collect();
        assert_eq!(frames, vec![Pfn(4)]);
        assert_eq!(Entry::zero(OrderClass::Large).frames().count(), 0);
        assert_eq!(Entry::mapped(Pfn(0), OrderClass::Large).frames().count(), 512);
    }

    #[test]
    fn test_into_zapped_leaves_placeholders() {
        let e = Entry::empty(OrderClass::Small);
        assert_eq!(e.into_zapped(), e);
    }

    #[test]
    fn test_slot_lock_bit() {
        let s = Slot::locked(Entry::empty(OrderClass::Small));
        assert!(s.is_locked());
        assert!(!Slot::unlocked(s.entry).is_locked());
    }

    #[test]
    fn test_flags_union() {
        let f = EntryFlags::ZERO.union(EntryFlags::ZAPPED);
        assert!(f.contains(EntryFlags::ZERO));
        assert!(f.contains(EntryFlags::ZAPPED));
        assert!(!f.contains(EntryFlags::EMPTY));
        assert_eq!(EntryFlags::from_bits(f.bits()), f);
    }
}
