//! # Sparse Index
//!
//! The ordered map from region-aligned index to entry that a [`Mapping`]
//! protects with its index lock. The engine only reaches the index through
//! [`SparseIndex`], so a host can plug in its own radix tree; [`BTreeIndex`]
//! is the in-memory implementation used by default.
//!
//! ## Multi-index semantics
//!
//! A value stored at `base` with order N covers `base .. base + 2^shift(N)`.
//! Every lookup that lands inside that span returns the covering value and
//! its base. Stored spans never overlap.
//!
//! ## Locking Context
//!
//! Every method is called with the owning map's index lock held. None of
//! them may block.
//!
//! [`Mapping`]: crate::mapping::Mapping

use std::collections::BTreeMap;

use crate::entry::{OrderClass, Slot};
use crate::error::IndexError;

/// Per-entry tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Region holds data not yet flushed.
    Dirty,
    /// Region is queued for the writeback pass in progress.
    Towrite,
}

impl Tag {
    const fn bit(self) -> u8 {
        match self {
            Tag::Dirty => 1 << 0,
            Tag::Towrite => 1 << 1,
        }
    }
}

/// A raw value held by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexValue {
    /// A region entry with its lock bit.
    Region(Slot),
    /// Something that is not a region entry. Finding one is a consistency
    /// violation.
    Foreign(u64),
}

impl IndexValue {
    /// Span class of the stored value.
    pub fn order(&self) -> OrderClass {
        match self {
            IndexValue::Region(slot) => slot.entry.order(),
            IndexValue::Foreign(_) => OrderClass::Small,
        }
    }
}

/// Result of a conflict-aware lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtOrder {
    /// Nothing covers the requested range.
    Vacant,
    /// A smaller value lives inside the requested range.
    Conflict,
    /// A value at least as large covers the requested range.
    Found {
        /// Base index of the value.
        base: u64,
        /// The value.
        value: IndexValue,
    },
}

/// Ordered, tagged, multi-index map.
pub trait SparseIndex: Send {
    /// Value covering `index`, with its base.
    fn load(&self, index: u64) -> Option<(u64, IndexValue)>;

    /// Conflict-aware lookup of the `order`-aligned range containing `index`.
    fn load_at_order(&self, index: u64, order: OrderClass) -> AtOrder;

    /// Store `value` at `base`, replacing any value already there.
    ///
    /// Replacing keeps the tags. Inserting at a new base may need storage and
    /// can fail with [`IndexError::NoMemory`].
    fn store(&mut self, base: u64, value: IndexValue) -> Result<(), IndexError>;

    /// Remove the value at `base` together with its tags.
    fn erase(&mut self, base: u64) -> Option<IndexValue>;

    /// Whether `tag` is set on the value at `base`.
    fn get_tag(&self, base: u64, tag: Tag) -> bool;

    /// Set `tag` on the value at `base`. No-op if nothing is stored.
    fn set_tag(&mut self, base: u64, tag: Tag);

    /// Clear `tag` on the value at `base`.
    fn clear_tag(&mut self, base: u64, tag: Tag);

    /// Base of the first value covering any index in `from..=last`.
    fn next_entry(&self, from: u64, last: u64) -> Option<u64>;

    /// Base of the first value tagged `tag` covering any index in `from..=last`.
    fn next_tagged(&self, from: u64, last: u64, tag: Tag) -> Option<u64>;

    /// Number of stored values.
    fn len(&self) -> usize;

    /// Whether nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    value: IndexValue,
    tags: u8,
}

impl Node {
    fn end(&self, base: u64) -> u64 {
        base.saturating_add(self.value.order().nr_frames() - 1)
    }
}

/// `BTreeMap`-backed [`SparseIndex`].
#[derive(Debug, Default, Clone)]
pub struct BTreeIndex {
    nodes: BTreeMap<u64, Node>,
}

impl BTreeIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn covering(&self, index: u64) -> Option<(u64, &Node)> {
        self.nodes
            .range(..=index)
            .next_back()
            .filter(|(base, node)| node.end(**base) >= index)
            .map(|(base, node)| (*base, node))
    }

    fn first_match(&self, from: u64, last: u64, pred: impl Fn(&Node) -> bool) -> Option<u64> {
        if from > last {
            return None;
        }
        if let Some((base, node)) = self.covering(from) {
            if pred(node) {
                return Some(base);
            }
        }
        self.nodes
            .range(from..=last)
            .find(|(_, node)| pred(node))
            .map(|(base, _)| *base)
    }
}

impl SparseIndex for BTreeIndex {
    fn load(&self, index: u64) -> Option<(u64, IndexValue)> {
        self.covering(index).map(|(base, node)| (base, node.value))
    }

    fn load_at_order(&self, index: u64, order: OrderClass) -> AtOrder {
        let start = order.align_down(index);
        if let Some((base, node)) = self.covering(start) {
            return if node.value.order() >= order {
                AtOrder::Found { base, value: node.value }
            } else {
                AtOrder::Conflict
            };
        }
        let last = start.saturating_add(order.nr_frames() - 1);
        if self.nodes.range(start..=last).next().is_some() {
            AtOrder::Conflict
        } else {
            AtOrder::Vacant
        }
    }

    fn store(&mut self, base: u64, value: IndexValue) -> Result<(), IndexError> {
        debug_assert_eq!(value.order().align_down(base), base, "unaligned store");
        match self.nodes.get_mut(&base) {
            Some(node) => node.value = value,
            None => {
                self.nodes.insert(base, Node { value, tags: 0 });
            }
        }
        Ok(())
    }

    fn erase(&mut self, base: u64) -> Option<IndexValue> {
        self.nodes.remove(&base).map(|node| node.value)
    }

    fn get_tag(&self, base: u64, tag: Tag) -> bool {
        self.nodes.get(&base).map_or(false, |n| n.tags & tag.bit() != 0)
    }

    fn set_tag(&mut self, base: u64, tag: Tag) {
        if let Some(node) = self.nodes.get_mut(&base) {
            node.tags |= tag.bit();
        }
    }

    fn clear_tag(&mut self, base: u64, tag: Tag) {
        if let Some(node) = self.nodes.get_mut(&base) {
            node.tags &= !tag.bit();
        }
    }

    fn next_entry(&self, from: u64, last: u64) -> Option<u64> {
        self.first_match(from, last, |_| true)
    }

    fn next_tagged(&self, from: u64, last: u64, tag: Tag) -> Option<u64> {
        self.first_match(from, last, |n| n.tags & tag.bit() != 0)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}
