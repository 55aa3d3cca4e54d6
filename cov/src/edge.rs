//! Edge identifiers as reported by an instrumented target.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A set of discovered edges, ordered for stable serialization.
pub type EdgeSet = BTreeSet<EdgeIndex>;

// An index into the shared edge bitmap.
// The in-target runtime numbers edge guards starting at 1; index 0
// means "guard not taken" and never appears in a result set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeIndex(u32);

impl EdgeIndex {
    pub const fn from_const(value: u32) -> Self {
        EdgeIndex(value)
    }

    /// Get the raw index value.
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Byte offset of this edge within the bitmap.
    pub const fn byte(&self) -> usize {
        (self.0 / 8) as usize
    }

    /// Bit position of this edge within its bitmap byte.
    pub const fn mask(&self) -> u8 {
        1 << (self.0 % 8)
    }
}

impl From<u32> for EdgeIndex {
    fn from(value: u32) -> Self {
        EdgeIndex::from_const(value)
    }
}

impl From<EdgeIndex> for u32 {
    fn from(value: EdgeIndex) -> Self {
        value.0
    }
}

impl fmt::Display for EdgeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:06x}", self.0)
    }
}

impl fmt::Debug for EdgeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_position() {
        let edge = EdgeIndex::from_const(17);
        assert_eq!(edge.byte(), 2);
        assert_eq!(edge.mask(), 0b10);
    }

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(EdgeIndex::from_const(0x2a).to_string(), "E00002a");
        assert_eq!(EdgeIndex::from_const(0xfffff).to_string(), "E0fffff");
    }

    #[test]
    fn ordering_follows_the_raw_index() {
        let mut set = EdgeSet::new();
        set.insert(EdgeIndex::from_const(9));
        set.insert(EdgeIndex::from_const(1));
        set.insert(EdgeIndex::from_const(4));
        let order: Vec<u32> = set.iter().map(|e| e.index()).collect();
        assert_eq!(order, vec![1, 4, 9]);
    }
}
