//! Sparse segment id → global-symbol-slot map ("RAA" in the reference
//! tool). The original is a radix array of fixed-size leaves so lookups
//! of unset slots default to zero without allocating; a `HashMap` gives
//! the same sparse, default-on-miss behaviour in safe Rust.

use std::collections::HashMap;

/// Maps an assembler segment id to the dense global-symbol slot number
/// assigned when that segment's symbol was declared `GLOBAL` while still
/// undefined or common (spec.md §4.2).
#[derive(Debug, Default, Clone)]
pub struct SlotMap {
    slots: HashMap<i32, u32>,
}

impl SlotMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `segment` maps to global slot `slot`.
    pub fn insert(&mut self, segment: i32, slot: u32) {
        self.slots.insert(segment, slot);
    }

    /// Look up the slot for `segment`, defaulting to 0 if unset (matching
    /// `raa_read`'s default-zero semantics).
    pub fn get(&self, segment: i32) -> u32 {
        self.slots.get(&segment).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_segment_defaults_to_zero() {
        let map = SlotMap::new();
        assert_eq!(map.get(42), 0);
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut map = SlotMap::new();
        map.insert(7, 3);
        assert_eq!(map.get(7), 3);
        assert_eq!(map.get(8), 0);
    }
}
