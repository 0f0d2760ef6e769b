use std::cmp::Ordering;

use parking_lot::RwLock;

use crate::kv::{KeyTs, KeyTsBorrow, TxnTs};
use crate::table::Table;

use super::levels::CompactDef;

/// Half-open interval of serialized keys claimed by a compaction. `inf`
/// overlaps everything. Ranges built from tables are widened to
/// `user@MAX_TS .. user@0` so every version of a boundary user key
/// belongs to one reservation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct KeyRange {
    left: Vec<u8>,
    right: Vec<u8>,
    inf: bool,
}

impl KeyRange {
    pub(crate) fn new(left: Vec<u8>, right: Vec<u8>) -> Self {
        Self {
            left,
            right,
            inf: false,
        }
    }

    pub(crate) fn inf_range() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
            inf: true,
        }
    }

    pub(crate) fn from_table(table: &Table) -> Self {
        let smallest = KeyTsBorrow(table.smallest()).key();
        let biggest = KeyTsBorrow(table.biggest()).key();
        Self {
            left: KeyTs::new(smallest.to_vec(), TxnTs::MAX).serialize(),
            right: KeyTs::new(biggest.to_vec(), 0.into()).serialize(),
            inf: false,
        }
    }

    pub(crate) fn from_tables(tables: &[Table]) -> Option<Self> {
        let mut tables_iter = tables.iter();
        let mut range = Self::from_table(tables_iter.next()?);
        for table in tables_iter {
            range.extend(Self::from_table(table));
        }
        Some(range)
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.inf && self.left.is_empty() && self.right.is_empty()
    }

    pub(crate) fn extend(&mut self, other: KeyRange) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        if self.inf || other.inf {
            *self = Self::inf_range();
            return;
        }
        if KeyTsBorrow::cmp_bytes(&other.left, &self.left) == Ordering::Less {
            self.left = other.left;
        }
        if KeyTsBorrow::cmp_bytes(&other.right, &self.right) == Ordering::Greater {
            self.right = other.right;
        }
    }

    pub(crate) fn is_overlaps_with(&self, other: &KeyRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if self.inf || other.inf {
            return true;
        }
        KeyTsBorrow::cmp_bytes(&self.left, &other.right) != Ordering::Greater
            && KeyTsBorrow::cmp_bytes(&other.left, &self.right) != Ordering::Greater
    }

    pub(crate) fn left(&self) -> &[u8] {
        &self.left
    }

    pub(crate) fn right(&self) -> &[u8] {
        &self.right
    }

    pub(crate) fn is_inf(&self) -> bool {
        self.inf
    }
}

#[derive(Debug, Default)]
pub(crate) struct LevelCompactStatus {
    ranges: Vec<KeyRange>,
    delta_size: i64,
}

impl LevelCompactStatus {
    fn is_overlaps_with(&self, target: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.is_overlaps_with(target))
    }

    fn remove(&mut self, target: &KeyRange) -> bool {
        match self.ranges.iter().position(|r| r == target) {
            Some(index) => {
                self.ranges.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Which key ranges are being compacted at each level right now. Planner
/// output is advisory; a range only belongs to a compaction once
/// [`CompactStatus::compare_and_add`] accepted it here.
#[derive(Debug, Default)]
pub(crate) struct CompactStatus {
    inner: RwLock<Vec<LevelCompactStatus>>,
}

impl CompactStatus {
    pub(crate) fn new(max_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(max_levels);
        levels.resize_with(max_levels, LevelCompactStatus::default);
        Self {
            inner: RwLock::new(levels),
        }
    }

    pub(crate) fn is_overlaps_with(&self, level: usize, target: &KeyRange) -> bool {
        self.inner.read()[level].is_overlaps_with(target)
    }

    /// Re-checks both ranges under the exclusive lock and reserves them
    /// if still clear. Losing the race is normal; the caller picks
    /// another candidate.
    pub(crate) fn compare_and_add(&self, cd: &CompactDef) -> bool {
        let mut inner = self.inner.write();
        let this_level = cd.this_level.get_level();
        let next_level = cd.next_level.get_level();
        debug_assert!(this_level < inner.len() && next_level < inner.len());
        if inner[this_level].is_overlaps_with(&cd.this_range)
            || inner[next_level].is_overlaps_with(&cd.next_range)
        {
            return false;
        }
        inner[this_level].ranges.push(cd.this_range.clone());
        inner[next_level].ranges.push(cd.next_range.clone());
        inner[next_level].delta_size += cd.this_size as i64;
        true
    }

    /// Releases the ranges reserved by `compare_and_add` for `cd`.
    pub(crate) fn delete(&self, cd: &CompactDef) {
        let mut inner = self.inner.write();
        let this_level = cd.this_level.get_level();
        let next_level = cd.next_level.get_level();
        let removed_this = inner[this_level].remove(&cd.this_range);
        let removed_next = inner[next_level].remove(&cd.next_range);
        debug_assert!(
            removed_this && removed_next,
            "releasing a reservation that was never added"
        );
        inner[next_level].delta_size -= cd.this_size as i64;
    }

    /// Bytes already headed into `level` from running compactions.
    pub(crate) fn delta_size(&self, level: usize) -> i64 {
        self.inner.read()[level].delta_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyTs;

    fn range(left: &[u8], right: &[u8]) -> KeyRange {
        KeyRange {
            left: KeyTs::new(left.to_vec(), TxnTs::MAX).serialize(),
            right: KeyTs::new(right.to_vec(), 0.into()).serialize(),
            inf: false,
        }
    }

    #[test]
    fn overlap_math() {
        let ab = range(b"a", b"b");
        let bc = range(b"b", b"c");
        let de = range(b"d", b"e");
        assert!(ab.is_overlaps_with(&bc), "shared boundary key overlaps");
        assert!(!ab.is_overlaps_with(&de));
        assert!(KeyRange::inf_range().is_overlaps_with(&de));
        assert!(de.is_overlaps_with(&KeyRange::inf_range()));
        assert!(!KeyRange::default().is_overlaps_with(&de));
    }

    #[test]
    fn extend_takes_union() {
        let mut r = range(b"c", b"d");
        r.extend(range(b"a", b"b"));
        assert_eq!(KeyTsBorrow(r.left()).key(), b"a");
        assert_eq!(KeyTsBorrow(r.right()).key(), b"d");
        r.extend(KeyRange::inf_range());
        assert!(r.is_inf());
    }
}
