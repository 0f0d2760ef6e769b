use crate::kv::{KeyTsBorrow, ValueStruct};
use crate::table::iter::{ConcatIter, TableIter};
use crate::table::merge::MergeIter;

/// Pull-style iterator over versioned records. `next` positions the
/// iterator and reports whether it landed on a valid entry; `key`/`value`
/// read the current position.
pub trait SinkIterator {
    fn next(&mut self) -> anyhow::Result<bool>;

    /// Position at the first entry (last when reversed).
    fn rewind(&mut self) -> anyhow::Result<bool>;

    /// Position at the first entry `>= target` (`<= target` when
    /// reversed). `target` is a serialized key with TS suffix.
    fn seek(&mut self, target: &[u8]) -> anyhow::Result<bool>;

    fn key(&self) -> Option<KeyTsBorrow<'_>>;

    fn value(&self) -> Option<ValueStruct>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IterOptions {
    pub reverse: bool,
}

/// The closed set of iterator shapes a level hands to readers: level 0
/// contributes one table iterator per overlapping table (newest first),
/// higher levels one concatenated iterator. A merge iterator combines a
/// set of these.
pub enum LevelIter {
    Table(TableIter),
    Concat(ConcatIter),
    Merge(Box<MergeIter>),
}

impl SinkIterator for LevelIter {
    fn next(&mut self) -> anyhow::Result<bool> {
        match self {
            LevelIter::Table(iter) => iter.next(),
            LevelIter::Concat(iter) => iter.next(),
            LevelIter::Merge(iter) => iter.next(),
        }
    }

    fn rewind(&mut self) -> anyhow::Result<bool> {
        match self {
            LevelIter::Table(iter) => iter.rewind(),
            LevelIter::Concat(iter) => iter.rewind(),
            LevelIter::Merge(iter) => iter.rewind(),
        }
    }

    fn seek(&mut self, target: &[u8]) -> anyhow::Result<bool> {
        match self {
            LevelIter::Table(iter) => iter.seek(target),
            LevelIter::Concat(iter) => iter.seek(target),
            LevelIter::Merge(iter) => iter.seek(target),
        }
    }

    fn key(&self) -> Option<KeyTsBorrow<'_>> {
        match self {
            LevelIter::Table(iter) => iter.key(),
            LevelIter::Concat(iter) => iter.key(),
            LevelIter::Merge(iter) => iter.key(),
        }
    }

    fn value(&self) -> Option<ValueStruct> {
        match self {
            LevelIter::Table(iter) => iter.value(),
            LevelIter::Concat(iter) => iter.value(),
            LevelIter::Merge(iter) => iter.value(),
        }
    }
}
