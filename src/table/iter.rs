use crate::iter::SinkIterator;
use crate::kv::{KeyTsBorrow, ValueStruct};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Unpositioned,
    At(usize),
    Done,
}

/// Iterator over the entries of a single table.
pub struct TableIter {
    table: Table,
    reverse: bool,
    cursor: Cursor,
}

impl TableIter {
    pub(crate) fn new(table: Table, reverse: bool) -> Self {
        Self {
            table,
            reverse,
            cursor: Cursor::Unpositioned,
        }
    }

    fn at(&self) -> Option<usize> {
        match self.cursor {
            Cursor::At(i) => Some(i),
            _ => None,
        }
    }
}

impl SinkIterator for TableIter {
    fn next(&mut self) -> anyhow::Result<bool> {
        let n = self.table.num_entries();
        self.cursor = match self.cursor {
            Cursor::Unpositioned => return self.rewind(),
            Cursor::At(i) => {
                if self.reverse {
                    if i == 0 {
                        Cursor::Done
                    } else {
                        Cursor::At(i - 1)
                    }
                } else if i + 1 >= n {
                    Cursor::Done
                } else {
                    Cursor::At(i + 1)
                }
            }
            Cursor::Done => Cursor::Done,
        };
        Ok(matches!(self.cursor, Cursor::At(_)))
    }

    fn rewind(&mut self) -> anyhow::Result<bool> {
        let n = self.table.num_entries();
        self.cursor = if n == 0 {
            Cursor::Done
        } else if self.reverse {
            Cursor::At(n - 1)
        } else {
            Cursor::At(0)
        };
        Ok(matches!(self.cursor, Cursor::At(_)))
    }

    fn seek(&mut self, target: &[u8]) -> anyhow::Result<bool> {
        let n = self.table.num_entries();
        let first_ge = self.table.seek_entry_index(target);
        self.cursor = if !self.reverse {
            if first_ge < n {
                Cursor::At(first_ge)
            } else {
                Cursor::Done
            }
        } else {
            // Last entry <= target. Keys are unique, so either first_ge
            // matches exactly or the predecessor is the answer.
            if first_ge < n && self.table.entry_key(first_ge).0 == target {
                Cursor::At(first_ge)
            } else if first_ge > 0 {
                Cursor::At(first_ge - 1)
            } else {
                Cursor::Done
            }
        };
        Ok(matches!(self.cursor, Cursor::At(_)))
    }

    fn key(&self) -> Option<KeyTsBorrow<'_>> {
        self.at().map(|i| self.table.entry_key(i))
    }

    fn value(&self) -> Option<ValueStruct> {
        self.at().map(|i| self.table.entry(i).1)
    }
}

/// Iterator over an ordered run of non-overlapping tables, visiting them
/// end to end as one logical table.
pub struct ConcatIter {
    tables: Vec<Table>,
    reverse: bool,
    cur: Option<(usize, TableIter)>,
    done: bool,
}

impl ConcatIter {
    pub(crate) fn new(tables: Vec<Table>, reverse: bool) -> Self {
        Self {
            tables,
            reverse,
            cur: None,
            done: false,
        }
    }

    fn open_at(&mut self, table_index: usize) -> TableIter {
        self.tables[table_index].new_iterator(self.reverse)
    }

    /// Next table in iteration direction, or None at the end of the run.
    fn following(&self, table_index: usize) -> Option<usize> {
        if self.reverse {
            table_index.checked_sub(1)
        } else if table_index + 1 < self.tables.len() {
            Some(table_index + 1)
        } else {
            None
        }
    }
}

impl SinkIterator for ConcatIter {
    fn next(&mut self) -> anyhow::Result<bool> {
        let Some((index, iter)) = self.cur.as_mut() else {
            return if self.done { Ok(false) } else { self.rewind() };
        };
        if iter.next()? {
            return Ok(true);
        }
        let mut index = *index;
        while let Some(following) = self.following(index) {
            let mut iter = self.open_at(following);
            if iter.rewind()? {
                self.cur = Some((following, iter));
                return Ok(true);
            }
            index = following;
        }
        self.cur = None;
        self.done = true;
        Ok(false)
    }

    fn rewind(&mut self) -> anyhow::Result<bool> {
        self.done = false;
        if self.tables.is_empty() {
            self.cur = None;
            self.done = true;
            return Ok(false);
        }
        let start = if self.reverse {
            self.tables.len() - 1
        } else {
            0
        };
        let mut iter = self.open_at(start);
        let valid = iter.rewind()?;
        self.cur = Some((start, iter));
        if !valid {
            self.cur = None;
            self.done = true;
        }
        Ok(valid)
    }

    fn seek(&mut self, target: &[u8]) -> anyhow::Result<bool> {
        self.done = false;
        // Forward: first table whose biggest key reaches the target.
        // Reverse: last table whose smallest key does not pass it.
        let candidate = if !self.reverse {
            self.tables
                .partition_point(|t| KeyTsBorrow::cmp_bytes(t.biggest(), target).is_lt())
        } else {
            let first_past = self
                .tables
                .partition_point(|t| KeyTsBorrow::cmp_bytes(t.smallest(), target).is_le());
            match first_past.checked_sub(1) {
                Some(i) => i,
                None => {
                    self.cur = None;
                    self.done = true;
                    return Ok(false);
                }
            }
        };
        if candidate >= self.tables.len() {
            self.cur = None;
            self.done = true;
            return Ok(false);
        }
        let mut iter = self.open_at(candidate);
        if iter.seek(target)? {
            self.cur = Some((candidate, iter));
            return Ok(true);
        }
        // The target fell in a gap between tables; continue from the
        // following table's boundary entry.
        let mut index = candidate;
        while let Some(following) = self.following(index) {
            let mut iter = self.open_at(following);
            if iter.rewind()? {
                self.cur = Some((following, iter));
                return Ok(true);
            }
            index = following;
        }
        self.cur = None;
        self.done = true;
        Ok(false)
    }

    fn key(&self) -> Option<KeyTsBorrow<'_>> {
        self.cur.as_ref().and_then(|(_, iter)| iter.key())
    }

    fn value(&self) -> Option<ValueStruct> {
        self.cur.as_ref().and_then(|(_, iter)| iter.value())
    }
}
