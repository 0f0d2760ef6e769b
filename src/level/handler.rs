use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::RwLock;

use crate::bloom::Bloom;
use crate::errors::DBError;
use crate::iter::{IterOptions, LevelIter};
use crate::kv::{KeyTsBorrow, KvPair, ValueStruct};
use crate::table::iter::ConcatIter;
use crate::table::Table;
use crate::util::SSTableId;

use super::compaction::KeyRange;

/// Owner of one level's table set. A single reader/writer lock guards the
/// list and its size accounting; reference drops always happen after the
/// guard is released.
#[derive(Debug, Clone)]
pub(crate) struct LevelHandler(Arc<LevelHandlerInner>);

#[derive(Debug)]
pub(crate) struct LevelHandlerInner {
    level: usize,
    pub(crate) handler_tables: RwLock<LevelHandlerTables>,
}

#[derive(Debug, Default)]
pub(crate) struct LevelHandlerTables {
    pub(crate) tables: Vec<Table>,
    pub(crate) total_size: usize,
}

impl Deref for LevelHandler {
    type Target = LevelHandlerInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LevelHandlerTables {
    /// Half-open `[left, right)` index range of tables intersecting `kr`.
    /// Callers hold the level's read lock. Only meaningful at level >= 1
    /// where tables are ordered and disjoint.
    pub(crate) fn overlapping_tables(&self, kr: &KeyRange) -> (usize, usize) {
        if kr.is_empty() {
            return (0, 0);
        }
        if kr.is_inf() {
            return (0, self.tables.len());
        }
        let left = self
            .tables
            .partition_point(|t| KeyTsBorrow::cmp_bytes(t.biggest(), kr.left()).is_lt());
        let right = self
            .tables
            .partition_point(|t| KeyTsBorrow::cmp_bytes(t.smallest(), kr.right()).is_le());
        (left, right.max(left))
    }
}

impl LevelHandler {
    pub(crate) fn new(level: usize) -> Self {
        Self(Arc::new(LevelHandlerInner {
            level,
            handler_tables: RwLock::new(LevelHandlerTables::default()),
        }))
    }

    #[inline]
    pub(crate) fn get_level(&self) -> usize {
        self.level
    }

    pub(crate) async fn get_total_size(&self) -> usize {
        self.handler_tables.read().await.total_size
    }

    pub(crate) async fn num_tables(&self) -> usize {
        self.handler_tables.read().await.tables.len()
    }

    /// Replaces the whole table set, used at open. Level 0 sorts by id
    /// (newest last), higher levels by smallest key.
    pub(crate) async fn init_tables(&self, mut tables: Vec<Table>) {
        let mut tables_w = self.handler_tables.write().await;
        if self.level == 0 {
            tables.sort_by_key(|t| t.id());
        } else {
            tables.sort_by(|a, b| KeyTsBorrow::cmp_bytes(a.smallest(), b.smallest()));
        }
        tables_w.total_size = tables.iter().map(|t| t.size()).sum();
        tables_w.tables = tables;
    }

    /// Admits a fresh table at level 0 unless the level is at the stall
    /// ceiling. Takes a reference on success.
    pub(crate) async fn try_add_l0(&self, table: &Table, num_l0_stall: usize) -> bool {
        debug_assert_eq!(self.level, 0);
        let mut tables_w = self.handler_tables.write().await;
        if tables_w.tables.len() >= num_l0_stall {
            return false;
        }
        table.incr_ref();
        tables_w.total_size += table.size();
        tables_w.tables.push(table.clone());
        true
    }

    /// Splices `new_tables` over the stretch of existing tables their key
    /// range covers, for level >= 1. Returns the replaced tables; the
    /// caller drops those references once the lock is long gone.
    pub(crate) async fn replace_tables(&self, new_tables: &[Table]) -> Vec<Table> {
        debug_assert!(self.level >= 1);
        if new_tables.is_empty() {
            return Vec::new();
        }
        debug_assert!(assert_tables_order(new_tables).is_ok());
        let mut tables_w = self.handler_tables.write().await;
        for table in new_tables {
            table.incr_ref();
        }
        let kr = KeyRange::new(
            new_tables[0].smallest().to_vec(),
            new_tables[new_tables.len() - 1].biggest().to_vec(),
        );
        let (left, right) = tables_w.overlapping_tables(&kr);
        let replaced: Vec<Table> = tables_w
            .tables
            .splice(left..right, new_tables.iter().cloned())
            .collect();
        tables_w.total_size += new_tables.iter().map(|t| t.size()).sum::<usize>();
        tables_w.total_size -= replaced.iter().map(|t| t.size()).sum::<usize>();
        replaced
    }

    /// Drops every table whose id appears in `to_del`, preserving order.
    pub(crate) async fn delete_tables(&self, to_del: &[Table]) -> anyhow::Result<()> {
        let to_del_ids: HashSet<SSTableId> = to_del.iter().map(|t| t.id()).collect();
        let mut tables_w = self.handler_tables.write().await;
        let mut kept = Vec::with_capacity(tables_w.tables.len());
        let mut removed = Vec::new();
        for table in tables_w.tables.drain(..) {
            if to_del_ids.contains(&table.id()) {
                removed.push(table);
            } else {
                kept.push(table);
            }
        }
        tables_w.total_size -= removed.iter().map(|t| t.size()).sum::<usize>();
        tables_w.tables = kept;
        drop(tables_w);

        for table in removed {
            table.decr_ref()?;
        }
        Ok(())
    }

    /// Candidate tables for a point lookup, each with a reference taken.
    /// Level 0 returns all tables newest first; higher levels at most the
    /// one table whose range can contain the key.
    async fn ref_tables_for_key(&self, key: &[u8]) -> Vec<Table> {
        let tables_r = self.handler_tables.read().await;
        let out: Vec<Table> = if self.level == 0 {
            tables_r.tables.iter().rev().cloned().collect()
        } else {
            let index = tables_r
                .tables
                .partition_point(|t| KeyTsBorrow::cmp_bytes(t.biggest(), key).is_lt());
            match tables_r.tables.get(index) {
                Some(table) => vec![table.clone()],
                None => Vec::new(),
            }
        };
        for table in &out {
            table.incr_ref();
        }
        out
    }

    /// Newest version of `key` visible in this level, or the empty struct.
    pub(crate) async fn get(&self, key: &[u8]) -> anyhow::Result<ValueStruct> {
        let candidates = self.ref_tables_for_key(key).await;
        let user_key_hash = Bloom::hash(KeyTsBorrow(key).key());
        let mut best = ValueStruct::default();
        let mut first_err = None;
        for table in &candidates {
            if table.does_not_have_hash(user_key_hash) {
                continue;
            }
            match table.point_get(key) {
                Ok(found) => {
                    if !found.is_empty() && found.version() > best.version() {
                        best = found;
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        for table in candidates {
            table.decr_ref()?;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(best),
        }
    }

    /// Resolves whichever still-unfound pairs this level holds, flipping
    /// their found flag in place.
    pub(crate) async fn multi_get(&self, pairs: &mut [KvPair]) -> anyhow::Result<()> {
        if self.level == 0 {
            let candidates = self.ref_tables_for_key(&[]).await;
            for table in &candidates {
                let smallest = KeyTsBorrow(table.smallest());
                let biggest = KeyTsBorrow(table.biggest());
                for pair in pairs.iter_mut().filter(|p| !p.found()) {
                    let user_key = pair.key().key();
                    if user_key < smallest.key() || user_key > biggest.key() {
                        continue;
                    }
                    Self::probe(table, pair)?;
                }
            }
            for table in candidates {
                table.decr_ref()?;
            }
        } else {
            for pair in pairs.iter_mut().filter(|p| !p.found()) {
                let serialized = pair.key().serialize();
                let candidates = self.ref_tables_for_key(&serialized).await;
                for table in &candidates {
                    Self::probe(table, pair)?;
                }
                for table in candidates {
                    table.decr_ref()?;
                }
            }
        }
        Ok(())
    }

    fn probe(table: &Table, pair: &mut KvPair) -> anyhow::Result<()> {
        if table.does_not_have_hash(Bloom::hash(pair.key().key())) {
            return Ok(());
        }
        let found = table.point_get(&pair.key().serialize())?;
        if !found.is_empty() {
            pair.resolve(found);
        }
        Ok(())
    }

    /// Contributes this level's iterators for a scan: one per table at
    /// level 0 (newest first, they overlap), one concatenated iterator
    /// above.
    pub(crate) async fn append_iterators(&self, out: &mut Vec<LevelIter>, opts: IterOptions) {
        let tables_r = self.handler_tables.read().await;
        if self.level == 0 {
            for table in tables_r.tables.iter().rev() {
                out.push(LevelIter::Table(table.new_iterator(opts.reverse)));
            }
        } else if !tables_r.tables.is_empty() {
            out.push(LevelIter::Concat(ConcatIter::new(
                tables_r.tables.clone(),
                opts.reverse,
            )));
        }
    }

    /// Level 0 tables may overlap arbitrarily; above that adjacent tables
    /// must be strictly separated.
    pub(crate) async fn validate(&self) -> anyhow::Result<()> {
        if self.level == 0 {
            return Ok(());
        }
        let tables_r = self.handler_tables.read().await;
        assert_tables_order(&tables_r.tables)
    }

    /// Releases the handler's references at shutdown without deleting
    /// files.
    pub(crate) async fn close_tables(&self) {
        let mut tables_w = self.handler_tables.write().await;
        for table in tables_w.tables.drain(..) {
            table.close();
        }
        tables_w.total_size = 0;
    }
}

pub(crate) fn assert_tables_order(tables: &[Table]) -> anyhow::Result<()> {
    for window in tables.windows(2) {
        let (prev, next) = (&window[0], &window[1]);
        if KeyTsBorrow::cmp_bytes(prev.biggest(), next.smallest()).is_ge() {
            bail!(DBError::Corruption(format!(
                "tables {} and {} out of order or overlapping",
                prev.id(),
                next.id()
            )));
        }
    }
    for table in tables {
        if KeyTsBorrow::cmp_bytes(table.smallest(), table.biggest()).is_gt() {
            bail!(DBError::Corruption(format!(
                "table {} has inverted key bounds",
                table.id()
            )));
        }
    }
    Ok(())
}
