use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::remove_file;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::select;

use crate::errors::DBError;
use crate::filter::Decision;
use crate::iter::{IterOptions, LevelIter, SinkIterator};
use crate::kv::{KeyTs, KeyTsBorrow, KvPair, Meta, ValuePointer, ValueStruct};
use crate::manifest::{Manifest, ManifestChange, ManifestFile};
use crate::options::Options;
use crate::table::builder::TableBuilder;
use crate::table::iter::ConcatIter;
use crate::table::merge::MergeIter;
use crate::table::Table;
use crate::txn::oracle::Oracle;
use crate::util::closer::Closer;
use crate::util::rate_limiter::RateLimiter;
use crate::util::{sync_dir, SSTableId};
use crate::vlog::DiscardStats;

use super::compaction::{CompactStatus, KeyRange};
use super::handler::LevelHandler;

/// Top-level owner of the level hierarchy: spawns compaction workers,
/// arbitrates admission of fresh level-0 tables, coordinates the
/// manifest, and dispatches reads across levels.
#[derive(Debug)]
pub struct LevelsController {
    next_file_id: AtomicU64,
    l0_stalls_ms: AtomicI64,
    levels: Vec<LevelHandler>,
    compact_status: CompactStatus,
    level_max_sizes: Vec<usize>,
    manifest: Arc<ManifestFile>,
    oracle: Arc<Oracle>,
    discard_stats: Arc<DiscardStats>,
    rate_limiter: RateLimiter,
    compactors: Mutex<Option<Closer>>,
    opt: Arc<Options>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CompactionPriority {
    level: usize,
    score: f64,
}

/// One unit of compaction work: the chosen tables at `this_level`, their
/// overlap at `next_level`, and the reserved key ranges.
pub(crate) struct CompactDef {
    #[allow(dead_code)]
    compactor_id: usize,
    pub(crate) this_level: LevelHandler,
    pub(crate) next_level: LevelHandler,
    pub(crate) top: Vec<Table>,
    pub(crate) bottom: Vec<Table>,
    pub(crate) this_range: KeyRange,
    pub(crate) next_range: KeyRange,
    pub(crate) this_size: usize,
}

/// Diagnostics snapshot of one resident table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u64,
    pub level: usize,
    pub smallest: KeyTs,
    pub biggest: KeyTs,
    pub size: usize,
    pub num_entries: usize,
}

impl LevelsController {
    /// Opens the level hierarchy from the manifest: reconciles the
    /// directory listing, loads every referenced table into its level,
    /// validates ordering invariants and fsyncs the directory.
    pub async fn open(
        opt: Arc<Options>,
        oracle: Arc<Oracle>,
        discard_stats: Arc<DiscardStats>,
    ) -> anyhow::Result<Arc<LevelsController>> {
        opt.check()?;
        let manifest_file = Arc::new(ManifestFile::open(opt.dir(), opt.read_only())?);
        let manifest = manifest_file.manifest_clone();

        revert_to_manifest(
            &opt,
            &manifest,
            SSTableId::parse_set_from_dir(opt.dir()),
        )?;

        let mut level_tables: Vec<Vec<Table>> = Vec::new();
        level_tables.resize_with(opt.max_levels(), Vec::new);
        let mut max_file_id: u64 = 0;
        let mut opened: Vec<Table> = Vec::new();
        for (file_id, table_manifest) in manifest.tables.iter() {
            let path = file_id.join_dir(opt.dir());
            max_file_id = max_file_id.max((*file_id).into());
            let table = match Table::open(*file_id, &path) {
                Ok(table) => table,
                Err(e) => {
                    for t in opened {
                        t.close();
                    }
                    bail!("while opening table {:?}: {}", path, e);
                }
            };
            opened.push(table.clone());
            let level = (table_manifest.level as usize).min(opt.max_levels() - 1);
            level_tables[level].push(table);
        }
        info!(
            "opened {} tables across {} levels",
            opened.len(),
            opt.max_levels()
        );

        let mut level_max_sizes = vec![0usize; opt.max_levels()];
        if opt.max_levels() > 1 {
            level_max_sizes[1] = opt.l1_size();
            for i in 2..opt.max_levels() {
                level_max_sizes[i] = level_max_sizes[i - 1] * opt.size_multiplier();
            }
        }

        let controller = LevelsController {
            next_file_id: AtomicU64::new(max_file_id + 1),
            l0_stalls_ms: AtomicI64::new(0),
            levels: (0..opt.max_levels()).map(LevelHandler::new).collect(),
            compact_status: CompactStatus::new(opt.max_levels()),
            level_max_sizes,
            manifest: manifest_file,
            oracle,
            discard_stats,
            rate_limiter: RateLimiter::new(opt.compact_bytes_per_sec()),
            compactors: Mutex::new(None),
            opt,
        };
        for (level, tables) in level_tables.into_iter().enumerate() {
            controller.levels[level].init_tables(tables).await;
        }

        if let Err(e) = controller.validate().await {
            controller.cleanup_levels().await;
            bail!("level validation at open: {}", e);
        }
        if let Err(e) = sync_dir(controller.opt.dir()) {
            controller.cleanup_levels().await;
            bail!(e);
        }
        Ok(Arc::new(controller))
    }

    async fn validate(&self) -> anyhow::Result<()> {
        for handler in self.levels.iter() {
            handler
                .validate()
                .await
                .map_err(|e| anyhow!("levels controller: {}", e))?;
        }
        Ok(())
    }

    async fn cleanup_levels(&self) {
        for handler in self.levels.iter() {
            handler.close_tables().await;
        }
    }

    pub(crate) fn reserve_file_id(&self) -> SSTableId {
        self.next_file_id.fetch_add(1, AtomicOrdering::AcqRel).into()
    }

    // ---- workers -------------------------------------------------------

    /// Spawns `num_compactors` background workers. No-op for read-only
    /// engines.
    pub fn start_compact(self: &Arc<Self>) {
        if self.opt.read_only() || self.opt.num_compactors() == 0 {
            return;
        }
        let mut compactors = self.compactors.lock();
        if compactors.is_some() {
            return;
        }
        let closer = Closer::new(self.opt.num_compactors());
        for task_id in 0..self.opt.num_compactors() {
            let this = self.clone();
            let closer_c = closer.clone();
            tokio::spawn(async move {
                this.run_compact(task_id, closer_c).await;
            });
        }
        *compactors = Some(closer);
    }

    async fn run_compact(&self, task_id: usize, closer: Closer) {
        // Jittered start so workers do not stampede the planner.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = closer.captured() => {
                closer.done();
                return;
            }
        }
        debug!("compactor {} started", task_id);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            select! {
                _ = ticker.tick() => {
                    if self.opt.do_not_compact() {
                        continue;
                    }
                    self.run_once(task_id).await;
                }
                _ = closer.captured() => {
                    debug!("compactor {} stopped", task_id);
                    closer.done();
                    return;
                }
            }
        }
    }

    async fn run_once(&self, task_id: usize) {
        for priority in self.pick_compact_levels() {
            match self.do_compact(task_id, priority).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    // Abandoned compaction; the next tick retries.
                    error!(
                        "compactor {} on level {}: {}",
                        task_id, priority.level, e
                    );
                }
            }
        }
    }

    // ---- planner -------------------------------------------------------

    /// Scores every level that wants compaction, highest pressure first.
    /// Level 0 scores by table count, the rest by size beyond budget net
    /// of bytes already being moved in.
    pub(crate) fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        let mut priorities = Vec::new();
        // tokio's RwLock has no sync read path; table counts are kept
        // loosely via try_read so the planner never blocks a tick.
        if !self
            .compact_status
            .is_overlaps_with(0, &KeyRange::inf_range())
        {
            if let Ok(tables_r) = self.levels[0].handler_tables.try_read() {
                let num_tables = tables_r.tables.len();
                if num_tables >= self.opt.num_l0_compact_trigger() {
                    priorities.push(CompactionPriority {
                        level: 0,
                        score: num_tables as f64 / self.opt.num_l0_compact_trigger() as f64,
                    });
                }
            }
        }
        for level in 1..self.opt.max_levels() - 1 {
            let Ok(tables_r) = self.levels[level].handler_tables.try_read() else {
                continue;
            };
            let total_size = tables_r.total_size as i64;
            drop(tables_r);
            let delta = self.compact_status.delta_size(level);
            let max_size = self.level_max_sizes[level] as i64;
            if total_size >= max_size + delta {
                priorities.push(CompactionPriority {
                    level,
                    score: (total_size - delta) as f64 / max_size as f64,
                });
            }
        }
        priorities.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        priorities
    }

    /// Reserves all of level 0 plus its level-1 overlap. Level-0 tables
    /// overlap arbitrarily, so the reservation is the infinite range.
    async fn fill_tables_l0(&self, cd: &mut CompactDef) -> bool {
        let this_r = cd.this_level.handler_tables.read().await;
        let next_r = cd.next_level.handler_tables.read().await;
        if this_r.tables.is_empty() {
            return false;
        }
        let top = this_r.tables.clone();
        let kr = KeyRange::from_tables(&top).expect("level 0 is non-empty");

        let (left, right) = next_r.overlapping_tables(&kr);
        cd.bottom = next_r.tables[left..right].to_vec();
        cd.this_size = top.iter().map(|t| t.size()).sum();
        cd.this_range = KeyRange::inf_range();
        cd.next_range = if cd.bottom.is_empty() {
            kr
        } else {
            KeyRange::from_tables(&cd.bottom).expect("bottom is non-empty")
        };
        cd.top = top;

        let reserved = self.compact_status.compare_and_add(cd);
        drop(this_r);
        drop(next_r);
        reserved
    }

    /// Picks one table of `this_level` whose range is free, largest
    /// first. Boundary timestamps are widened so every version of the
    /// edge user keys travels with this compaction.
    async fn fill_tables(&self, cd: &mut CompactDef) -> bool {
        let this_r = cd.this_level.handler_tables.read().await;
        let next_r = cd.next_level.handler_tables.read().await;
        if this_r.tables.is_empty() {
            return false;
        }
        let mut candidates = this_r.tables.clone();
        candidates.sort_by(|a, b| b.size().cmp(&a.size()));

        for table in candidates {
            cd.this_size = table.size();
            cd.this_range = KeyRange::from_table(&table);
            if self
                .compact_status
                .is_overlaps_with(cd.this_level.get_level(), &cd.this_range)
            {
                continue;
            }
            cd.top = vec![table.clone()];

            let (left, right) = next_r.overlapping_tables(&cd.this_range);
            cd.bottom = next_r.tables[left..right].to_vec();

            if cd.bottom.is_empty() {
                cd.next_range = cd.this_range.clone();
                if !self.compact_status.compare_and_add(cd) {
                    continue;
                }
                return true;
            }
            cd.next_range = KeyRange::from_tables(&cd.bottom).expect("bottom is non-empty");

            if self
                .compact_status
                .is_overlaps_with(cd.next_level.get_level(), &cd.next_range)
            {
                continue;
            }
            if !self.compact_status.compare_and_add(cd) {
                continue;
            }
            return true;
        }
        false
    }

    // ---- compaction ----------------------------------------------------

    /// Attempts one compaction for `priority`. `Ok(false)` means no
    /// conflict-free work was available at that level.
    pub(crate) async fn do_compact(
        &self,
        task_id: usize,
        priority: CompactionPriority,
    ) -> anyhow::Result<bool> {
        let level = priority.level;
        debug_assert!(level + 1 < self.opt.max_levels());

        let mut cd = CompactDef {
            compactor_id: task_id,
            this_level: self.levels[level].clone(),
            next_level: self.levels[level + 1].clone(),
            top: Vec::new(),
            bottom: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            this_size: 0,
        };
        let filled = if level == 0 {
            self.fill_tables_l0(&mut cd).await
        } else {
            self.fill_tables(&mut cd).await
        };
        if !filled {
            debug!(
                "compactor {} found no free tables on level {}",
                task_id, level
            );
            return Ok(false);
        }

        let result = self.run_compact_def(task_id, &mut cd).await;
        self.compact_status.delete(&cd);
        result?;
        Ok(true)
    }

    async fn run_compact_def(&self, task_id: usize, cd: &mut CompactDef) -> anyhow::Result<()> {
        let time_start = Instant::now();
        let this_level = cd.this_level.get_level();
        let next_level = cd.next_level.get_level();

        // A table with nothing to merge below moves down unchanged.
        let (new_tables, move_down) = if this_level > 0 && cd.bottom.is_empty() {
            let reused = cd.top[0].clone();
            reused.incr_ref();
            (vec![reused], true)
        } else {
            (self.compact_build_tables(cd).await?, false)
        };

        let mut changes = Vec::with_capacity(new_tables.len() + cd.top.len() + cd.bottom.len());
        if move_down {
            for table in &new_tables {
                changes.push(ManifestChange::MoveDown {
                    id: table.id(),
                    level: next_level as u32,
                });
            }
        } else {
            for table in &new_tables {
                changes.push(ManifestChange::Create {
                    id: table.id(),
                    level: next_level as u32,
                });
            }
            for table in cd.top.iter().chain(cd.bottom.iter()) {
                changes.push(ManifestChange::Delete { id: table.id() });
            }
        }
        // The manifest must record the change set before any level is
        // touched; a crash between the two replays into the new state.
        if let Err(e) = self.manifest.add_changes(changes) {
            error!("manifest append failed, abandoning compaction: {}", e);
            for table in &new_tables {
                let _ = table.decr_ref();
            }
            return Err(e);
        }

        if new_tables.is_empty() {
            // Every record was dropped; the overlapped tables simply go.
            cd.next_level.delete_tables(&cd.bottom).await?;
        } else {
            let replaced = cd.next_level.replace_tables(&new_tables).await;
            for table in replaced {
                table.decr_ref()?;
            }
        }
        cd.this_level.delete_tables(&cd.top).await?;
        for table in &new_tables {
            table.decr_ref()?;
        }

        info!(
            "compactor {} merged {}+{} tables from level {} into {} tables at level {} in {:?}",
            task_id,
            cd.top.len(),
            cd.bottom.len(),
            this_level,
            new_tables.len(),
            next_level,
            time_start.elapsed(),
        );
        Ok(())
    }

    /// True when any level strictly below `from_level` holds keys inside
    /// the range of `tables`. Governs whether tombstones must be carried.
    async fn check_overlap(&self, tables: &[Table], from_level: usize) -> bool {
        let Some(kr) = KeyRange::from_tables(tables) else {
            return false;
        };
        for level in from_level..self.levels.len() {
            let tables_r = self.levels[level].handler_tables.read().await;
            let (left, right) = tables_r.overlapping_tables(&kr);
            if right > left {
                return true;
            }
        }
        false
    }

    /// Merge path of the executor: streams the inputs in key order into a
    /// sequence of new tables for the next level, dropping shadowed
    /// versions under the read floor, applying the compaction filter and
    /// splitting output at guard keys.
    async fn compact_build_tables(&self, cd: &CompactDef) -> anyhow::Result<Vec<Table>> {
        for table in cd.top.iter().chain(cd.bottom.iter()) {
            table.incr_ref();
        }
        let mut out_tables = Vec::new();
        let result = self.build_output_tables(cd, &mut out_tables).await;
        let mut release_err = None;
        for table in cd.top.iter().chain(cd.bottom.iter()) {
            if let Err(e) = table.decr_ref() {
                release_err.get_or_insert(e);
            }
        }
        if let Err(e) = result {
            for table in out_tables.drain(..) {
                let _ = table.decr_ref();
            }
            return Err(e);
        }
        if let Some(e) = release_err {
            return Err(e);
        }

        out_tables.sort_by(|a, b| KeyTsBorrow::cmp_bytes(a.biggest(), b.biggest()));
        sync_dir(self.opt.dir())?;
        Ok(out_tables)
    }

    async fn build_output_tables(
        &self,
        cd: &CompactDef,
        out_tables: &mut Vec<Table>,
    ) -> anyhow::Result<()> {
        let mut sources: Vec<LevelIter> = Vec::new();
        if cd.this_level.get_level() == 0 {
            // Level-0 tables overlap; each is its own source, newest
            // first so it wins merge ties.
            for table in cd.top.iter().rev() {
                sources.push(LevelIter::Table(table.new_iterator(false)));
            }
        } else {
            debug_assert_eq!(cd.top.len(), 1);
            sources.push(LevelIter::Table(cd.top[0].new_iterator(false)));
        }
        if !cd.bottom.is_empty() {
            sources.push(LevelIter::Concat(ConcatIter::new(cd.bottom.clone(), false)));
        }
        let mut iter = MergeIter::new(sources, false);
        let mut valid = iter.rewind()?;

        let all_input: Vec<Table> = cd.top.iter().chain(cd.bottom.iter()).cloned().collect();
        let has_overlap = self
            .check_overlap(&all_input, cd.next_level.get_level() + 1)
            .await;
        let min_read_ts = self.oracle.min_read_ts();
        let filter = self.opt.compaction_filter();
        let guards: Vec<Bytes> = filter.as_ref().map(|f| f.guards()).unwrap_or_default();

        let mut discard_spaces: HashMap<u32, u64> = HashMap::new();
        let mut num_skipped: u64 = 0;
        // User key of the last record written, and the user key whose
        // remaining (older) versions are being dropped.
        let mut last_key: Vec<u8> = Vec::new();
        let mut skip_key: Vec<u8> = Vec::new();

        while valid {
            let file_id = self.reserve_file_id();
            let path = file_id.join_dir(self.opt.dir());
            let mut builder = TableBuilder::new(
                self.opt.max_table_size(),
                self.opt.bloom_false_positive(),
            );
            let mut curr_guard: Option<Bytes> = None;

            while valid {
                let key = iter.key().expect("valid merge iterator");
                let user_key = key.key();
                let ts = key.txn_ts();
                let value = iter.value().expect("valid merge iterator");

                if !skip_key.is_empty() {
                    if user_key == skip_key.as_slice() {
                        num_skipped += 1;
                        collect_discard(&mut discard_spaces, &value);
                        valid = iter.next()?;
                        continue;
                    }
                    skip_key.clear();
                }

                if user_key != last_key.as_slice() {
                    if curr_guard.is_none() {
                        curr_guard = guards.iter().find(|g| g.as_ref() > user_key).cloned();
                    }
                    let past_guard = curr_guard
                        .as_ref()
                        .map(|g| user_key > g.as_ref())
                        .unwrap_or(false);
                    if past_guard || builder.reached_capacity() {
                        // Cut the file here; the next one re-derives its
                        // guard.
                        break;
                    }
                    last_key.clear();
                    last_key.extend_from_slice(user_key);
                }

                if ts <= min_read_ts {
                    // Newest version any reader can still see; everything
                    // older under this user key is shadowed.
                    skip_key.clear();
                    skip_key.extend_from_slice(user_key);

                    if value.is_deleted() {
                        // A tombstone only matters while deeper levels
                        // may hold the key.
                        if has_overlap {
                            builder.push(key, &value);
                        } else {
                            num_skipped += 1;
                        }
                        valid = iter.next()?;
                        continue;
                    }
                    if let Some(f) = filter.as_ref() {
                        match f.filter(&key, value.value(), value.user_meta()) {
                            Decision::MarkTombstone => {
                                num_skipped += 1;
                                collect_discard(&mut discard_spaces, &value);
                                if has_overlap {
                                    let marker = ValueStruct::new(
                                        Meta::DELETE,
                                        value.user_meta(),
                                        0,
                                        Bytes::new(),
                                    );
                                    builder.push(key, &marker);
                                }
                                valid = iter.next()?;
                                continue;
                            }
                            Decision::Drop => {
                                num_skipped += 1;
                                collect_discard(&mut discard_spaces, &value);
                                valid = iter.next()?;
                                continue;
                            }
                            Decision::Keep => {}
                        }
                    }
                }

                builder.push(key, &value);
                valid = iter.next()?;
            }

            if !builder.is_empty() {
                builder.finish(&path, &self.rate_limiter).await?;
                out_tables.push(Table::open(file_id, &path)?);
            }
        }

        if num_skipped > 0 {
            debug!(
                "compaction into level {} dropped {} records",
                cd.next_level.get_level(),
                num_skipped
            );
        }
        self.discard_stats.update_gc_stats(&discard_spaces);
        Ok(())
    }

    // ---- admission -----------------------------------------------------

    /// Admits a freshly built table into level 0, consuming the caller's
    /// reference. Blocks while level 0 sits at the stall ceiling; the
    /// only error surfaced is a manifest append failure.
    pub async fn add_level0_table(&self, table: Table) -> anyhow::Result<()> {
        if self.opt.read_only() {
            bail!(DBError::ReadOnly);
        }
        self.manifest.add_changes(vec![ManifestChange::Create {
            id: table.id(),
            level: 0,
        }])?;

        loop {
            if self.levels[0].try_add_l0(&table, self.opt.num_l0_stall()).await {
                break;
            }
            // Stalled. Wait for level 0 to fall below the compaction
            // trigger and level 1 back inside its budget, mirroring the
            // planner so progress is monotone.
            let stall_start = Instant::now();
            warn!("level 0 is at the stall ceiling, blocking admission");
            loop {
                let l0_pressure =
                    self.levels[0].num_tables().await >= self.opt.num_l0_compact_trigger();
                let l1_pressure =
                    self.levels[1].get_total_size().await >= self.level_max_sizes[1];
                if !l0_pressure && !l1_pressure {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let stalled_ms = stall_start.elapsed().as_millis() as i64;
            self.l0_stalls_ms.fetch_add(stalled_ms, AtomicOrdering::Relaxed);
            info!("level 0 admission resumed after {}ms", stalled_ms);
        }
        table.decr_ref()?;
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    /// Newest visible version of `key` (a serialized key whose TS is the
    /// read timestamp), searching levels top down. The first level with a
    /// hit wins.
    pub async fn get(&self, key: &[u8]) -> anyhow::Result<ValueStruct> {
        for handler in self.levels.iter() {
            let found = handler.get(key).await?;
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Ok(ValueStruct::default())
    }

    /// Batched [`LevelsController::get`]: each level resolves whatever is
    /// still unfound.
    pub async fn multi_get(&self, pairs: &mut [KvPair]) -> anyhow::Result<()> {
        for handler in self.levels.iter() {
            if pairs.iter().all(|p| p.found()) {
                return Ok(());
            }
            handler.multi_get(pairs).await?;
        }
        Ok(())
    }

    /// Collects the iterator stack for a full scan, levels top down.
    pub async fn append_iterators(&self, out: &mut Vec<LevelIter>, opts: IterOptions) {
        for handler in self.levels.iter() {
            handler.append_iterators(out, opts).await;
        }
    }

    /// Merged view over every level, for scans.
    pub async fn new_merge_iterator(&self, opts: IterOptions) -> MergeIter {
        let mut iters = Vec::new();
        self.append_iterators(&mut iters, opts).await;
        MergeIter::new(iters, opts.reverse)
    }

    pub async fn get_table_info(&self) -> Vec<TableInfo> {
        let mut infos = Vec::new();
        for handler in self.levels.iter() {
            let tables_r = handler.handler_tables.read().await;
            for table in tables_r.tables.iter() {
                infos.push(TableInfo {
                    id: table.id().into(),
                    level: handler.get_level(),
                    smallest: KeyTs::from(table.smallest()),
                    biggest: KeyTs::from(table.biggest()),
                    size: table.size(),
                    num_entries: table.num_entries(),
                });
            }
        }
        infos
    }

    /// Cumulative milliseconds level-0 admissions have spent stalled.
    pub fn l0_stall_ms(&self) -> i64 {
        self.l0_stalls_ms.load(AtomicOrdering::Relaxed)
    }

    /// Stops the workers, lets in-flight compactions finish, then
    /// releases every table without deleting files.
    pub async fn close(&self) -> anyhow::Result<()> {
        let closer = self.compactors.lock().take();
        if let Some(closer) = closer {
            closer.signal_and_wait().await;
        }
        self.cleanup_levels().await;
        Ok(())
    }
}

fn collect_discard(discard_spaces: &mut HashMap<u32, u64>, value: &ValueStruct) {
    if value.meta().contains(Meta::VALUE_POINTER) {
        if let Some(vp) = ValuePointer::decode(value.value()) {
            *discard_spaces.entry(vp.file_id()).or_default() += vp.len() as u64;
        }
    }
}

/// Reconciles the directory with the manifest at open: a referenced file
/// that is missing is corruption; an unreferenced file is leftover from
/// a crash and is removed.
pub(crate) fn revert_to_manifest(
    opt: &Options,
    manifest: &Manifest,
    dir_ids: HashSet<SSTableId>,
) -> anyhow::Result<()> {
    for (id, _) in manifest.tables.iter() {
        if !dir_ids.contains(id) {
            bail!(DBError::Corruption(format!(
                "file does not exist for table {}",
                id
            )));
        }
    }
    if opt.read_only() {
        return Ok(());
    }
    for id in dir_ids {
        if !manifest.tables.contains_key(&id) {
            debug!("table file {} not referenced in manifest, removing", id);
            let path = id.join_dir(opt.dir());
            remove_file(&path)
                .map_err(|e| anyhow!("while removing unreferenced table {:?}: {}", path, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::filter::CompactionFilter;
    use crate::iter::SinkIterator;
    use crate::kv::{KeyTs, TxnTs};
    use crate::table::test_util::{build_table, build_table_with_meta};
    use tempfile::tempdir;

    async fn open_controller(
        dir: &Path,
        oracle: &Arc<Oracle>,
        discard: &Arc<DiscardStats>,
        configure: impl FnOnce(&mut Options),
    ) -> Arc<LevelsController> {
        let mut opt = Options::default();
        opt.set_dir(dir.to_path_buf())
            .set_max_levels(5)
            .set_l1_size(10 << 20)
            .set_max_table_size(1 << 20)
            .set_num_compactors(0);
        configure(&mut opt);
        LevelsController::open(Arc::new(opt), oracle.clone(), discard.clone())
            .await
            .unwrap()
    }

    /// Builds a table file and installs it at `level`, going through the
    /// manifest like a real flush or compaction would.
    async fn install_table(
        ctrl: &LevelsController,
        level: usize,
        entries: &[(&[u8], u64, &[u8], Meta)],
    ) -> Table {
        let id = ctrl.reserve_file_id();
        let table = build_table_with_meta(ctrl.opt.dir(), id.into(), entries).await;
        ctrl.manifest
            .add_changes(vec![ManifestChange::Create {
                id,
                level: level as u32,
            }])
            .unwrap();
        if level == 0 {
            assert!(ctrl.levels[0].try_add_l0(&table, usize::MAX).await);
        } else {
            let replaced = ctrl.levels[level]
                .replace_tables(std::slice::from_ref(&table))
                .await;
            assert!(replaced.is_empty());
        }
        let handle = table.clone();
        table.decr_ref().unwrap();
        handle
    }

    fn read_key(user_key: &[u8]) -> Vec<u8> {
        KeyTs::new(user_key.to_vec(), TxnTs::MAX).serialize()
    }

    fn priority(level: usize) -> CompactionPriority {
        CompactionPriority { level, score: 1.0 }
    }

    async fn level_ids(ctrl: &LevelsController, level: usize) -> Vec<u64> {
        ctrl.get_table_info()
            .await
            .into_iter()
            .filter(|info| info.level == level)
            .map(|info| info.id)
            .collect()
    }

    #[tokio::test]
    async fn l0_compaction_merges_into_empty_l1() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |opt| {
            opt.set_num_l0_compact_trigger(3).set_num_l0_stall(5);
        })
        .await;

        for (keys, ts) in [
            (&[&b"a"[..], &b"b"[..]], 1u64),
            (&[&b"b"[..], &b"c"[..]], 2),
            (&[&b"c"[..], &b"d"[..]], 3),
        ] {
            let id = ctrl.reserve_file_id();
            let entries: Vec<(&[u8], u64, &[u8])> =
                keys.iter().map(|k| (*k, ts, &b"v"[..])).collect();
            let table = build_table(ctrl.opt.dir(), id.into(), &entries).await;
            ctrl.add_level0_table(table).await.unwrap();
        }
        assert_eq!(ctrl.levels[0].num_tables().await, 3);

        let prios = ctrl.pick_compact_levels();
        assert_eq!(prios[0].level, 0);
        assert!(prios[0].score >= 1.0);
        assert!(ctrl.do_compact(0, prios[0]).await.unwrap());

        assert_eq!(ctrl.levels[0].num_tables().await, 0);
        let l1_count = ctrl.levels[1].num_tables().await;
        assert!((1..=2).contains(&l1_count));
        ctrl.validate().await.unwrap();

        let got = ctrl.get(&read_key(b"b")).await.unwrap();
        assert_eq!(got.version(), 2.into());
        let got = ctrl.get(&read_key(b"c")).await.unwrap();
        assert_eq!(got.version(), 3.into());
        assert!(ctrl.get(&read_key(b"zz")).await.unwrap().is_empty());
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn l1_to_l2_drops_shadowed_versions() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        install_table(
            &ctrl,
            1,
            &[
                (b"a", 5, b"a5", Meta::empty()),
                (b"e", 5, b"e5", Meta::empty()),
                (b"m", 5, b"m5", Meta::empty()),
            ],
        )
        .await;
        install_table(
            &ctrl,
            2,
            &[(b"a", 1, b"a1", Meta::empty()), (b"f", 1, b"f1", Meta::empty())],
        )
        .await;
        install_table(
            &ctrl,
            2,
            &[(b"g", 1, b"g1", Meta::empty()), (b"n", 1, b"n1", Meta::empty())],
        )
        .await;
        let old_ids: HashSet<u64> = ctrl
            .get_table_info()
            .await
            .iter()
            .map(|info| info.id)
            .collect();

        oracle.set_discard_ts(TxnTs::MAX);
        assert!(ctrl.do_compact(0, priority(1)).await.unwrap());

        assert_eq!(ctrl.levels[1].num_tables().await, 0);
        ctrl.validate().await.unwrap();

        // One version per user key: a e f g m n, with "a" collapsed to
        // the newer write.
        let infos = ctrl.get_table_info().await;
        let total_entries: usize = infos.iter().map(|info| info.num_entries).sum();
        assert_eq!(total_entries, 6);
        let got = ctrl.get(&read_key(b"a")).await.unwrap();
        assert_eq!(got.value(), b"a5");
        assert_eq!(got.version(), 5.into());

        // Manifest: the three inputs are gone, the outputs live at L2.
        let manifest = ctrl.manifest.manifest_clone();
        for info in &infos {
            assert!(!old_ids.contains(&info.id));
            assert_eq!(manifest.tables[&SSTableId::from(info.id)].level, 2);
        }
        assert_eq!(manifest.tables.len(), infos.len());
        ctrl.close().await.unwrap();
    }

    struct MarkAll;
    impl CompactionFilter for MarkAll {
        fn filter(&self, _key: &[u8], _value: &[u8], _user_meta: u8) -> Decision {
            Decision::MarkTombstone
        }
    }

    #[tokio::test]
    async fn filter_tombstones_without_overlap_drop_everything() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |opt| {
            opt.set_compaction_filter(Arc::new(MarkAll));
        })
        .await;

        install_table(
            &ctrl,
            1,
            &[(b"a", 5, b"a5", Meta::empty()), (b"c", 5, b"c5", Meta::empty())],
        )
        .await;
        install_table(
            &ctrl,
            2,
            &[(b"a", 1, b"a1", Meta::empty()), (b"c", 1, b"c1", Meta::empty())],
        )
        .await;

        oracle.set_discard_ts(TxnTs::MAX);
        assert!(ctrl.do_compact(0, priority(1)).await.unwrap());

        // No level below L2 holds these keys, so the synthetic
        // tombstones are dropped too: zero output tables.
        assert_eq!(ctrl.levels[1].num_tables().await, 0);
        assert_eq!(ctrl.levels[2].num_tables().await, 0);
        assert!(ctrl.manifest.manifest_clone().tables.is_empty());
        assert!(ctrl.get(&read_key(b"a")).await.unwrap().is_empty());
        ctrl.close().await.unwrap();
    }

    struct GuardAt(&'static [u8]);
    impl CompactionFilter for GuardAt {
        fn guards(&self) -> Vec<Bytes> {
            vec![Bytes::from_static(self.0)]
        }
        fn filter(&self, _key: &[u8], _value: &[u8], _user_meta: u8) -> Decision {
            Decision::Keep
        }
    }

    #[tokio::test]
    async fn guards_split_output_files() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |opt| {
            opt.set_compaction_filter(Arc::new(GuardAt(b"m")));
        })
        .await;

        install_table(
            &ctrl,
            0,
            &[
                (b"a", 1, b"v", Meta::empty()),
                (b"b", 1, b"v", Meta::empty()),
                (b"l", 1, b"v", Meta::empty()),
                (b"n", 1, b"v", Meta::empty()),
                (b"z", 1, b"v", Meta::empty()),
            ],
        )
        .await;

        assert!(ctrl.do_compact(0, priority(0)).await.unwrap());

        let infos = ctrl.get_table_info().await;
        assert_eq!(infos.len(), 2, "expected a split at the guard");
        let below: &TableInfo = infos
            .iter()
            .find(|info| info.smallest.key() == b"a")
            .unwrap();
        let above: &TableInfo = infos
            .iter()
            .find(|info| info.smallest.key() == b"n")
            .unwrap();
        assert!(below.biggest.key() <= &b"m"[..]);
        assert!(above.smallest.key() > &b"m"[..]);
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_admission_resumes_after_compaction() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |opt| {
            opt.set_num_l0_compact_trigger(2).set_num_l0_stall(4);
        })
        .await;

        for i in 0..4u64 {
            let id = ctrl.reserve_file_id();
            let user_key = format!("k{i}");
            let table = build_table(
                ctrl.opt.dir(),
                id.into(),
                &[(user_key.as_bytes(), i + 1, &b"v"[..])],
            )
            .await;
            ctrl.add_level0_table(table).await.unwrap();
        }
        assert_eq!(ctrl.levels[0].num_tables().await, 4);

        let id = ctrl.reserve_file_id();
        let overflow = build_table(ctrl.opt.dir(), id.into(), &[(b"k9", 9, b"v")]).await;
        let admitter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.add_level0_table(overflow).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!admitter.is_finished(), "admission should be stalled");

        // Compaction relieves the pressure and the blocked admission
        // completes on its own.
        assert!(ctrl.do_compact(0, priority(0)).await.unwrap());
        tokio::time::timeout(Duration::from_secs(2), admitter)
            .await
            .expect("admission stayed stalled")
            .unwrap()
            .unwrap();
        assert_eq!(ctrl.levels[0].num_tables().await, 1);
        assert!(ctrl.l0_stall_ms() >= 0);
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_reservations_lose_cleanly() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        install_table(&ctrl, 3, &[(b"a", 1, b"v", Meta::empty()), (b"c", 1, b"v", Meta::empty())])
            .await;

        let mut first = CompactDef {
            compactor_id: 0,
            this_level: ctrl.levels[3].clone(),
            next_level: ctrl.levels[4].clone(),
            top: Vec::new(),
            bottom: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            this_size: 0,
        };
        assert!(ctrl.fill_tables(&mut first).await);

        let mut second = CompactDef {
            compactor_id: 1,
            this_level: ctrl.levels[3].clone(),
            next_level: ctrl.levels[4].clone(),
            top: Vec::new(),
            bottom: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            this_size: 0,
        };
        // The only candidate table is reserved; the second planner loses.
        assert!(!ctrl.fill_tables(&mut second).await);

        ctrl.compact_status.delete(&first);
        assert!(ctrl.fill_tables(&mut second).await);
        ctrl.compact_status.delete(&second);
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn move_down_reuses_the_table_file() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        let table = install_table(
            &ctrl,
            1,
            &[(b"a", 1, b"v", Meta::empty()), (b"c", 1, b"v", Meta::empty())],
        )
        .await;
        let id: u64 = table.id().into();

        assert!(ctrl.do_compact(0, priority(1)).await.unwrap());

        assert_eq!(level_ids(&ctrl, 1).await, Vec::<u64>::new());
        assert_eq!(level_ids(&ctrl, 2).await, vec![id]);
        let manifest = ctrl.manifest.manifest_clone();
        assert_eq!(manifest.tables[&SSTableId::from(id)].level, 2);
        assert!(table.id().join_dir(ctrl.opt.dir()).exists());
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn tombstone_lifted_only_while_deeper_levels_hold_the_key() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        // Deep version at L3 forces the tombstone to survive L1->L2.
        install_table(&ctrl, 1, &[(b"k", 5, b"", Meta::DELETE)]).await;
        install_table(&ctrl, 2, &[(b"k", 3, b"k3", Meta::empty())]).await;
        install_table(&ctrl, 3, &[(b"k", 1, b"k1", Meta::empty())]).await;

        oracle.set_discard_ts(TxnTs::MAX);
        assert!(ctrl.do_compact(0, priority(1)).await.unwrap());

        let got = ctrl.get(&read_key(b"k")).await.unwrap();
        assert!(got.is_deleted());
        assert_eq!(got.version(), 5.into());

        // Compact again into L3: now nothing lies deeper, the tombstone
        // and the stale L3 version both disappear.
        assert!(ctrl.do_compact(0, priority(2)).await.unwrap());
        assert_eq!(ctrl.levels[2].num_tables().await, 0);
        assert_eq!(ctrl.levels[3].num_tables().await, 0);
        assert!(ctrl.get(&read_key(b"k")).await.unwrap().is_empty());
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_value_pointers_feed_gc_stats() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        let pointer = ValuePointer::new(7, 64, 0).encode();
        install_table(&ctrl, 1, &[(b"k", 5, b"fresh", Meta::empty())]).await;
        install_table(&ctrl, 2, &[(b"k", 3, &pointer, Meta::VALUE_POINTER)]).await;

        oracle.set_discard_ts(TxnTs::MAX);
        assert!(ctrl.do_compact(0, priority(1)).await.unwrap());

        assert_eq!(discard.snapshot().get(&7), Some(&64));
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn scan_merges_levels_in_key_order() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        install_table(&ctrl, 0, &[(b"b", 7, b"b7", Meta::empty())]).await;
        install_table(&ctrl, 1, &[(b"a", 1, b"a1", Meta::empty()), (b"b", 1, b"b1", Meta::empty())])
            .await;
        install_table(&ctrl, 2, &[(b"c", 1, b"c1", Meta::empty())]).await;

        let mut iter = ctrl.new_merge_iterator(IterOptions::default()).await;
        let mut seen = Vec::new();
        while iter.next().unwrap() {
            let key = iter.key().unwrap();
            seen.push((key.key().to_vec(), key.txn_ts().to_u64()));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 7),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 1),
            ]
        );
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn multi_get_spans_levels() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        install_table(&ctrl, 0, &[(b"a", 7, b"a7", Meta::empty())]).await;
        install_table(&ctrl, 1, &[(b"b", 1, b"b1", Meta::empty())]).await;

        let mut pairs = vec![
            KvPair::new(KeyTs::new(&b"a"[..], TxnTs::MAX)),
            KvPair::new(KeyTs::new(&b"b"[..], TxnTs::MAX)),
            KvPair::new(KeyTs::new(&b"missing"[..], TxnTs::MAX)),
        ];
        ctrl.multi_get(&mut pairs).await.unwrap();
        assert!(pairs[0].found());
        assert_eq!(pairs[0].value().value(), b"a7");
        assert!(pairs[1].found());
        assert!(!pairs[2].found());
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_restores_levels_and_removes_orphans() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;

        install_table(&ctrl, 1, &[(b"a", 1, b"v", Meta::empty())]).await;
        install_table(&ctrl, 2, &[(b"b", 1, b"v", Meta::empty())]).await;
        ctrl.close().await.unwrap();
        drop(ctrl);

        // A table file the manifest never heard of is swept at open.
        let orphan = SSTableId::from(9_999).join_dir(dir.path());
        std::fs::write(&orphan, b"junk").unwrap();

        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;
        assert!(!orphan.exists());
        assert_eq!(ctrl.levels[1].num_tables().await, 1);
        assert_eq!(ctrl.levels[2].num_tables().await, 1);
        assert_eq!(ctrl.get(&read_key(b"a")).await.unwrap().version(), 1.into());
        ctrl.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_referenced_table_file_is_corruption() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |_| {}).await;
        let table = install_table(&ctrl, 1, &[(b"a", 1, b"v", Meta::empty())]).await;
        let path = table.id().join_dir(ctrl.opt.dir());
        ctrl.close().await.unwrap();
        drop(ctrl);

        std::fs::remove_file(&path).unwrap();
        let mut opt = Options::default();
        opt.set_dir(dir.path().to_path_buf()).set_max_levels(5);
        let err = LevelsController::open(Arc::new(opt), oracle.clone(), discard.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn workers_drain_on_close() {
        let dir = tempdir().unwrap();
        let oracle = Arc::new(Oracle::new());
        let discard = Arc::new(DiscardStats::new());
        let ctrl = open_controller(dir.path(), &oracle, &discard, |opt| {
            opt.set_num_compactors(2);
        })
        .await;
        ctrl.start_compact();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), ctrl.close())
            .await
            .expect("workers did not drain")
            .unwrap();
    }
}
