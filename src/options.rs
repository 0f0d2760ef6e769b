use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;

use crate::errors::DBError;
use crate::filter::CompactionFilter;

/// Engine configuration. Built once by the caller and shared behind an
/// `Arc`; validated by [`Options::check`] before the engine opens.
#[derive(Clone)]
pub struct Options {
    dir: PathBuf,
    max_levels: usize,
    num_l0_compact_trigger: usize,
    num_l0_stall: usize,
    l1_size: usize,
    size_multiplier: usize,
    max_table_size: usize,
    num_compactors: usize,
    max_sub_compaction: usize,
    bloom_false_positive: f64,
    compact_bytes_per_sec: usize,
    read_only: bool,
    do_not_compact: bool,
    compaction_filter: Option<Arc<dyn CompactionFilter>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tmp/timber"),
            max_levels: 7,
            num_l0_compact_trigger: 5,
            num_l0_stall: 15,
            l1_size: 256 << 20,
            size_multiplier: 10,
            max_table_size: 64 << 20,
            num_compactors: 3,
            max_sub_compaction: 1,
            bloom_false_positive: 0.01,
            compact_bytes_per_sec: 0,
            read_only: false,
            do_not_compact: false,
            compaction_filter: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("dir", &self.dir)
            .field("max_levels", &self.max_levels)
            .field("num_l0_compact_trigger", &self.num_l0_compact_trigger)
            .field("num_l0_stall", &self.num_l0_stall)
            .field("l1_size", &self.l1_size)
            .field("size_multiplier", &self.size_multiplier)
            .field("max_table_size", &self.max_table_size)
            .field("num_compactors", &self.num_compactors)
            .field("read_only", &self.read_only)
            .field("do_not_compact", &self.do_not_compact)
            .finish()
    }
}

impl Options {
    pub fn set_dir(&mut self, dir: PathBuf) -> &mut Self {
        self.dir = dir;
        self
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn set_max_levels(&mut self, max_levels: usize) -> &mut Self {
        self.max_levels = max_levels;
        self
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    pub fn set_num_l0_compact_trigger(&mut self, n: usize) -> &mut Self {
        self.num_l0_compact_trigger = n;
        self
    }

    pub fn num_l0_compact_trigger(&self) -> usize {
        self.num_l0_compact_trigger
    }

    pub fn set_num_l0_stall(&mut self, n: usize) -> &mut Self {
        self.num_l0_stall = n;
        self
    }

    pub fn num_l0_stall(&self) -> usize {
        self.num_l0_stall
    }

    pub fn set_l1_size(&mut self, size: usize) -> &mut Self {
        self.l1_size = size;
        self
    }

    pub fn l1_size(&self) -> usize {
        self.l1_size
    }

    pub fn set_size_multiplier(&mut self, mult: usize) -> &mut Self {
        self.size_multiplier = mult;
        self
    }

    pub fn size_multiplier(&self) -> usize {
        self.size_multiplier
    }

    pub fn set_max_table_size(&mut self, size: usize) -> &mut Self {
        self.max_table_size = size;
        self
    }

    pub fn max_table_size(&self) -> usize {
        self.max_table_size
    }

    pub fn set_num_compactors(&mut self, n: usize) -> &mut Self {
        self.num_compactors = n;
        self
    }

    pub fn num_compactors(&self) -> usize {
        self.num_compactors
    }

    pub fn set_max_sub_compaction(&mut self, n: usize) -> &mut Self {
        self.max_sub_compaction = n;
        self
    }

    pub fn max_sub_compaction(&self) -> usize {
        self.max_sub_compaction
    }

    pub fn set_bloom_false_positive(&mut self, p: f64) -> &mut Self {
        self.bloom_false_positive = p;
        self
    }

    pub fn bloom_false_positive(&self) -> f64 {
        self.bloom_false_positive
    }

    pub fn set_compact_bytes_per_sec(&mut self, bytes: usize) -> &mut Self {
        self.compact_bytes_per_sec = bytes;
        self
    }

    pub fn compact_bytes_per_sec(&self) -> usize {
        self.compact_bytes_per_sec
    }

    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_do_not_compact(&mut self, do_not_compact: bool) -> &mut Self {
        self.do_not_compact = do_not_compact;
        self
    }

    pub fn do_not_compact(&self) -> bool {
        self.do_not_compact
    }

    pub fn set_compaction_filter(&mut self, filter: Arc<dyn CompactionFilter>) -> &mut Self {
        self.compaction_filter = Some(filter);
        self
    }

    pub(crate) fn compaction_filter(&self) -> Option<Arc<dyn CompactionFilter>> {
        self.compaction_filter.clone()
    }

    pub(crate) fn check(&self) -> anyhow::Result<()> {
        if self.max_levels < 2 {
            bail!(DBError::InvalidOptions(
                "max_levels must be at least 2".into()
            ));
        }
        if self.num_l0_stall <= self.num_l0_compact_trigger {
            bail!(DBError::InvalidOptions(format!(
                "num_l0_stall ({}) must exceed num_l0_compact_trigger ({})",
                self.num_l0_stall, self.num_l0_compact_trigger
            )));
        }
        if self.size_multiplier < 2 {
            bail!(DBError::InvalidOptions(
                "size_multiplier must be at least 2".into()
            ));
        }
        Ok(())
    }
}
