use std::collections::HashMap;

use parking_lot::Mutex;

/// Per-value-log-file byte counts of data made dead by compactions. The
/// value log garbage collector reads these to decide which files to
/// rewrite.
#[derive(Debug, Default)]
pub struct DiscardStats {
    inner: Mutex<HashMap<u32, u64>>,
}

impl DiscardStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_gc_stats(&self, stats: &HashMap<u32, u64>) {
        if stats.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for (file_id, bytes) in stats {
            *inner.entry(*file_id).or_default() += bytes;
        }
    }

    pub fn snapshot(&self) -> HashMap<u32, u64> {
        self.inner.lock().clone()
    }
}
