use parking_lot::Mutex;

use crate::kv::TxnTs;

/// Timestamp authority. The compaction core consumes only the read
/// floor: versions at or below [`Oracle::min_read_ts`] that are shadowed
/// by a newer version are safe to drop.
#[derive(Debug, Default)]
pub struct Oracle {
    inner: Mutex<OracleInner>,
}

#[derive(Debug, Default)]
struct OracleInner {
    next_txn_ts: TxnTs,
    discard_ts: TxnTs,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum timestamp any ongoing reader may still request.
    pub fn min_read_ts(&self) -> TxnTs {
        self.inner.lock().discard_ts
    }

    /// Advances the read floor. Must never move backwards.
    pub fn set_discard_ts(&self, ts: TxnTs) {
        let mut inner = self.inner.lock();
        debug_assert!(ts >= inner.discard_ts);
        inner.discard_ts = ts;
        inner.next_txn_ts = inner.next_txn_ts.max(ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_moves_forward() {
        let oracle = Oracle::new();
        assert_eq!(oracle.min_read_ts(), TxnTs::default());
        oracle.set_discard_ts(7.into());
        assert_eq!(oracle.min_read_ts(), 7.into());
    }
}
