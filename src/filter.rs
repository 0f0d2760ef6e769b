use bytes::Bytes;

/// What a [`CompactionFilter`] wants done with a record it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Write the record through unchanged.
    Keep,
    /// Drop the record entirely.
    Drop,
    /// Replace the record with a delete marker for the same key.
    MarkTombstone,
}

/// User capability consulted by compactions. Only the newest visible
/// version of a key (the one at or below the read floor) is offered;
/// older versions of the same user key are dropped regardless.
pub trait CompactionFilter: Send + Sync {
    /// Sorted user keys at which output files must be split, whatever
    /// their size. Empty means no alignment constraint.
    fn guards(&self) -> Vec<Bytes> {
        Vec::new()
    }

    fn filter(&self, key: &[u8], value: &[u8], user_meta: u8) -> Decision;
}
