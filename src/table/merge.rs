use crate::iter::{LevelIter, SinkIterator};
use crate::kv::{KeyTsBorrow, ValueStruct};

/// K-way merge over level iterators, yielding records in key order
/// (user key ascending, timestamp descending; both flipped when
/// reversed). When several sources sit on the same full key, the
/// earliest source wins and the duplicates are skipped, so source order
/// encodes shadowing priority (newest level-0 table first).
pub struct MergeIter {
    sources: Vec<LevelIter>,
    reverse: bool,
    valid: Vec<bool>,
    winner: Option<usize>,
    initialized: bool,
}

impl MergeIter {
    pub fn new(sources: Vec<LevelIter>, reverse: bool) -> Self {
        let n = sources.len();
        Self {
            sources,
            reverse,
            valid: vec![false; n],
            winner: None,
            initialized: false,
        }
    }

    fn pick_winner(&mut self) {
        let mut winner: Option<usize> = None;
        for i in 0..self.sources.len() {
            if !self.valid[i] {
                continue;
            }
            match winner {
                None => winner = Some(i),
                Some(w) => {
                    let key_i = self.sources[i].key().expect("valid source has a key");
                    let key_w = self.sources[w].key().expect("valid source has a key");
                    let ord = key_i.cmp(&key_w);
                    let better = if self.reverse {
                        ord.is_gt()
                    } else {
                        ord.is_lt()
                    };
                    if better {
                        winner = Some(i);
                    }
                }
            }
        }
        self.winner = winner;
    }

    fn advance_source(&mut self, i: usize) -> anyhow::Result<()> {
        self.valid[i] = self.sources[i].next()?;
        Ok(())
    }
}

impl SinkIterator for MergeIter {
    fn next(&mut self) -> anyhow::Result<bool> {
        if !self.initialized {
            return self.rewind();
        }
        let Some(winner) = self.winner else {
            return Ok(false);
        };
        let current = self.sources[winner]
            .key()
            .expect("winner has a key")
            .to_vec();
        for i in 0..self.sources.len() {
            if self.valid[i]
                && self.sources[i].key().expect("valid source has a key").0 == current.as_slice()
            {
                self.advance_source(i)?;
            }
        }
        self.pick_winner();
        Ok(self.winner.is_some())
    }

    fn rewind(&mut self) -> anyhow::Result<bool> {
        self.initialized = true;
        for i in 0..self.sources.len() {
            self.valid[i] = self.sources[i].rewind()?;
        }
        self.pick_winner();
        Ok(self.winner.is_some())
    }

    fn seek(&mut self, target: &[u8]) -> anyhow::Result<bool> {
        self.initialized = true;
        for i in 0..self.sources.len() {
            self.valid[i] = self.sources[i].seek(target)?;
        }
        self.pick_winner();
        Ok(self.winner.is_some())
    }

    fn key(&self) -> Option<KeyTsBorrow<'_>> {
        self.winner.and_then(|w| self.sources[w].key())
    }

    fn value(&self) -> Option<ValueStruct> {
        self.winner.and_then(|w| self.sources[w].value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyTs;
    use crate::table::iter::ConcatIter;
    use crate::table::test_util::build_table;
    use tempfile::tempdir;

    #[tokio::test]
    async fn merge_yields_all_versions_newest_first() {
        let dir = tempdir().unwrap();
        // Overlapping level-0 style tables: "b" has versions in both.
        let newer = build_table(dir.path(), 2, &[(b"b", 5, b"b5"), (b"c", 5, b"c5")]).await;
        let older = build_table(dir.path(), 1, &[(b"a", 1, b"a1"), (b"b", 1, b"b1")]).await;

        let mut merge = MergeIter::new(
            vec![
                LevelIter::Table(newer.new_iterator(false)),
                LevelIter::Table(older.new_iterator(false)),
            ],
            false,
        );
        let mut seen = Vec::new();
        while merge.next().unwrap() {
            let key = merge.key().unwrap();
            seen.push((key.key().to_vec(), key.txn_ts().to_u64()));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 5),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 5),
            ]
        );
        newer.close();
        older.close();
    }

    #[tokio::test]
    async fn identical_full_keys_collapse_to_first_source() {
        let dir = tempdir().unwrap();
        let first = build_table(dir.path(), 1, &[(b"k", 3, b"from-first")]).await;
        let second = build_table(dir.path(), 2, &[(b"k", 3, b"from-second")]).await;

        let mut merge = MergeIter::new(
            vec![
                LevelIter::Table(first.new_iterator(false)),
                LevelIter::Table(second.new_iterator(false)),
            ],
            false,
        );
        assert!(merge.next().unwrap());
        assert_eq!(merge.value().unwrap().value(), b"from-first");
        assert!(!merge.next().unwrap());
        first.close();
        second.close();
    }

    #[tokio::test]
    async fn merge_seek_and_concat_source() {
        let dir = tempdir().unwrap();
        let t1 = build_table(dir.path(), 1, &[(b"a", 1, b"1"), (b"c", 1, b"3")]).await;
        let t2 = build_table(dir.path(), 2, &[(b"e", 1, b"5")]).await;
        let l0 = build_table(dir.path(), 3, &[(b"b", 2, b"2")]).await;

        let mut merge = MergeIter::new(
            vec![
                LevelIter::Table(l0.new_iterator(false)),
                LevelIter::Concat(ConcatIter::new(vec![t1.clone(), t2.clone()], false)),
            ],
            false,
        );
        let target = KeyTs::new(&b"b"[..], u64::MAX.into()).serialize();
        assert!(merge.seek(&target).unwrap());
        assert_eq!(merge.key().unwrap().key(), b"b");
        assert!(merge.next().unwrap());
        assert_eq!(merge.key().unwrap().key(), b"c");
        assert!(merge.next().unwrap());
        assert_eq!(merge.key().unwrap().key(), b"e");
        assert!(!merge.next().unwrap());

        t1.close();
        t2.close();
        l0.close();
    }
}
