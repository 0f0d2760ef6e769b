pub(crate) mod closer;
pub(crate) mod rate_limiter;

use std::collections::HashSet;
use std::fs::{read_dir, File};
use std::path::{Path, PathBuf};

use anyhow::anyhow;

pub(crate) const SSTABLE_FILE_EXT: &str = ".sst";

/// Identifier of one on-disk sorted table file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SSTableId(u64);

impl From<u64> for SSTableId {
    fn from(value: u64) -> Self {
        SSTableId(value)
    }
}

impl From<SSTableId> for u64 {
    fn from(value: SSTableId) -> Self {
        value.0
    }
}

impl std::fmt::Display for SSTableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SSTableId {
    pub(crate) fn join_dir(&self, dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(format!("{:06}{}", self.0, SSTABLE_FILE_EXT))
    }

    pub(crate) fn parse_from_path(path: &Path) -> Option<SSTableId> {
        let name = path.file_name()?.to_str()?;
        let id = name.strip_suffix(SSTABLE_FILE_EXT)?;
        id.parse::<u64>().ok().map(SSTableId)
    }

    pub(crate) fn parse_set_from_dir(dir: impl AsRef<Path>) -> HashSet<SSTableId> {
        let mut set = HashSet::new();
        let Ok(entries) = read_dir(dir) else {
            return set;
        };
        for entry in entries.flatten() {
            if let Some(id) = Self::parse_from_path(&entry.path()) {
                set.insert(id);
            }
        }
        set
    }
}

/// Fsync a directory so that entry creations and removals inside it are
/// durable.
pub(crate) fn sync_dir(dir: impl AsRef<Path>) -> anyhow::Result<()> {
    let fd = File::open(dir.as_ref())
        .map_err(|e| anyhow!("while opening directory {:?} for sync: {}", dir.as_ref(), e))?;
    fd.sync_all()
        .map_err(|e| anyhow!("while syncing directory {:?}: {}", dir.as_ref(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sstable_id_path_roundtrip() {
        let dir = PathBuf::from("/data/engine");
        let id = SSTableId::from(42);
        let path = id.join_dir(&dir);
        assert_eq!(path, dir.join("000042.sst"));
        assert_eq!(SSTableId::parse_from_path(&path), Some(id));
        assert_eq!(SSTableId::parse_from_path(Path::new("/data/MANIFEST")), None);
    }
}
