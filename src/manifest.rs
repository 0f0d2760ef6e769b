use std::collections::{HashMap, HashSet};
use std::fs::{rename, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::errors::err_file;
use crate::util::{sync_dir, SSTableId};

pub(crate) const MANIFEST_FILE_NAME: &str = "MANIFEST";
const MANIFEST_REWRITE_FILE_NAME: &str = "MANIFEST-REWRITE";
const MANIFEST_DELETIONS_REWRITE_THRESHOLD: isize = 10_000;
const MANIFEST_DELETIONS_RATIO: isize = 10;

const MAGIC_TEXT: &[u8; 4] = b"Tmbr";
const MAGIC_VERSION: u16 = 1;

/// In-memory view of the manifest: which table ids exist and at which
/// level each lives. Any replay of the change stream in order rebuilds
/// it.
#[derive(Debug, Default, Clone)]
pub(crate) struct Manifest {
    levels: Vec<LevelManifest>,
    pub(crate) tables: HashMap<SSTableId, TableManifest>,
    creations: isize,
    deletions: isize,
}

#[derive(Debug, Default, Clone)]
struct LevelManifest {
    tables: HashSet<SSTableId>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TableManifest {
    pub(crate) level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManifestChange {
    Create { id: SSTableId, level: u32 },
    Delete { id: SSTableId },
    MoveDown { id: SSTableId, level: u32 },
}

const OP_CREATE: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_MOVE_DOWN: u8 = 3;

impl ManifestChange {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ManifestChange::Create { id, level } => {
                buf.put_u8(OP_CREATE);
                buf.put_u64((*id).into());
                buf.put_u32(*level);
            }
            ManifestChange::Delete { id } => {
                buf.put_u8(OP_DELETE);
                buf.put_u64((*id).into());
                buf.put_u32(0);
            }
            ManifestChange::MoveDown { id, level } => {
                buf.put_u8(OP_MOVE_DOWN);
                buf.put_u64((*id).into());
                buf.put_u32(*level);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> anyhow::Result<Self> {
        if buf.len() < 13 {
            bail!("manifest change record truncated");
        }
        let op = buf.get_u8();
        let id = SSTableId::from(buf.get_u64());
        let level = buf.get_u32();
        match op {
            OP_CREATE => Ok(ManifestChange::Create { id, level }),
            OP_DELETE => Ok(ManifestChange::Delete { id }),
            OP_MOVE_DOWN => Ok(ManifestChange::MoveDown { id, level }),
            _ => bail!("manifest has unknown change op {}", op),
        }
    }
}

fn encode_change_set(changes: &[ManifestChange]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + changes.len() * 13);
    payload.put_u32(changes.len() as u32);
    for change in changes {
        change.encode(&mut payload);
    }
    payload
}

fn decode_change_set(mut payload: &[u8]) -> anyhow::Result<Vec<ManifestChange>> {
    if payload.len() < 4 {
        bail!("manifest change set truncated");
    }
    let count = payload.get_u32() as usize;
    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        changes.push(ManifestChange::decode(&mut payload)?);
    }
    Ok(changes)
}

/// The append-only manifest file plus its replayed in-memory state.
/// `add_changes` serializes appenders internally; install order at the
/// levels is handled by the caller.
#[derive(Debug)]
pub(crate) struct ManifestFile {
    dir: PathBuf,
    read_only: bool,
    inner: Mutex<ManifestFileInner>,
}

#[derive(Debug)]
struct ManifestFileInner {
    file_handle: File,
    manifest: Manifest,
}

impl ManifestFile {
    pub(crate) fn open(dir: &Path, read_only: bool) -> anyhow::Result<ManifestFile> {
        let path = dir.join(MANIFEST_FILE_NAME);
        match OpenOptions::new().read(true).write(!read_only).open(&path) {
            Ok(mut file_handle) => {
                let (manifest, trunc_offset) = replay_manifest_file(&file_handle)?;
                if !read_only {
                    file_handle.set_len(trunc_offset)?;
                }
                file_handle.seek(SeekFrom::End(0))?;
                Ok(ManifestFile {
                    dir: dir.to_path_buf(),
                    read_only,
                    inner: Mutex::new(ManifestFileInner {
                        file_handle,
                        manifest,
                    }),
                })
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    if read_only {
                        bail!(err_file(
                            e,
                            &path,
                            "no manifest found, required for read-only open"
                        ));
                    }
                    let manifest = Manifest::default();
                    let file_handle = help_rewrite(dir, &manifest)?;
                    Ok(ManifestFile {
                        dir: dir.to_path_buf(),
                        read_only,
                        inner: Mutex::new(ManifestFileInner {
                            file_handle,
                            manifest,
                        }),
                    })
                }
                _ => bail!(e),
            },
        }
    }

    pub(crate) fn manifest_clone(&self) -> Manifest {
        self.inner.lock().manifest.clone()
    }

    /// Applies a change set to the in-memory state and makes it durable,
    /// either by appending one framed record or by rewriting the file
    /// once enough deletions have accumulated.
    pub(crate) fn add_changes(&self, changes: Vec<ManifestChange>) -> anyhow::Result<()> {
        if self.read_only {
            bail!(crate::errors::DBError::ReadOnly);
        }
        let mut inner = self.inner.lock();
        inner.manifest.apply_change_set(&changes)?;

        let net_creations = inner.manifest.creations - inner.manifest.deletions;
        if inner.manifest.deletions > MANIFEST_DELETIONS_REWRITE_THRESHOLD
            && inner.manifest.deletions > MANIFEST_DELETIONS_RATIO * net_creations
        {
            let manifest = inner.manifest.compacted();
            inner.file_handle = help_rewrite(&self.dir, &manifest)?;
            inner.manifest = manifest;
        } else {
            let payload = encode_change_set(&changes);
            let mut buf = Vec::with_capacity(8 + payload.len());
            buf.put_u32(payload.len() as u32);
            buf.put_u32(crc32fast::hash(&payload));
            buf.extend_from_slice(&payload);
            inner.file_handle.write_all(&buf)?;
            inner.file_handle.sync_all()?;
        }
        Ok(())
    }
}

fn help_rewrite(dir: &Path, manifest: &Manifest) -> anyhow::Result<File> {
    let rewrite_path = dir.join(MANIFEST_REWRITE_FILE_NAME);
    let mut fp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&rewrite_path)?;

    let mut buf = Vec::with_capacity(8);
    buf.put(&MAGIC_TEXT[..]);
    buf.put_u16(MAGIC_VERSION);
    buf.put_u16(0); // reserved

    let payload = encode_change_set(&manifest.as_changes());
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32fast::hash(&payload));
    buf.extend_from_slice(&payload);
    fp.write_all(&buf)?;
    fp.sync_all()?;
    drop(fp);

    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    rename(rewrite_path, &manifest_path)?;
    let mut fp = OpenOptions::new()
        .read(true)
        .write(true)
        .open(manifest_path)?;
    fp.seek(SeekFrom::End(0))?;
    sync_dir(dir)?;
    Ok(fp)
}

fn replay_manifest_file(fp: &File) -> anyhow::Result<(Manifest, u64)> {
    let mut reader = BufReader::new(fp);
    let mut magic_buf = [0; 8];
    let mut offset: u64 = 0;
    offset += reader
        .read(&mut magic_buf)
        .map_err(|e| anyhow!("manifest has bad magic: {}", e))? as u64;
    if magic_buf[..4] != MAGIC_TEXT[..] {
        bail!("manifest has bad magic");
    }
    let version = (&magic_buf[4..]).get_u16();
    if version != MAGIC_VERSION {
        bail!(
            "manifest has unsupported version: {} (we support {})",
            version,
            MAGIC_VERSION
        );
    }
    let fp_size = fp.metadata()?.len();

    let mut manifest = Manifest::default();
    loop {
        let mut read_size = 0;
        let mut len_crc_buf = [0; 8];
        match reader.read_exact(len_crc_buf.as_mut()) {
            Ok(_) => read_size += 8,
            Err(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => break,
                _ => bail!(e),
            },
        }
        let mut len_crc = len_crc_buf.as_ref();
        let payload_len = len_crc.get_u32() as usize;
        let crc = len_crc.get_u32();
        if offset + 8 + payload_len as u64 > fp_size {
            // Torn tail from a crash mid-append; replay stops here and
            // the file is truncated back to the last whole record.
            break;
        }

        let mut payload = vec![0u8; payload_len];
        match reader.read_exact(&mut payload) {
            Ok(_) => read_size += payload_len,
            Err(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => break,
                _ => bail!(e),
            },
        }
        if crc32fast::hash(&payload) != crc {
            bail!("manifest has checksum mismatch");
        }
        offset += read_size as u64;
        let changes = decode_change_set(&payload)?;
        manifest.apply_change_set(&changes)?;
    }
    Ok((manifest, offset))
}

impl Manifest {
    fn as_changes(&self) -> Vec<ManifestChange> {
        self.tables
            .iter()
            .map(|(id, tm)| ManifestChange::Create {
                id: *id,
                level: tm.level as u32,
            })
            .collect()
    }

    /// Same table map with the creation/deletion counters reset, used as
    /// the post-rewrite state.
    fn compacted(&self) -> Manifest {
        Manifest {
            levels: self.levels.clone(),
            tables: self.tables.clone(),
            creations: self.tables.len() as isize,
            deletions: 0,
        }
    }

    fn apply_change_set(&mut self, changes: &[ManifestChange]) -> anyhow::Result<()> {
        for change in changes {
            self.apply_manifest_change(change)?;
        }
        Ok(())
    }

    fn level_mut(&mut self, level: usize) -> &mut LevelManifest {
        while self.levels.len() <= level {
            self.levels.push(LevelManifest::default());
        }
        &mut self.levels[level]
    }

    fn apply_manifest_change(&mut self, change: &ManifestChange) -> anyhow::Result<()> {
        match *change {
            ManifestChange::Create { id, level } => {
                if self.tables.contains_key(&id) {
                    bail!("MANIFEST invalid, table {} exists", id);
                }
                self.tables.insert(
                    id,
                    TableManifest {
                        level: level as u8,
                    },
                );
                self.level_mut(level as usize).tables.insert(id);
                self.creations += 1;
            }
            ManifestChange::Delete { id } => {
                let Some(tm) = self.tables.remove(&id) else {
                    bail!("MANIFEST removes non-existing table {}", id);
                };
                self.levels[tm.level as usize].tables.remove(&id);
                self.deletions += 1;
            }
            ManifestChange::MoveDown { id, level } => {
                let Some(tm) = self.tables.get_mut(&id) else {
                    bail!("MANIFEST moves non-existing table {}", id);
                };
                let old_level = tm.level as usize;
                tm.level = level as u8;
                self.levels[old_level].tables.remove(&id);
                self.level_mut(level as usize).tables.insert(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_append_replay() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::open(dir.path(), false).unwrap();
        mf.add_changes(vec![
            ManifestChange::Create {
                id: 1.into(),
                level: 0,
            },
            ManifestChange::Create {
                id: 2.into(),
                level: 0,
            },
        ])
        .unwrap();
        mf.add_changes(vec![
            ManifestChange::Create {
                id: 3.into(),
                level: 1,
            },
            ManifestChange::Delete { id: 1.into() },
            ManifestChange::MoveDown {
                id: 2.into(),
                level: 1,
            },
        ])
        .unwrap();
        drop(mf);

        let reopened = ManifestFile::open(dir.path(), false).unwrap();
        let manifest = reopened.manifest_clone();
        assert_eq!(manifest.tables.len(), 2);
        assert!(!manifest.tables.contains_key(&SSTableId::from(1)));
        assert_eq!(manifest.tables[&SSTableId::from(2)].level, 1);
        assert_eq!(manifest.tables[&SSTableId::from(3)].level, 1);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::open(dir.path(), false).unwrap();
        mf.add_changes(vec![ManifestChange::Create {
            id: 9.into(),
            level: 2,
        }])
        .unwrap();
        drop(mf);

        // Simulate a crash mid-append: garbage frame header at the tail.
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let mut fp = OpenOptions::new().append(true).open(&path).unwrap();
        fp.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        drop(fp);

        let reopened = ManifestFile::open(dir.path(), false).unwrap();
        let manifest = reopened.manifest_clone();
        assert_eq!(manifest.tables.len(), 1);
        assert_eq!(manifest.tables[&SSTableId::from(9)].level, 2);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = tempdir().unwrap();
        let mf = ManifestFile::open(dir.path(), false).unwrap();
        mf.add_changes(vec![ManifestChange::Create {
            id: 5.into(),
            level: 0,
        }])
        .unwrap();
        let err = mf
            .add_changes(vec![ManifestChange::Create {
                id: 5.into(),
                level: 0,
            }])
            .unwrap_err();
        assert!(err.to_string().contains("exists"));
    }
}
