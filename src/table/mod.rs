pub mod builder;
pub mod iter;
pub mod merge;

use std::fs::{remove_file, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use integer_encoding::VarInt;
use log::error;

use crate::bloom::Bloom;
use crate::errors::DBError;
use crate::iter::SinkIterator;
use crate::kv::{KeyTsBorrow, TxnTs, ValueStruct};
use crate::util::SSTableId;

use self::iter::TableIter;

pub(crate) const TABLE_MAGIC: u64 = 0x544d_4252_5353_5431; // "TMBRSST1"
pub(crate) const FOOTER_SIZE: usize = 4 * 5 + 8;

/// An immutable sorted run. The whole file is read into memory at open,
/// so point reads never fail in steady state. Reference counted: the
/// owning level holds one ref, transient readers take their own, and the
/// backing file is unlinked when the count reaches zero.
#[derive(Debug, Clone)]
pub struct Table(pub(crate) Arc<TableInner>);

#[derive(Debug)]
pub(crate) struct TableInner {
    id: SSTableId,
    path: PathBuf,
    data: Bytes,
    entry_offsets: Vec<u32>,
    bloom: Bloom,
    smallest: Vec<u8>,
    biggest: Vec<u8>,
    max_version: TxnTs,
    entries_end: usize,
    size_on_disk: usize,
    ref_count: AtomicI32,
    keep_file_on_zero: AtomicBool,
}

impl Table {
    pub fn open(id: SSTableId, path: &Path) -> anyhow::Result<Table> {
        let mut fd = File::open(path).map_err(DBError::Io)?;
        let mut data = Vec::new();
        fd.read_to_end(&mut data).map_err(DBError::Io)?;
        drop(fd);
        Self::parse(id, path.to_path_buf(), data.into())
    }

    fn parse(id: SSTableId, path: PathBuf, data: Bytes) -> anyhow::Result<Table> {
        if data.len() < FOOTER_SIZE {
            bail!(DBError::Corruption(format!(
                "table {} too short: {} bytes",
                id,
                data.len()
            )));
        }
        let mut footer = &data[data.len() - FOOTER_SIZE..];
        let num_entries = footer.get_u32() as usize;
        let index_offset = footer.get_u32() as usize;
        let bloom_offset = footer.get_u32() as usize;
        let bloom_len = footer.get_u32() as usize;
        let checksum = footer.get_u32();
        let magic = footer.get_u64();
        if magic != TABLE_MAGIC {
            bail!(DBError::Corruption(format!("table {} has bad magic", id)));
        }
        let body_len = data.len() - FOOTER_SIZE;
        if bloom_offset + bloom_len != body_len
            || index_offset + num_entries * 4 != bloom_offset
            || num_entries == 0
        {
            bail!(DBError::Corruption(format!(
                "table {} has inconsistent footer",
                id
            )));
        }
        if crc32fast::hash(&data[..body_len]) != checksum {
            bail!(DBError::Corruption(format!(
                "table {} failed checksum verification",
                id
            )));
        }

        let mut entry_offsets = Vec::with_capacity(num_entries);
        let mut index = &data[index_offset..bloom_offset];
        for _ in 0..num_entries {
            entry_offsets.push(index.get_u32());
        }
        let bloom = Bloom::deserialize(&data[bloom_offset..bloom_offset + bloom_len]);

        let size_on_disk = data.len();
        let mut inner = TableInner {
            id,
            path,
            data,
            entry_offsets,
            bloom,
            smallest: Vec::new(),
            biggest: Vec::new(),
            max_version: TxnTs::default(),
            entries_end: index_offset,
            size_on_disk,
            ref_count: AtomicI32::new(1),
            keep_file_on_zero: AtomicBool::new(false),
        };
        inner.smallest = inner.entry_key(0).to_vec();
        inner.biggest = inner.entry_key(num_entries - 1).to_vec();
        inner.max_version = (0..num_entries)
            .map(|i| KeyTsBorrow(inner.entry_key(i)).txn_ts())
            .max()
            .unwrap_or_default();
        Ok(Table(Arc::new(inner)))
    }

    pub fn id(&self) -> SSTableId {
        self.0.id
    }

    pub fn size(&self) -> usize {
        self.0.size_on_disk
    }

    pub fn smallest(&self) -> &[u8] {
        &self.0.smallest
    }

    pub fn biggest(&self) -> &[u8] {
        &self.0.biggest
    }

    pub fn max_version(&self) -> TxnTs {
        self.0.max_version
    }

    pub fn num_entries(&self) -> usize {
        self.0.entry_offsets.len()
    }

    pub fn incr_ref(&self) {
        self.0.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one reference. The backing file is removed when the last
    /// reference goes away, unless [`Table::close`] ran first.
    pub fn decr_ref(&self) -> anyhow::Result<()> {
        let prev = self.0.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "table {} ref underflow", self.0.id);
        if prev == 1 && !self.0.keep_file_on_zero.load(Ordering::Acquire) {
            remove_file(&self.0.path)
                .map_err(|e| anyhow!("while removing table {:?}: {}", self.0.path, e))?;
        }
        Ok(())
    }

    /// Releases the caller's reference while keeping the file on disk,
    /// used at engine shutdown.
    pub fn close(&self) {
        self.0.keep_file_on_zero.store(true, Ordering::Release);
        let prev = self.0.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "table {} ref underflow", self.0.id);
    }

    /// Bloom-backed negative lookup: true means the user key is
    /// definitely absent.
    pub fn does_not_have(&self, user_key: &[u8]) -> bool {
        self.does_not_have_hash(Bloom::hash(user_key))
    }

    pub(crate) fn does_not_have_hash(&self, user_key_hash: u32) -> bool {
        !self.0.bloom.may_contain(user_key_hash)
    }

    /// Newest version at or below the timestamp baked into `key`. Returns
    /// the default (empty) struct when the user key is not present.
    pub fn point_get(&self, key: &[u8]) -> anyhow::Result<ValueStruct> {
        let mut iter = self.new_iterator(false);
        if !iter.seek(key)? {
            return Ok(ValueStruct::default());
        }
        let found = iter.key().expect("seek reported valid");
        if found.key() != KeyTsBorrow(key).key() {
            return Ok(ValueStruct::default());
        }
        let version = found.txn_ts();
        let mut value = iter.value().expect("seek reported valid");
        value.set_version(version);
        Ok(value)
    }

    pub fn new_iterator(&self, reverse: bool) -> TableIter {
        TableIter::new(self.clone(), reverse)
    }

    /// Rough byte count of entries whose keys fall in `[start, end]`.
    pub fn approximate_size_in_range(&self, start: &[u8], end: &[u8]) -> usize {
        let inner = &self.0;
        let entry_pos = |index: usize| -> usize {
            inner
                .entry_offsets
                .get(index)
                .map(|o| *o as usize)
                .unwrap_or(inner.entries_end)
        };
        let lo = entry_pos(self.seek_entry_index(start));
        let hi = entry_pos(self.seek_entry_index(end));
        hi.saturating_sub(lo)
    }

    /// Index of the first entry with key `>= target`, `num_entries` when
    /// every key is smaller.
    pub(crate) fn seek_entry_index(&self, target: &[u8]) -> usize {
        binary_search_keys(&self.0, target)
    }

    pub(crate) fn entry(&self, index: usize) -> (KeyTsBorrow<'_>, ValueStruct) {
        let inner = &self.0;
        let (key, value_slice) = inner.entry_parts(index);
        (KeyTsBorrow(key), ValueStruct::deserialize(value_slice))
    }

    pub(crate) fn entry_key(&self, index: usize) -> KeyTsBorrow<'_> {
        KeyTsBorrow(self.0.entry_key(index))
    }
}

fn binary_search_keys(inner: &TableInner, target: &[u8]) -> usize {
    let mut left = 0;
    let mut right = inner.entry_offsets.len();
    while left < right {
        let mid = (left + right) / 2;
        if KeyTsBorrow::cmp_bytes(inner.entry_key(mid), target).is_lt() {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

impl TableInner {
    fn entry_parts(&self, index: usize) -> (&[u8], &[u8]) {
        let offset = self.entry_offsets[index] as usize;
        let data = &self.data[offset..];
        let (key_len, read_k) = u32::decode_var(data).expect("corrupt entry header");
        let (value_len, read_v) = u32::decode_var(&data[read_k..]).expect("corrupt entry header");
        let key_start = read_k + read_v;
        let value_start = key_start + key_len as usize;
        (
            &data[key_start..value_start],
            &data[value_start..value_start + value_len as usize],
        )
    }

    fn entry_key(&self, index: usize) -> &[u8] {
        self.entry_parts(index).0
    }
}

impl Drop for TableInner {
    fn drop(&mut self) {
        let count = self.ref_count.load(Ordering::Acquire);
        if count > 0 {
            error!("table {} dropped with {} live refs", self.id, count);
        }
    }
}
