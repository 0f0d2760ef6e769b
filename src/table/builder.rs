use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use bytes::BufMut;
use integer_encoding::VarInt;

use crate::bloom::Bloom;
use crate::errors::DBError;
use crate::kv::{KeyTsBorrow, TxnTs, ValueStruct};
use crate::table::{FOOTER_SIZE, TABLE_MAGIC};
use crate::util::rate_limiter::RateLimiter;

/// Streams key-ordered entries into an on-disk table. Callers must push
/// keys in strictly increasing order and cut over to a fresh builder when
/// [`TableBuilder::reached_capacity`] fires.
#[derive(Debug)]
pub struct TableBuilder {
    buf: Vec<u8>,
    entry_offsets: Vec<u32>,
    key_hashes: Vec<u32>,
    last_key: Vec<u8>,
    max_version: TxnTs,
    max_table_size: usize,
    bloom_false_positive: f64,
}

impl TableBuilder {
    pub fn new(max_table_size: usize, bloom_false_positive: f64) -> Self {
        Self {
            buf: Vec::with_capacity(max_table_size.min(16 << 20)),
            entry_offsets: Vec::new(),
            key_hashes: Vec::new(),
            last_key: Vec::new(),
            max_version: TxnTs::default(),
            max_table_size,
            bloom_false_positive,
        }
    }

    pub fn push(&mut self, key: KeyTsBorrow<'_>, value: &ValueStruct) {
        debug_assert!(
            self.last_key.is_empty() || KeyTsBorrow::cmp_bytes(&self.last_key, &key).is_lt(),
            "keys must arrive in strictly increasing order"
        );
        self.entry_offsets.push(self.buf.len() as u32);
        self.buf
            .extend_from_slice(&(key.len() as u32).encode_var_vec());
        let value_buf = value.serialize();
        self.buf
            .extend_from_slice(&(value_buf.len() as u32).encode_var_vec());
        self.buf.extend_from_slice(&key);
        self.buf.extend_from_slice(&value_buf);

        self.key_hashes.push(Bloom::hash(key.key()));
        self.max_version = self.max_version.max(key.txn_ts());
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);
    }

    pub fn is_empty(&self) -> bool {
        self.entry_offsets.is_empty()
    }

    /// Highest commit timestamp pushed so far.
    pub fn max_version(&self) -> TxnTs {
        self.max_version
    }

    pub fn reached_capacity(&self) -> bool {
        let estimate = self.buf.len() + self.entry_offsets.len() * 4 + FOOTER_SIZE;
        estimate >= self.max_table_size
    }

    /// Assembles index, bloom and footer, then writes the table to `path`
    /// with create-new semantics and an fsync. Paced by `limiter`.
    pub async fn finish(mut self, path: &Path, limiter: &RateLimiter) -> anyhow::Result<()> {
        debug_assert!(!self.is_empty(), "finishing an empty builder");
        let index_offset = self.buf.len();
        for offset in &self.entry_offsets {
            self.buf.put_u32(*offset);
        }
        let bloom_offset = self.buf.len();
        let bloom = Bloom::build(&self.key_hashes, self.bloom_false_positive);
        self.buf.extend_from_slice(&bloom.serialize());
        let bloom_len = self.buf.len() - bloom_offset;

        let checksum = crc32fast::hash(&self.buf);
        self.buf.put_u32(self.entry_offsets.len() as u32);
        self.buf.put_u32(index_offset as u32);
        self.buf.put_u32(bloom_offset as u32);
        self.buf.put_u32(bloom_len as u32);
        self.buf.put_u32(checksum);
        self.buf.put_u64(TABLE_MAGIC);

        limiter.acquire(self.buf.len()).await;

        let mut fd = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(DBError::Io)?;
        fd.write_all(&self.buf).map_err(DBError::Io)?;
        fd.sync_all().map_err(DBError::Io)?;
        Ok(())
    }
}
