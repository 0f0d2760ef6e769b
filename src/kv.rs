use std::cmp::Ordering;
use std::ops::Deref;

use bytes::{Buf, BufMut, Bytes};
use integer_encoding::VarInt;

/// Commit timestamp of a record version. Larger is newer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnTs(u64);

impl TxnTs {
    pub const MAX: TxnTs = TxnTs(u64::MAX);

    #[inline]
    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TxnTs {
    fn from(value: u64) -> Self {
        TxnTs(value)
    }
}

impl std::fmt::Display for TxnTs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) const TS_SUFFIX_LEN: usize = 8;

// The timestamp is stored inverted (big-endian of !ts) so that within one
// user key the newest version has the smallest suffix bytes.
#[inline]
fn encode_ts(ts: TxnTs) -> [u8; TS_SUFFIX_LEN] {
    (!ts.0).to_be_bytes()
}

#[inline]
fn decode_ts(suffix: &[u8]) -> TxnTs {
    debug_assert_eq!(suffix.len(), TS_SUFFIX_LEN);
    let mut buf = [0u8; TS_SUFFIX_LEN];
    buf.copy_from_slice(suffix);
    TxnTs(!u64::from_be_bytes(buf))
}

/// An owned key: user key plus commit timestamp.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyTs {
    key: Bytes,
    txn_ts: TxnTs,
}

impl KeyTs {
    pub fn new(key: impl Into<Bytes>, txn_ts: TxnTs) -> Self {
        Self {
            key: key.into(),
            txn_ts,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn txn_ts(&self) -> TxnTs {
        self.txn_ts
    }

    /// The on-disk form: user key followed by the inverted timestamp, so
    /// plain byte order sorts user keys ascending and versions newest
    /// first.
    pub fn serialize(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.key.len() + TS_SUFFIX_LEN);
        v.extend_from_slice(&self.key);
        v.extend_from_slice(&encode_ts(self.txn_ts));
        v
    }

    pub fn len(&self) -> usize {
        self.key.len() + TS_SUFFIX_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl From<&[u8]> for KeyTs {
    fn from(serialized: &[u8]) -> Self {
        let borrow = KeyTsBorrow(serialized);
        Self {
            key: Bytes::copy_from_slice(borrow.key()),
            txn_ts: borrow.txn_ts(),
        }
    }
}

impl PartialOrd for KeyTs {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyTs {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(other.txn_ts.cmp(&self.txn_ts))
    }
}

/// A serialized key borrowed from a table block or an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTsBorrow<'a>(pub(crate) &'a [u8]);

impl<'a> KeyTsBorrow<'a> {
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.0.len() >= TS_SUFFIX_LEN);
        &self.0[..self.0.len() - TS_SUFFIX_LEN]
    }

    pub fn txn_ts(&self) -> TxnTs {
        decode_ts(&self.0[self.0.len() - TS_SUFFIX_LEN..])
    }

    pub(crate) fn cmp_bytes(left: &[u8], right: &[u8]) -> Ordering {
        KeyTsBorrow(left).cmp(&KeyTsBorrow(right))
    }
}

impl<'a> From<&'a [u8]> for KeyTsBorrow<'a> {
    fn from(value: &'a [u8]) -> Self {
        KeyTsBorrow(value)
    }
}

impl<'a> Deref for KeyTsBorrow<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<'a> PartialOrd for KeyTsBorrow<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> Ord for KeyTsBorrow<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        // User key ascending, then suffix bytes ascending, which is
        // timestamp descending because the suffix stores !ts.
        let split_l = self.0.len() - TS_SUFFIX_LEN;
        let split_r = other.0.len() - TS_SUFFIX_LEN;
        self.0[..split_l]
            .cmp(&other.0[..split_r])
            .then_with(|| self.0[split_l..].cmp(&other.0[split_r..]))
    }
}

bitflags::bitflags! {
    /// Record meta bits persisted with every value.
    #[derive(Default)]
    pub struct Meta: u8 {
        const DELETE = 1 << 0;
        const VALUE_POINTER = 1 << 1;
    }
}

/// A stored value plus its meta, as returned by reads. `version` is the
/// commit timestamp of the key that matched; an all-default struct means
/// "not found".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValueStruct {
    meta: Meta,
    user_meta: u8,
    expires_at: u64,
    value: Bytes,
    version: TxnTs,
}

impl ValueStruct {
    pub fn new(meta: Meta, user_meta: u8, expires_at: u64, value: impl Into<Bytes>) -> Self {
        Self {
            meta,
            user_meta,
            expires_at,
            value: value.into(),
            version: TxnTs::default(),
        }
    }

    pub fn meta(&self) -> Meta {
        self.meta
    }

    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version(&self) -> TxnTs {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: TxnTs) {
        self.version = version;
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.contains(Meta::DELETE)
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.value.is_empty() && self.version == TxnTs::default()
    }

    pub(crate) fn serialized_size(&self) -> usize {
        2 + self.expires_at.required_space() + self.value.len()
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.put_u8(self.meta.bits());
        out.put_u8(self.user_meta);
        out.extend_from_slice(&self.expires_at.encode_var_vec());
        out.extend_from_slice(&self.value);
        out
    }

    pub(crate) fn deserialize(data: &[u8]) -> Self {
        let meta = Meta::from_bits_truncate(data[0]);
        let user_meta = data[1];
        let (expires_at, read) = u64::decode_var(&data[2..]).unwrap_or((0, 0));
        Self {
            meta,
            user_meta,
            expires_at,
            value: Bytes::copy_from_slice(&data[2 + read..]),
            version: TxnTs::default(),
        }
    }
}

/// Location of a value that lives in the value log instead of the table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValuePointer {
    file_id: u32,
    len: u32,
    offset: u64,
}

pub(crate) const VALUE_POINTER_SIZE: usize = 16;

impl ValuePointer {
    pub(crate) fn new(file_id: u32, len: u32, offset: u64) -> Self {
        Self {
            file_id,
            len,
            offset,
        }
    }

    pub(crate) fn file_id(&self) -> u32 {
        self.file_id
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VALUE_POINTER_SIZE);
        out.put_u32(self.file_id);
        out.put_u32(self.len);
        out.put_u64(self.offset);
        out
    }

    pub(crate) fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < VALUE_POINTER_SIZE {
            return None;
        }
        Some(Self {
            file_id: data.get_u32(),
            len: data.get_u32(),
            offset: data.get_u64(),
        })
    }
}

/// One slot of a batched read. `found` is flipped by the first level that
/// resolves the key so deeper levels skip it.
#[derive(Debug)]
pub struct KvPair {
    key: KeyTs,
    value: ValueStruct,
    found: bool,
}

impl KvPair {
    pub fn new(key: KeyTs) -> Self {
        Self {
            key,
            value: ValueStruct::default(),
            found: false,
        }
    }

    pub fn key(&self) -> &KeyTs {
        &self.key
    }

    pub fn value(&self) -> &ValueStruct {
        &self.value
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub(crate) fn resolve(&mut self, value: ValueStruct) {
        self.value = value;
        self.found = true;
    }
}
