use bytes::Bytes;

/// Block-style bloom filter over user-key hashes. The builder collects
/// `Bloom::hash` values while entries stream in and bakes the filter once
/// at finish; readers probe it through [`Bloom::may_contain`].
#[derive(Debug, Clone)]
pub(crate) struct Bloom {
    filter: Bytes,
    num_probes: u8,
}

impl Bloom {
    /// 32-bit hash of a user key, same family leveldb uses for its filter
    /// blocks.
    pub(crate) fn hash(key: &[u8]) -> u32 {
        const SEED: u32 = 0xbc9f_1d34;
        const M: u32 = 0xc6a4_a793;
        let mut h = SEED ^ (key.len() as u32).wrapping_mul(M);
        let mut chunks = key.chunks_exact(4);
        for chunk in &mut chunks {
            let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            h = h.wrapping_add(w);
            h = h.wrapping_mul(M);
            h ^= h >> 16;
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            let mut w: u32 = 0;
            for (i, b) in rest.iter().enumerate() {
                w |= (*b as u32) << (8 * i);
            }
            h = h.wrapping_add(w);
            h = h.wrapping_mul(M);
            h ^= h >> 24;
        }
        h
    }

    fn bits_per_key(num_entries: usize, false_positive: f64) -> usize {
        let size = -(num_entries as f64) * false_positive.ln() / (2f64.ln() * 2f64.ln());
        (size / num_entries.max(1) as f64).ceil() as usize
    }

    pub(crate) fn build(hashes: &[u32], false_positive: f64) -> Self {
        let bits_per_key = Self::bits_per_key(hashes.len(), false_positive);
        let num_probes = ((bits_per_key as f64 * 0.69) as u8).clamp(1, 30);
        let nbits = (hashes.len() * bits_per_key).max(64);
        let nbytes = (nbits + 7) / 8;
        let mut filter = vec![0u8; nbytes];
        for &h in hashes {
            let mut h = h;
            let delta = h.rotate_left(15);
            for _ in 0..num_probes {
                let pos = (h as usize) % (nbytes * 8);
                filter[pos / 8] |= 1 << (pos % 8);
                h = h.wrapping_add(delta);
            }
        }
        Self {
            filter: filter.into(),
            num_probes,
        }
    }

    pub(crate) fn may_contain(&self, hash: u32) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        let nbits = self.filter.len() * 8;
        let mut h = hash;
        let delta = h.rotate_left(15);
        for _ in 0..self.num_probes {
            let pos = (h as usize) % nbits;
            if self.filter[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.filter.len() + 1);
        out.extend_from_slice(&self.filter);
        out.push(self.num_probes);
        out
    }

    pub(crate) fn deserialize(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self {
                filter: Bytes::new(),
                num_probes: 0,
            };
        }
        Self {
            filter: Bytes::copy_from_slice(&data[..data.len() - 1]),
            num_probes: data[data.len() - 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_keys_always_hit() {
        let keys: Vec<Vec<u8>> = (0..500u32).map(|i| format!("key-{i}").into_bytes()).collect();
        let hashes: Vec<u32> = keys.iter().map(|k| Bloom::hash(k)).collect();
        let bloom = Bloom::build(&hashes, 0.01);
        for k in &keys {
            assert!(bloom.may_contain(Bloom::hash(k)));
        }
    }

    #[test]
    fn absent_keys_mostly_miss() {
        let hashes: Vec<u32> = (0..500u32)
            .map(|i| Bloom::hash(format!("key-{i}").as_bytes()))
            .collect();
        let bloom = Bloom::build(&hashes, 0.01);
        let false_hits = (0..500u32)
            .filter(|i| bloom.may_contain(Bloom::hash(format!("other-{i}").as_bytes())))
            .count();
        assert!(false_hits < 50, "false positive rate too high: {false_hits}/500");
    }

    #[test]
    fn roundtrip() {
        let hashes = [Bloom::hash(b"a"), Bloom::hash(b"b")];
        let bloom = Bloom::build(&hashes, 0.01);
        let restored = Bloom::deserialize(&bloom.serialize());
        assert!(restored.may_contain(Bloom::hash(b"a")));
        assert!(restored.may_contain(Bloom::hash(b"b")));
    }
}
