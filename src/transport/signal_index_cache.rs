use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::transport::constants::OperationalEncoding;
use crate::util::buf::{put_guid, put_string, try_get_guid, try_get_string};

/// The bijection between a connection's compact runtime indices and 128-bit
///  signal IDs, plus the optional human-readable measurement key (source
///  string and numeric id) per signal.
///
/// A publisher builds a fresh cache on every subscribe; a subscriber replaces
///  its active slot atomically when an update arrives. Instances are never
///  mutated after publication.
#[derive(Debug, Clone, Default)]
pub struct SignalIndexCache {
    reference: FxHashMap<u32, usize>,
    signal_ids: Vec<Uuid>,
    sources: Vec<String>,
    ids: Vec<u64>,
    signal_id_lookup: FxHashMap<Uuid, u32>,
}

impl SignalIndexCache {
    pub fn new() -> SignalIndexCache {
        Default::default()
    }

    pub fn add_record(&mut self, signal_index: u32, signal_id: Uuid, source: &str, id: u64) {
        let position = self.signal_ids.len();
        self.reference.insert(signal_index, position);
        self.signal_ids.push(signal_id);
        self.sources.push(source.to_string());
        self.ids.push(id);
        self.signal_id_lookup.insert(signal_id, signal_index);
    }

    pub fn contains(&self, signal_index: u32) -> bool {
        self.reference.contains_key(&signal_index)
    }

    pub fn signal_id(&self, signal_index: u32) -> Option<Uuid> {
        self.reference.get(&signal_index).map(|&pos| self.signal_ids[pos])
    }

    pub fn signal_index(&self, signal_id: Uuid) -> Option<u32> {
        self.signal_id_lookup.get(&signal_id).copied()
    }

    pub fn source(&self, signal_index: u32) -> Option<&str> {
        self.reference.get(&signal_index).map(|&pos| self.sources[pos].as_str())
    }

    pub fn id(&self, signal_index: u32) -> Option<u64> {
        self.reference.get(&signal_index).map(|&pos| self.ids[pos])
    }

    pub fn signal_ids(&self) -> FxHashSet<Uuid> {
        self.signal_ids.iter().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.signal_id_lookup.len()
    }

    pub fn max_signal_index(&self) -> u32 {
        self.reference.keys().copied().max().map(|max| max + 1).unwrap_or(0)
    }

    /// Serializes the cache for an `UpdateSignalIndexCache` response:
    ///  `[u32 binaryLength][u32 referenceCount]` followed per record by
    ///  `[u32 sourceIndex][u16 runtimeIndex][signalID][u32 sourceLen][source][u64 id]`.
    pub fn ser(&self, buf: &mut BytesMut, encoding: OperationalEncoding) {
        let mut body = BytesMut::new();
        body.put_u32(self.reference.len() as u32);

        // iterate in runtime index order so the encoding is deterministic
        let mut indices: Vec<u32> = self.reference.keys().copied().collect();
        indices.sort_unstable();

        for (source_index, signal_index) in indices.into_iter().enumerate() {
            let pos = self.reference[&signal_index];
            body.put_u32(source_index as u32);
            body.put_u16(signal_index as u16);
            put_guid(&mut body, self.signal_ids[pos]);
            put_string(&mut body, &self.sources[pos], encoding);
            body.put_u64(self.ids[pos]);
        }

        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
    }

    pub fn try_deser(mut buf: impl Buf, encoding: OperationalEncoding) -> anyhow::Result<SignalIndexCache> {
        let binary_length = buf.try_get_u32()? as usize;
        if buf.remaining() < binary_length {
            bail!("signal index cache truncated: {} bytes announced, {} available", binary_length, buf.remaining());
        }

        let reference_count = buf.try_get_u32()?;
        let mut cache = SignalIndexCache::new();

        for _ in 0..reference_count {
            let _source_index = buf.try_get_u32()?;
            let signal_index = buf.try_get_u16()? as u32;
            let signal_id = try_get_guid(&mut buf)?;
            let source = try_get_string(&mut buf, encoding)?;
            let id = buf.try_get_u64()?;
            cache.add_record(signal_index, signal_id, &source, id);
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn sample_cache() -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add_record(0, Uuid::parse_str("8f4c3e07-3b4b-4c63-8f4e-60d4b1f9c1a0").unwrap(), "PPA:1", 1);
        cache.add_record(1, Uuid::parse_str("35a0d6d8-1dbd-4b15-badc-6b8f1d23109a").unwrap(), "PPA:2", 2);
        cache.add_record(2, Uuid::parse_str("05b9b876-9b27-4f4d-9a63-4c0c1f2cb1d6").unwrap(), "", 3);
        cache
    }

    #[test]
    fn test_bijection() {
        let cache = sample_cache();
        assert_eq!(cache.count(), 3);
        assert_eq!(cache.max_signal_index(), 3);

        for index in 0..3 {
            let signal_id = cache.signal_id(index).unwrap();
            assert_eq!(cache.signal_index(signal_id), Some(index));
        }
        assert_eq!(cache.signal_id(3), None);
        assert_eq!(cache.signal_index(Uuid::new_v4()), None);
    }

    #[test]
    fn test_record_lookup() {
        let cache = sample_cache();
        assert_eq!(cache.source(0), Some("PPA:1"));
        assert_eq!(cache.id(1), Some(2));
        assert!(cache.contains(2));
        assert!(!cache.contains(17));
    }

    #[rstest]
    #[case::utf8(OperationalEncoding::Utf8)]
    #[case::utf16(OperationalEncoding::Utf16Le)]
    fn test_ser_round_trip(#[case] encoding: OperationalEncoding) {
        let cache = sample_cache();
        let mut buf = BytesMut::new();
        cache.ser(&mut buf, encoding);

        let decoded = SignalIndexCache::try_deser(buf.freeze(), encoding).unwrap();
        assert_eq!(decoded.count(), cache.count());
        for index in 0..3 {
            assert_eq!(decoded.signal_id(index), cache.signal_id(index));
            assert_eq!(decoded.source(index), cache.source(index));
            assert_eq!(decoded.id(index), cache.id(index));
        }
    }

    #[test]
    fn test_ser_is_deterministic() {
        let cache = sample_cache();
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        cache.ser(&mut a, OperationalEncoding::Utf8);
        cache.ser(&mut b, OperationalEncoding::Utf8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_deser_truncated() {
        let cache = sample_cache();
        let mut buf = BytesMut::new();
        cache.ser(&mut buf, OperationalEncoding::Utf8);
        let truncated = &buf[..buf.len() - 4];
        assert!(SignalIndexCache::try_deser(truncated, OperationalEncoding::Utf8).is_err());
    }

    #[test]
    fn test_empty_cache_round_trip() {
        let cache = SignalIndexCache::new();
        let mut buf = BytesMut::new();
        cache.ser(&mut buf, OperationalEncoding::Utf8);
        let decoded = SignalIndexCache::try_deser(buf.freeze(), OperationalEncoding::Utf8).unwrap();
        assert_eq!(decoded.count(), 0);
        assert_eq!(decoded.max_signal_index(), 0);
    }
}
