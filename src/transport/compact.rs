use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::ticks::Ticks;
use crate::transport::measurement::{Measurement, StateFlags};
use crate::transport::signal_index_cache::SignalIndexCache;

/// Flags in the leading byte of a compact measurement record.
mod compact_flags {
    pub const DATA_RANGE: u8 = 0x01;
    pub const DATA_QUALITY: u8 = 0x02;
    pub const TIME_QUALITY: u8 = 0x04;
    pub const SYSTEM_ISSUE: u8 = 0x08;
    pub const CALCULATED_VALUE: u8 = 0x10;
    pub const DISCARDED_VALUE: u8 = 0x20;
    /// selects base timestamp 1 (bit clear: base timestamp 0)
    pub const TIME_INDEX: u8 = 0x80;
}

const DATA_RANGE_MASK: u32 = 0x0000_00FC;
const DATA_QUALITY_MASK: u32 = 0x0000_EF03;
const TIME_QUALITY_MASK: u32 = 0x00BF_0000;
const SYSTEM_ISSUE_MASK: u32 = 0xE000_0000;
const CALCULATED_VALUE_MASK: u32 = 0x0000_1000;
const DISCARDED_VALUE_MASK: u32 = 0x0040_0000;

/// A 16-bit time offset of all ones is the sentinel for "full 8-byte
///  timestamp follows"; the largest offset a record can carry is one less.
pub const TIME_OFFSET_SENTINEL: u16 = u16::MAX;
pub const MAX_TIME_OFFSET: u64 = (u16::MAX - 1) as u64;

fn map_to_compact(flags: StateFlags) -> u8 {
    let mut compact = 0u8;
    if flags.0 & DATA_RANGE_MASK != 0 {
        compact |= compact_flags::DATA_RANGE;
    }
    if flags.0 & DATA_QUALITY_MASK != 0 {
        compact |= compact_flags::DATA_QUALITY;
    }
    if flags.0 & TIME_QUALITY_MASK != 0 {
        compact |= compact_flags::TIME_QUALITY;
    }
    if flags.0 & SYSTEM_ISSUE_MASK != 0 {
        compact |= compact_flags::SYSTEM_ISSUE;
    }
    if flags.0 & CALCULATED_VALUE_MASK != 0 {
        compact |= compact_flags::CALCULATED_VALUE;
    }
    if flags.0 & DISCARDED_VALUE_MASK != 0 {
        compact |= compact_flags::DISCARDED_VALUE;
    }
    compact
}

fn map_to_full(compact: u8) -> StateFlags {
    let mut flags = 0u32;
    if compact & compact_flags::DATA_RANGE != 0 {
        flags |= DATA_RANGE_MASK;
    }
    if compact & compact_flags::DATA_QUALITY != 0 {
        flags |= DATA_QUALITY_MASK;
    }
    if compact & compact_flags::TIME_QUALITY != 0 {
        flags |= TIME_QUALITY_MASK;
    }
    if compact & compact_flags::SYSTEM_ISSUE != 0 {
        flags |= SYSTEM_ISSUE_MASK;
    }
    if compact & compact_flags::CALCULATED_VALUE != 0 {
        flags |= CALCULATED_VALUE_MASK;
    }
    if compact & compact_flags::DISCARDED_VALUE != 0 {
        flags |= DISCARDED_VALUE_MASK;
    }
    StateFlags(flags)
}

/// The pair of base timestamps shared by all compact records of a stream,
///  refreshed out of band via `UpdateBaseTimes`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BaseTimes {
    pub active_index: usize,
    pub offsets: [u64; 2],
}

impl BaseTimes {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.active_index as u64);
        buf.put_u64(self.offsets[0]);
        buf.put_u64(self.offsets[1]);
    }

    pub fn try_deser(mut buf: impl Buf) -> anyhow::Result<BaseTimes> {
        let active_index = buf.try_get_u64()?;
        if active_index > 1 {
            bail!("invalid base time index {}", active_index);
        }
        Ok(BaseTimes {
            active_index: active_index as usize,
            offsets: [buf.try_get_u64()?, buf.try_get_u64()?],
        })
    }
}

/// Serializer / deserializer for the compact per-measurement record. The
///  layout switches negotiated at subscribe time are fixed for the life of
///  the subscription:
///
///  `[1 byte flags][2 bytes runtime index][4/8 bytes value][2 bytes time
///   offset, sentinel + 8 bytes full tick when out of window]`
///
///  The time section is omitted entirely when `include_time` is off.
#[derive(Debug, Clone, Copy)]
pub struct CompactCodec {
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub use_double_precision: bool,
}

impl CompactCodec {
    fn offset_unit(&self) -> u64 {
        if self.use_millisecond_resolution {
            Ticks::PER_MILLISECOND
        }
        else {
            1
        }
    }

    /// Appends one measurement. The caller guarantees the signal is in the
    ///  cache; a miss here means the routing table and cache went out of sync.
    pub fn encode(
        &self,
        buf: &mut BytesMut,
        measurement: &Measurement,
        cache: &SignalIndexCache,
        base_times: &BaseTimes,
    ) -> anyhow::Result<()> {
        let Some(runtime_index) = cache.signal_index(measurement.signal_id) else {
            bail!("signal {} is not in the active signal index cache", measurement.signal_id);
        };
        if runtime_index > u16::MAX as u32 {
            bail!("runtime index {} exceeds the compact wire range", runtime_index);
        }

        let time_index = base_times.active_index;
        let mut flags = map_to_compact(measurement.flags);
        if time_index == 1 {
            flags |= compact_flags::TIME_INDEX;
        }

        buf.put_u8(flags);
        buf.put_u16(runtime_index as u16);

        if self.use_double_precision {
            buf.put_f64(measurement.value);
        }
        else {
            buf.put_f32(measurement.value as f32);
        }

        if !self.include_time {
            return Ok(());
        }

        match self.time_offset(measurement.timestamp, base_times.offsets[time_index]) {
            Some(offset) => {
                buf.put_u16(offset);
            }
            None => {
                buf.put_u16(TIME_OFFSET_SENTINEL);
                buf.put_u64(measurement.timestamp.0);
            }
        }
        Ok(())
    }

    /// A compact offset must reproduce the tick exactly on decode, so it is
    ///  only usable when the delta is in window and on a unit boundary. Leap
    ///  second flags only travel in the full fidelity form.
    fn time_offset(&self, timestamp: Ticks, base: u64) -> Option<u16> {
        if base == 0 || timestamp.0 != timestamp.timestamp_value() {
            return None;
        }
        let delta = timestamp.0.checked_sub(base)?;
        if delta % self.offset_unit() != 0 {
            return None;
        }
        let units = delta / self.offset_unit();
        (units <= MAX_TIME_OFFSET).then_some(units as u16)
    }

    /// Parses one record. Returns `Ok(None)` when the runtime index is not in
    ///  the given cache: the peer may be mid cache rotation, so the record is
    ///  skipped rather than treated as an error.
    pub fn decode(
        &self,
        buf: &mut impl Buf,
        cache: &SignalIndexCache,
        base_times: &BaseTimes,
    ) -> anyhow::Result<Option<Measurement>> {
        let compact = buf.try_get_u8()?;
        let runtime_index = buf.try_get_u16()? as u32;

        let value = if self.use_double_precision {
            f64::from_bits(buf.try_get_u64()?)
        }
        else {
            f32::from_bits(buf.try_get_u32()?) as f64
        };

        let timestamp = if self.include_time {
            let offset = buf.try_get_u16()?;
            if offset == TIME_OFFSET_SENTINEL {
                Ticks(buf.try_get_u64()?)
            }
            else {
                let time_index = usize::from(compact & compact_flags::TIME_INDEX != 0);
                Ticks(base_times.offsets[time_index] + offset as u64 * self.offset_unit())
            }
        }
        else {
            Ticks(0)
        };

        let Some(signal_id) = cache.signal_id(runtime_index) else {
            return Ok(None);
        };

        Ok(Some(Measurement {
            signal_id,
            value,
            timestamp,
            flags: map_to_full(compact),
        }))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use uuid::Uuid;

    use super::*;

    fn cache_with(signal_id: Uuid) -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add_record(0, signal_id, "PPA:1", 1);
        cache
    }

    fn base_times() -> BaseTimes {
        BaseTimes {
            active_index: 0,
            offsets: [Ticks::UNIX_BASE_OFFSET, 0],
        }
    }

    #[rstest]
    #[case::at_base(0)]
    #[case::in_window(12_345)]
    #[case::window_edge(MAX_TIME_OFFSET)]
    fn test_round_trip_in_window(#[case] offset_units: u64) {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, 60.5, Ticks(base_times.offsets[0] + offset_units));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 4 + 2);

        let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
        assert_eq!(decoded, measurement);
    }

    #[rstest]
    #[case::beyond_window(MAX_TIME_OFFSET + 1)]
    #[case::far_future(u32::MAX as u64 * 7)]
    fn test_round_trip_full_timestamp(#[case] offset_units: u64) {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, -0.25, Ticks(base_times.offsets[0] + offset_units));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 4 + 2 + 8);

        let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
        assert_eq!(decoded, measurement);
    }

    #[test]
    fn test_before_base_uses_full_timestamp() {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, 1.0, Ticks(base_times.offsets[0] - 1));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 4 + 2 + 8);
        let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
        assert_eq!(decoded.timestamp, measurement.timestamp);
    }

    #[test]
    fn test_millisecond_resolution() {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: true, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        // exact millisecond boundary: 2-byte offset
        let on_boundary = Measurement::new(signal_id, 2.0, Ticks(base_times.offsets[0] + 17 * Ticks::PER_MILLISECOND));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &on_boundary, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 9);
        assert_eq!(codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap(), on_boundary);

        // sub-millisecond remainder would not survive the offset encoding
        let off_boundary = Measurement::new(signal_id, 2.0, Ticks(base_times.offsets[0] + 17 * Ticks::PER_MILLISECOND + 3));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &off_boundary, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 17);
        assert_eq!(codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap(), off_boundary);
    }

    #[test]
    fn test_leap_second_forces_full_timestamp() {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, 3.0, Ticks(base_times.offsets[0] + 5).set_leap_second());
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();

        let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
        assert!(decoded.timestamp.is_leap_second());
        assert_eq!(decoded.timestamp, measurement.timestamp);
    }

    #[test]
    fn test_double_precision_value() {
        let codec = CompactCodec { include_time: false, use_millisecond_resolution: false, use_double_precision: true };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, 0.1 + 0.2, Ticks(0));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 8);

        let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
        assert_eq!(decoded.value, measurement.value);
    }

    #[test]
    fn test_time_index_bit_selects_base() {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = BaseTimes {
            active_index: 1,
            offsets: [0, Ticks::UNIX_BASE_OFFSET + Ticks::PER_HOUR],
        };

        let measurement = Measurement::new(signal_id, 9.0, Ticks(base_times.offsets[1] + 500));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
        assert_eq!(buf[0] & 0x80, 0x80);
        assert_eq!(codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap(), measurement);
    }

    #[test]
    fn test_unknown_index_is_skipped() {
        let codec = CompactCodec { include_time: true, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        let measurement = Measurement::new(signal_id, 1.5, Ticks(base_times.offsets[0] + 1));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();

        // decode against a cache from a different rotation
        let mut other_cache = SignalIndexCache::new();
        other_cache.add_record(9, Uuid::new_v4(), "PPA:9", 9);
        let mut buf = buf.freeze();
        assert_eq!(codec.decode(&mut buf, &other_cache, &base_times).unwrap(), None);
        // the record was fully consumed, follow-up records stay parseable
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_flag_group_mapping_round_trip() {
        let codec = CompactCodec { include_time: false, use_millisecond_resolution: false, use_double_precision: false };
        let signal_id = Uuid::new_v4();
        let cache = cache_with(signal_id);
        let base_times = base_times();

        // group masks are the fixed points of the lossy compact mapping
        for flags in [StateFlags::NORMAL, StateFlags(DATA_QUALITY_MASK), StateFlags(TIME_QUALITY_MASK | CALCULATED_VALUE_MASK)] {
            let mut measurement = Measurement::new(signal_id, 1.0, Ticks(0));
            measurement.flags = flags;

            let mut buf = BytesMut::new();
            codec.encode(&mut buf, &measurement, &cache, &base_times).unwrap();
            let decoded = codec.decode(&mut buf.freeze(), &cache, &base_times).unwrap().unwrap();
            assert_eq!(decoded.flags, flags);
        }
    }

    #[test]
    fn test_base_times_round_trip() {
        let base_times = BaseTimes { active_index: 1, offsets: [123, 456] };
        let mut buf = BytesMut::new();
        base_times.ser(&mut buf);
        assert_eq!(buf.len(), 24);
        assert_eq!(BaseTimes::try_deser(buf.freeze()).unwrap(), base_times);
    }

    #[test]
    fn test_base_times_invalid_index() {
        let mut buf = BytesMut::new();
        buf.put_u64(2);
        buf.put_u64(0);
        buf.put_u64(0);
        assert!(BaseTimes::try_deser(buf.freeze()).is_err());
    }
}
