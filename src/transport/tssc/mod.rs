//! Time-Series Special Compression: a stateful stream codec for
//!  `(index, timestamp, flags, value)` tuples.
//!
//! Every component of a point is delta-encoded against per-signal history,
//!  and the residual sizes are announced through per-signal adaptive prefix
//!  codes, so that steady telemetry (same signal order, regular timestamps,
//!  slowly moving values) costs a handful of bits per point.
//!
//! Encoder and decoder are strictly stateful mirrors of each other: both
//!  start from identical empty state when a signal index cache is installed,
//!  and a block sequence mismatch means the stream can only be recovered by
//!  reconnecting.

mod decoder;
mod encoder;
mod point_metadata;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// First byte of every TSSC block; a decoder rejects anything else.
pub const TSSC_VERSION: u8 = 1;

/// Size of the `[version][u16 sequence]` block header.
pub const BLOCK_HEADER_SIZE: usize = 3;

/// The 32 stream code words. Values 1..=7 change the active signal index,
///  8..=17 the timestamp, 18..=19 the state flags, 20..=31 the value.
pub(crate) mod code_words {
    pub const END_OF_STREAM: u8 = 0;

    pub const POINT_ID_XOR4: u8 = 1;
    pub const POINT_ID_XOR8: u8 = 2;
    pub const POINT_ID_XOR12: u8 = 3;
    pub const POINT_ID_XOR16: u8 = 4;
    pub const POINT_ID_XOR20: u8 = 5;
    pub const POINT_ID_XOR24: u8 = 6;
    pub const POINT_ID_XOR32: u8 = 7;

    pub const TIME_DELTA1_FORWARD: u8 = 8;
    pub const TIME_DELTA2_FORWARD: u8 = 9;
    pub const TIME_DELTA3_FORWARD: u8 = 10;
    pub const TIME_DELTA4_FORWARD: u8 = 11;
    pub const TIME_DELTA1_REVERSE: u8 = 12;
    pub const TIME_DELTA2_REVERSE: u8 = 13;
    pub const TIME_DELTA3_REVERSE: u8 = 14;
    pub const TIME_DELTA4_REVERSE: u8 = 15;
    pub const TIMESTAMP2: u8 = 16;
    pub const TIME_XOR_7BIT: u8 = 17;

    pub const STATE_FLAGS2: u8 = 18;
    pub const STATE_FLAGS_7BIT32: u8 = 19;

    pub const VALUE1: u8 = 20;
    pub const VALUE2: u8 = 21;
    pub const VALUE3: u8 = 22;
    pub const VALUE_ZERO: u8 = 23;
    pub const VALUE_XOR4: u8 = 24;
    pub const VALUE_XOR8: u8 = 25;
    pub const VALUE_XOR12: u8 = 26;
    pub const VALUE_XOR16: u8 = 27;
    pub const VALUE_XOR20: u8 = 28;
    pub const VALUE_XOR24: u8 = 29;
    pub const VALUE_XOR28: u8 = 30;
    pub const VALUE_XOR32: u8 = 31;
}

/// Both sides keep the four most recently seen distinct timestamp deltas,
///  smallest first, so that regular sampling intervals compress to a bare
///  code word.
pub(crate) fn update_time_deltas(prev_timestamp: i64, timestamp: i64, deltas: &mut [i64; 4]) {
    let min_delta = prev_timestamp.wrapping_sub(timestamp).wrapping_abs();

    if min_delta < deltas[3] && min_delta != deltas[0] && min_delta != deltas[1] && min_delta != deltas[2] {
        if min_delta < deltas[0] {
            deltas[3] = deltas[2];
            deltas[2] = deltas[1];
            deltas[1] = deltas[0];
            deltas[0] = min_delta;
        }
        else if min_delta < deltas[1] {
            deltas[3] = deltas[2];
            deltas[2] = deltas[1];
            deltas[1] = min_delta;
        }
        else if min_delta < deltas[2] {
            deltas[3] = deltas[2];
            deltas[2] = min_delta;
        }
        else {
            deltas[3] = min_delta;
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::ticks::Ticks;
    use crate::transport::measurement::StateFlags;

    use super::*;

    type Point = (u32, Ticks, StateFlags, f32);

    fn round_trip(points: &[Point], max_signal_index: u32) {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(max_signal_index);

        for &(index, timestamp, flags, value) in points {
            encoder.add_measurement(index, timestamp, flags, value);
        }
        let block = encoder.finish_block();

        decoder.set_block(&block).unwrap();
        let mut decoded = Vec::new();
        while let Some(point) = decoder.next_measurement().unwrap() {
            decoded.push(point);
        }
        assert_eq!(decoded, points);
    }

    fn steady_stream(count: usize) -> Vec<Point> {
        let base = Ticks::UNIX_BASE_OFFSET;
        (0..count)
            .map(|i| {
                let signal = (i % 3) as u32;
                let timestamp = Ticks(base + (i / 3) as u64 * 10 * Ticks::PER_MILLISECOND);
                let value = 59.98 + signal as f32 * 0.01 + (i / 3) as f32 * 1e-4;
                (signal, timestamp, StateFlags::NORMAL, value)
            })
            .collect()
    }

    #[test]
    fn test_identity_single_point() {
        round_trip(&[(0, Ticks(Ticks::UNIX_BASE_OFFSET), StateFlags::NORMAL, 60.01)], 1);
    }

    #[test]
    fn test_identity_steady_stream() {
        round_trip(&steady_stream(3000), 3);
    }

    #[test]
    fn test_identity_irregular_stream() {
        let base = Ticks::UNIX_BASE_OFFSET;
        let points = vec![
            (0, Ticks(base), StateFlags::NORMAL, 0.0),
            (2, Ticks(base + 7), StateFlags::BAD_DATA, f32::MIN_POSITIVE),
            (2, Ticks(base + 7), StateFlags::BAD_DATA, f32::MAX),
            (1, Ticks(base), StateFlags::NORMAL, -1.5e-20),
            // time moving backwards, quality flapping, extreme values
            (0, Ticks(base - 3 * Ticks::PER_SECOND), StateFlags::BAD_TIME | StateFlags::SUSPECT_DATA, f32::NEG_INFINITY),
            (0, Ticks(base - 3 * Ticks::PER_SECOND), StateFlags::NORMAL, 0.0),
            (1, Ticks(base + 40 * Ticks::PER_DAY), StateFlags(u32::MAX), 1.0),
            (2, Ticks(base + 40 * Ticks::PER_DAY), StateFlags(u32::MAX), -1.0),
        ];
        round_trip(&points, 3);
    }

    #[test]
    fn test_identity_nan_is_bit_exact() {
        let nan = f32::from_bits(0x7fc0_1234);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(1);

        encoder.add_measurement(0, Ticks(1), StateFlags::NORMAL, nan);
        decoder.set_block(&encoder.finish_block()).unwrap();

        let (_, _, _, value) = decoder.next_measurement().unwrap().unwrap();
        assert_eq!(value.to_bits(), nan.to_bits());
    }

    #[test]
    fn test_identity_sparse_signal_indices() {
        let points: Vec<Point> = (0..200)
            .map(|i| ((i * 37) % 1000, Ticks(Ticks::UNIX_BASE_OFFSET + i as u64), StateFlags::NORMAL, i as f32))
            .collect();
        round_trip(&points, 1000);
    }

    #[test]
    fn test_multiple_blocks_share_state() {
        let points = steady_stream(600);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(3);

        let mut decoded = Vec::new();
        let mut block_sizes = Vec::new();
        for chunk in points.chunks(100) {
            for &(index, timestamp, flags, value) in chunk {
                encoder.add_measurement(index, timestamp, flags, value);
            }
            let block = encoder.finish_block();
            block_sizes.push(block.len());
            decoder.set_block(&block).unwrap();
            while let Some(point) = decoder.next_measurement().unwrap() {
                decoded.push(point);
            }
        }
        assert_eq!(decoded, points);

        // later blocks ride on warmed-up per-signal state and shrink
        assert!(*block_sizes.last().unwrap() < block_sizes[0],
                "expected warmed-up blocks to shrink: {:?}", block_sizes);
    }

    #[test]
    fn test_reset_restores_empty_state() {
        let points = steady_stream(300);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(3);

        for &(index, timestamp, flags, value) in &points {
            encoder.add_measurement(index, timestamp, flags, value);
        }
        let first_run = encoder.finish_block();
        decoder.set_block(&first_run).unwrap();
        while decoder.next_measurement().unwrap().is_some() {}

        // a cache rotation resets both ends to virgin state
        encoder.reset();
        decoder.reset();

        for &(index, timestamp, flags, value) in &points {
            encoder.add_measurement(index, timestamp, flags, value);
        }
        let second_run = encoder.finish_block();
        assert_eq!(first_run, second_run);

        decoder.set_block(&second_run).unwrap();
        let mut decoded = Vec::new();
        while let Some(point) = decoder.next_measurement().unwrap() {
            decoded.push(point);
        }
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_sequence_number_mismatch_is_fatal() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(1);

        encoder.add_measurement(0, Ticks(1), StateFlags::NORMAL, 1.0);
        let _lost = encoder.finish_block();
        encoder.add_measurement(0, Ticks(2), StateFlags::NORMAL, 2.0);
        let second = encoder.finish_block();

        assert!(decoder.set_block(&second).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut decoder = Decoder::new(1);
        assert!(decoder.set_block(&[2, 0, 0, 0xff]).is_err());
    }

    #[test]
    fn test_index_beyond_cache_rejected() {
        let mut encoder = Encoder::new();
        encoder.add_measurement(50, Ticks(1), StateFlags::NORMAL, 1.0);
        let block = encoder.finish_block();

        let mut decoder = Decoder::new(10);
        decoder.set_block(&block).unwrap();
        assert!(decoder.next_measurement().is_err());
    }

    #[rstest]
    #[case::steady(10_000)]
    fn test_compression_ratio(#[case] count: usize) {
        // one signal at a regular 10 ms cadence
        let base = Ticks::UNIX_BASE_OFFSET;
        let points: Vec<Point> = (0..count)
            .map(|i| (0, Ticks(base + i as u64 * 10 * Ticks::PER_MILLISECOND), StateFlags::NORMAL, 60.0 + (i % 7) as f32 * 0.001))
            .collect();

        let mut encoder = Encoder::new();
        for &(index, timestamp, flags, value) in &points {
            encoder.add_measurement(index, timestamp, flags, value);
        }
        let block = encoder.finish_block();

        // uncompressed compact form: flags + index + value + full 8-byte time
        //  once the 16-bit offset window is exhausted
        let compact_bytes = count * (1 + 2 + 4 + 2) + points.iter().skip(6554).count() * 8;
        assert!(
            (block.len() as f64) < compact_bytes as f64 * 0.35,
            "TSSC block of {} bytes is not < 35% of {} compact bytes",
            block.len(),
            compact_bytes
        );

        round_trip(&points, 1);
    }
}
