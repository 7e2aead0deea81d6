use bytes::{BufMut, Bytes, BytesMut};

use crate::ticks::Ticks;
use crate::transport::measurement::StateFlags;
use crate::transport::tssc::point_metadata::PointMetadata;
use crate::transport::tssc::{code_words, update_time_deltas, TSSC_VERSION};

/// The shared output stream: code words go into an interleaved bit channel,
///  residual payloads are appended as whole bytes.
///
/// Whenever the first bit of a new bit group is written, a placeholder byte
///  is reserved at the current stream position; the group is stored there
///  once eight bits have accumulated (or on the final flush). That way the
///  decoder, which refills its bit cache from the byte it has advanced to,
///  finds each bit group exactly where it needs it relative to the payload
///  bytes.
pub(super) struct BitOutput {
    data: Vec<u8>,
    cache: u32,
    count: u32,
    reserved: Option<usize>,
}

impl BitOutput {
    pub fn new() -> BitOutput {
        BitOutput {
            data: Vec::new(),
            cache: 0,
            count: 0,
            reserved: None,
        }
    }

    pub fn write_bits(&mut self, code: u32, len: u32) {
        debug_assert!(len >= 1 && len <= 8 && code < (1 << len));

        if self.count == 0 {
            self.reserved = Some(self.data.len());
            self.data.push(0);
        }

        self.cache = (self.cache << len) | code;
        self.count += len;

        if self.count >= 8 {
            self.count -= 8;
            let slot = self.reserved.take().expect("a bit slot is reserved while bits are pending");
            self.data[slot] = (self.cache >> self.count) as u8;

            if self.count > 0 {
                self.reserved = Some(self.data.len());
                self.data.push(0);
                self.cache &= (1 << self.count) - 1;
            }
            else {
                self.cache = 0;
            }
        }
    }

    pub fn put_u8(&mut self, byte: u8) {
        self.data.push(byte);
    }

    pub fn put_7bit_u32(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.data.push((value | 0x80) as u8);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    pub fn put_7bit_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.data.push((value | 0x80) as u8);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    /// Left-aligns any pending bits into their reserved byte. Only valid at
    ///  the end of a block.
    pub fn flush_remaining(&mut self) {
        if self.count > 0 {
            let slot = self.reserved.take().expect("a bit slot is reserved while bits are pending");
            self.data[slot] = (self.cache << (8 - self.count)) as u8;
            self.cache = 0;
            self.count = 0;
        }
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Which adaptive table a code travels through. The decoder reads the first
///  code(s) of a measurement through the previous measurement's point and
///  switches to the current point once a timestamp or flags section has been
///  consumed, so the encoder must pick tables the same way.
#[derive(Clone, Copy)]
enum Table {
    Last,
    Point(usize),
}

pub struct Encoder {
    prev_timestamp1: i64,
    prev_timestamp2: i64,
    prev_time_deltas: [i64; 4],

    head: PointMetadata,
    last_point: Option<usize>,
    points: Vec<Option<PointMetadata>>,

    out: BitOutput,
    sequence_number: u16,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_deltas: [i64::MAX; 4],
            head: PointMetadata::new(),
            last_point: None,
            points: Vec::new(),
            out: BitOutput::new(),
            sequence_number: 0,
        }
    }

    /// Drops all signal history and restarts block sequencing, as required
    ///  when a new signal index cache takes effect.
    pub fn reset(&mut self) {
        *self = Encoder::new();
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Bytes accumulated for the current block so far.
    pub fn pending_len(&self) -> usize {
        self.out.len()
    }

    pub fn add_measurement(&mut self, index: u32, timestamp: Ticks, flags: StateFlags, value: f32) {
        let ts = timestamp.0 as i64;
        let idx = index as usize;

        if self.points.len() <= idx {
            self.points.resize_with(idx + 1, || None);
        }
        if self.points[idx].is_none() {
            let mut point = PointMetadata::new();
            point.prev_next_point_id = index + 1;
            self.points[idx] = Some(point);
        }

        if self.point(Table::Last).prev_next_point_id != index {
            self.write_point_id_change(index);
        }

        let time_changed = self.prev_timestamp1 != ts;
        if time_changed {
            self.write_timestamp_change(ts);
        }

        let flags_changed = self.point(Table::Point(idx)).prev_state_flags1 != flags.0;
        if flags_changed {
            self.write_state_flags_change(idx, flags.0, time_changed);
        }

        self.write_value(idx, value.to_bits(), time_changed || flags_changed);

        self.last_point = Some(idx);
    }

    /// Terminates and returns the current block: `[version][u16 sequence]`
    ///  followed by the stream. All per-signal state carries over to the next
    ///  block; only the stream itself starts fresh.
    pub fn finish_block(&mut self) -> Bytes {
        self.write_code(Table::Last, code_words::END_OF_STREAM);
        self.out.flush_remaining();

        let mut frame = BytesMut::with_capacity(3 + self.out.len());
        frame.put_u8(TSSC_VERSION);
        frame.put_u16(self.sequence_number);
        frame.put_slice(&self.out.take_data());

        self.sequence_number = self.sequence_number.wrapping_add(1);
        frame.freeze()
    }

    fn point(&self, table: Table) -> &PointMetadata {
        match table {
            Table::Last => match self.last_point {
                None => &self.head,
                Some(i) => self.points[i].as_ref().expect("last point exists"),
            },
            Table::Point(i) => self.points[i].as_ref().expect("point was created on entry"),
        }
    }

    fn write_code(&mut self, table: Table, code: u8) {
        let Encoder { head, last_point, points, out, .. } = self;
        let point = match table {
            Table::Last => match last_point {
                None => head,
                Some(i) => points[*i].as_mut().expect("last point exists"),
            },
            Table::Point(i) => points[i].as_mut().expect("point was created on entry"),
        };
        point.write_code(out, code);
    }

    fn write_point_id_change(&mut self, id: u32) {
        let xor = self.point(Table::Last).prev_next_point_id ^ id;

        if xor < (1 << 4) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR4);
            self.out.write_bits(xor, 4);
        }
        else if xor < (1 << 8) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR8);
            self.out.put_u8(xor as u8);
        }
        else if xor < (1 << 12) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR12);
            self.out.write_bits(xor & 15, 4);
            self.out.put_u8((xor >> 4) as u8);
        }
        else if xor < (1 << 16) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR16);
            self.out.put_u8(xor as u8);
            self.out.put_u8((xor >> 8) as u8);
        }
        else if xor < (1 << 20) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR20);
            self.out.write_bits(xor & 15, 4);
            self.out.put_u8((xor >> 4) as u8);
            self.out.put_u8((xor >> 12) as u8);
        }
        else if xor < (1 << 24) {
            self.write_code(Table::Last, code_words::POINT_ID_XOR24);
            self.out.put_u8(xor as u8);
            self.out.put_u8((xor >> 8) as u8);
            self.out.put_u8((xor >> 16) as u8);
        }
        else {
            self.write_code(Table::Last, code_words::POINT_ID_XOR32);
            self.out.put_u8(xor as u8);
            self.out.put_u8((xor >> 8) as u8);
            self.out.put_u8((xor >> 16) as u8);
            self.out.put_u8((xor >> 24) as u8);
        }

        let Encoder { head, last_point, points, .. } = self;
        let last = match last_point {
            None => head,
            Some(i) => points[*i].as_mut().expect("last point exists"),
        };
        last.prev_next_point_id = id;
    }

    fn write_timestamp_change(&mut self, ts: i64) {
        let prev1 = self.prev_timestamp1;

        if self.prev_timestamp2 == ts {
            self.write_code(Table::Last, code_words::TIMESTAMP2);
        }
        else if prev1 < ts {
            if ts.wrapping_sub(prev1) == self.prev_time_deltas[0] {
                self.write_code(Table::Last, code_words::TIME_DELTA1_FORWARD);
            }
            else if ts.wrapping_sub(prev1) == self.prev_time_deltas[1] {
                self.write_code(Table::Last, code_words::TIME_DELTA2_FORWARD);
            }
            else if ts.wrapping_sub(prev1) == self.prev_time_deltas[2] {
                self.write_code(Table::Last, code_words::TIME_DELTA3_FORWARD);
            }
            else if ts.wrapping_sub(prev1) == self.prev_time_deltas[3] {
                self.write_code(Table::Last, code_words::TIME_DELTA4_FORWARD);
            }
            else {
                self.write_code(Table::Last, code_words::TIME_XOR_7BIT);
                self.out.put_7bit_u64((ts ^ prev1) as u64);
            }
        }
        else if prev1.wrapping_sub(ts) == self.prev_time_deltas[0] {
            self.write_code(Table::Last, code_words::TIME_DELTA1_REVERSE);
        }
        else if prev1.wrapping_sub(ts) == self.prev_time_deltas[1] {
            self.write_code(Table::Last, code_words::TIME_DELTA2_REVERSE);
        }
        else if prev1.wrapping_sub(ts) == self.prev_time_deltas[2] {
            self.write_code(Table::Last, code_words::TIME_DELTA3_REVERSE);
        }
        else if prev1.wrapping_sub(ts) == self.prev_time_deltas[3] {
            self.write_code(Table::Last, code_words::TIME_DELTA4_REVERSE);
        }
        else {
            self.write_code(Table::Last, code_words::TIME_XOR_7BIT);
            self.out.put_7bit_u64((ts ^ prev1) as u64);
        }

        update_time_deltas(prev1, ts, &mut self.prev_time_deltas);
        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = ts;
    }

    fn write_state_flags_change(&mut self, idx: usize, flags: u32, time_changed: bool) {
        let table = if time_changed { Table::Point(idx) } else { Table::Last };

        if self.point(Table::Point(idx)).prev_state_flags2 == flags {
            self.write_code(table, code_words::STATE_FLAGS2);
        }
        else {
            self.write_code(table, code_words::STATE_FLAGS_7BIT32);
            self.out.put_7bit_u32(flags);
        }

        let point = self.points[idx].as_mut().expect("point was created on entry");
        point.prev_state_flags2 = point.prev_state_flags1;
        point.prev_state_flags1 = flags;
    }

    fn write_value(&mut self, idx: usize, value_raw: u32, preceded_by_section: bool) {
        let table = if preceded_by_section { Table::Point(idx) } else { Table::Last };
        let point = self.points[idx].as_ref().expect("point was created on entry");
        let (prev1, prev2, prev3) = (point.prev_value1, point.prev_value2, point.prev_value3);

        if prev1 == value_raw {
            self.write_code(table, code_words::VALUE1);
        }
        else if prev2 == value_raw {
            self.write_code(table, code_words::VALUE2);
            let point = self.points[idx].as_mut().expect("point was created on entry");
            point.prev_value2 = prev1;
            point.prev_value1 = value_raw;
        }
        else if prev3 == value_raw {
            self.write_code(table, code_words::VALUE3);
            let point = self.points[idx].as_mut().expect("point was created on entry");
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = value_raw;
        }
        else if value_raw == 0 {
            self.write_code(table, code_words::VALUE_ZERO);
            let point = self.points[idx].as_mut().expect("point was created on entry");
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = 0;
        }
        else {
            let xor = value_raw ^ prev1;

            if xor < (1 << 4) {
                self.write_code(table, code_words::VALUE_XOR4);
                self.out.write_bits(xor, 4);
            }
            else if xor < (1 << 8) {
                self.write_code(table, code_words::VALUE_XOR8);
                self.out.put_u8(xor as u8);
            }
            else if xor < (1 << 12) {
                self.write_code(table, code_words::VALUE_XOR12);
                self.out.write_bits(xor & 15, 4);
                self.out.put_u8((xor >> 4) as u8);
            }
            else if xor < (1 << 16) {
                self.write_code(table, code_words::VALUE_XOR16);
                self.out.put_u8(xor as u8);
                self.out.put_u8((xor >> 8) as u8);
            }
            else if xor < (1 << 20) {
                self.write_code(table, code_words::VALUE_XOR20);
                self.out.write_bits(xor & 15, 4);
                self.out.put_u8((xor >> 4) as u8);
                self.out.put_u8((xor >> 12) as u8);
            }
            else if xor < (1 << 24) {
                self.write_code(table, code_words::VALUE_XOR24);
                self.out.put_u8(xor as u8);
                self.out.put_u8((xor >> 8) as u8);
                self.out.put_u8((xor >> 16) as u8);
            }
            else if xor < (1 << 28) {
                self.write_code(table, code_words::VALUE_XOR28);
                self.out.write_bits(xor & 15, 4);
                self.out.put_u8((xor >> 4) as u8);
                self.out.put_u8((xor >> 12) as u8);
                self.out.put_u8((xor >> 20) as u8);
            }
            else {
                self.write_code(table, code_words::VALUE_XOR32);
                self.out.put_u8(xor as u8);
                self.out.put_u8((xor >> 8) as u8);
                self.out.put_u8((xor >> 16) as u8);
                self.out.put_u8((xor >> 24) as u8);
            }

            let point = self.points[idx].as_mut().expect("point was created on entry");
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = value_raw;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bit_output_groups_are_msb_aligned() {
        let mut out = BitOutput::new();
        out.write_bits(0b101, 3);
        out.write_bits(0b11001, 5);
        assert_eq!(out.take_data(), vec![0b1011_1001]);
    }

    #[test]
    fn test_bit_output_final_padding() {
        let mut out = BitOutput::new();
        out.write_bits(0b11, 2);
        out.flush_remaining();
        assert_eq!(out.take_data(), vec![0b1100_0000]);
    }

    #[test]
    fn test_bit_output_reserves_before_payload_bytes() {
        // 3 bits, then a payload byte, then 5 more bits: the bit group byte
        //  must precede the payload byte in the stream
        let mut out = BitOutput::new();
        out.write_bits(0b101, 3);
        out.put_u8(0xAA);
        out.write_bits(0b01110, 5);
        assert_eq!(out.take_data(), vec![0b1010_1110, 0xAA]);
    }

    #[test]
    fn test_bit_output_residual_spans_payload() {
        let mut out = BitOutput::new();
        out.write_bits(0b1111, 4);
        out.write_bits(0b0000_1111, 8); // 12 pending -> one byte out, 4 residual
        out.put_u8(0x55);
        out.write_bits(0b1111, 4); // completes the residual group
        // layout: [first 8 bits][residual group byte][payload]
        assert_eq!(out.take_data(), vec![0b1111_0000, 0b1111_1111, 0x55]);
    }

    #[test]
    fn test_7bit_encoding() {
        let mut out = BitOutput::new();
        out.put_7bit_u32(0);
        out.put_7bit_u32(127);
        out.put_7bit_u32(128);
        out.put_7bit_u64(u64::MAX);
        let data = out.take_data();
        assert_eq!(&data[..4], &[0, 127, 0x80, 0x01]);
        assert_eq!(data.len(), 4 + 10);
    }

    #[test]
    fn test_finish_block_increments_sequence() {
        let mut encoder = Encoder::new();
        encoder.add_measurement(0, Ticks(1), StateFlags::NORMAL, 1.0);
        let first = encoder.finish_block();
        assert_eq!(&first[..3], &[TSSC_VERSION, 0, 0]);

        encoder.add_measurement(0, Ticks(2), StateFlags::NORMAL, 1.0);
        let second = encoder.finish_block();
        assert_eq!(&second[..3], &[TSSC_VERSION, 0, 1]);
    }
}
