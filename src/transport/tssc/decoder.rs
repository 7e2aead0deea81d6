use anyhow::bail;

use crate::ticks::Ticks;
use crate::transport::measurement::StateFlags;
use crate::transport::tssc::point_metadata::PointMetadata;
use crate::transport::tssc::{code_words, update_time_deltas, BLOCK_HEADER_SIZE, TSSC_VERSION};

/// The decoder's view of a block stream: bit groups are pulled from the byte
///  the reader has advanced to whenever the bit cache runs dry, payload bytes
///  are consumed in between. This mirrors [`BitOutput`](super::encoder)
///  byte for byte.
pub(super) struct BitInput {
    data: Vec<u8>,
    position: usize,
    cache: u32,
    count: u32,
}

impl BitInput {
    pub fn new(data: Vec<u8>) -> BitInput {
        BitInput {
            data,
            position: 0,
            cache: 0,
            count: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.position == self.data.len() && self.count == 0
    }

    pub fn clear_bits(&mut self) {
        self.cache = 0;
        self.count = 0;
    }

    pub fn read_bit(&mut self) -> anyhow::Result<u32> {
        if self.count == 0 {
            if self.position == self.data.len() {
                bail!("bit stream underflow at byte {}", self.position);
            }
            self.cache = self.data[self.position] as u32;
            self.position += 1;
            self.count = 8;
        }
        self.count -= 1;
        Ok((self.cache >> self.count) & 1)
    }

    pub fn read_bits4(&mut self) -> anyhow::Result<u32> {
        Ok(self.read_bit()? << 3 | self.read_bit()? << 2 | self.read_bit()? << 1 | self.read_bit()?)
    }

    pub fn read_bits5(&mut self) -> anyhow::Result<u32> {
        Ok(self.read_bit()? << 4 | self.read_bits4()?)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        if self.position == self.data.len() {
            bail!("byte stream underflow at byte {}", self.position);
        }
        let byte = self.data[self.position];
        self.position += 1;
        Ok(byte)
    }

    pub fn read_7bit_u32(&mut self) -> anyhow::Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 28 {
                bail!("7-bit encoded u32 exceeds 5 bytes");
            }
        }
    }

    pub fn read_7bit_u64(&mut self) -> anyhow::Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                bail!("7-bit encoded u64 exceeds 10 bytes");
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Table {
    Last,
    Point(usize),
}

pub struct Decoder {
    max_signal_index: u32,

    prev_timestamp1: i64,
    prev_timestamp2: i64,
    prev_time_deltas: [i64; 4],

    head: PointMetadata,
    last_point: Option<usize>,
    points: Vec<Option<PointMetadata>>,

    input: BitInput,
    sequence_number: u16,
}

impl Decoder {
    /// `max_signal_index` bounds the runtime indices this stream may carry,
    ///  normally the active signal index cache's size. A decoded index at or
    ///  beyond the bound is a fatal codec error.
    pub fn new(max_signal_index: u32) -> Decoder {
        Decoder {
            max_signal_index,
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_deltas: [i64::MAX; 4],
            head: PointMetadata::new(),
            last_point: None,
            points: Vec::new(),
            input: BitInput::new(Vec::new()),
            sequence_number: 0,
        }
    }

    /// Drops all signal history and restarts block sequencing, as required
    ///  when a new signal index cache takes effect.
    pub fn reset(&mut self) {
        *self = Decoder::new(self.max_signal_index);
    }

    pub fn set_max_signal_index(&mut self, max_signal_index: u32) {
        self.max_signal_index = max_signal_index;
    }

    /// Installs the next block to decode, validating version and sequence.
    pub fn set_block(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        if frame.len() < BLOCK_HEADER_SIZE {
            bail!("TSSC block of {} bytes is shorter than its header", frame.len());
        }
        if frame[0] != TSSC_VERSION {
            bail!("unknown TSSC version {}", frame[0]);
        }

        let sequence_number = u16::from_be_bytes([frame[1], frame[2]]);
        if sequence_number != self.sequence_number {
            bail!("TSSC block out of sequence: expected {}, received {} - stream is desynchronized",
                  self.sequence_number, sequence_number);
        }
        self.sequence_number = self.sequence_number.wrapping_add(1);

        self.input = BitInput::new(frame[BLOCK_HEADER_SIZE..].to_vec());
        Ok(())
    }

    /// Decodes the next point of the current block, or `None` at the end of
    ///  the block.
    pub fn next_measurement(&mut self) -> anyhow::Result<Option<(u32, Ticks, StateFlags, f32)>> {
        if self.input.is_exhausted() {
            self.input.clear_bits();
            return Ok(None);
        }

        // the code words for a measurement arrive through the tables the
        //  encoder selected; see the table notes on the encoder side
        let mut code = self.read_code(Table::Last)?;

        if code == code_words::END_OF_STREAM {
            self.input.clear_bits();
            return Ok(None);
        }

        if code <= code_words::POINT_ID_XOR32 {
            self.decode_point_id(code)?;
            code = self.read_code(Table::Last)?;
            if code < code_words::TIME_DELTA1_FORWARD {
                bail!("expecting a timestamp code word, decoded {}", code);
            }
        }

        let index = self.point(Table::Last).prev_next_point_id;
        if index >= self.max_signal_index {
            bail!("decoded runtime index {} is beyond the active cache bound {}", index, self.max_signal_index);
        }

        let idx = index as usize;
        if self.points.len() <= idx {
            self.points.resize_with(idx + 1, || None);
        }
        if self.points[idx].is_none() {
            let mut point = PointMetadata::new();
            point.prev_next_point_id = index + 1;
            self.points[idx] = Some(point);
        }

        let timestamp = if code <= code_words::TIME_XOR_7BIT {
            let timestamp = self.decode_timestamp(code)?;
            code = self.read_code(Table::Point(idx))?;
            if code < code_words::STATE_FLAGS2 {
                bail!("expecting a state flags code word, decoded {}", code);
            }
            timestamp
        }
        else {
            self.prev_timestamp1
        };

        let state_flags = if code <= code_words::STATE_FLAGS_7BIT32 {
            let state_flags = self.decode_state_flags(code, idx)?;
            code = self.read_code(Table::Point(idx))?;
            if code < code_words::VALUE1 {
                bail!("expecting a value code word, decoded {}", code);
            }
            state_flags
        }
        else {
            self.point(Table::Point(idx)).prev_state_flags1
        };

        let value_raw = self.decode_value(code, idx)?;

        self.last_point = Some(idx);

        Ok(Some((index, Ticks(timestamp as u64), StateFlags(state_flags), f32::from_bits(value_raw))))
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

    fn read_code(&mut self, table: Table) -> anyhow::Result<u8> {
        let Decoder { head, last_point, points, input, .. } = self;
        let point = match table {
            Table::Last => match last_point {
                None => head,
                Some(i) => points[*i].as_mut().expect("last point exists"),
            },
            Table::Point(i) => points[i].as_mut().expect("point was created on entry"),
        };
        point.read_code(input)
    }

    fn decode_point_id(&mut self, code: u8) -> anyhow::Result<()> {
        let xor = match code {
            code_words::POINT_ID_XOR4 => self.input.read_bits4()?,
            code_words::POINT_ID_XOR8 => self.input.read_u8()? as u32,
            code_words::POINT_ID_XOR12 => {
                self.input.read_bits4()? | (self.input.read_u8()? as u32) << 4
            }
            code_words::POINT_ID_XOR16 => {
                self.input.read_u8()? as u32 | (self.input.read_u8()? as u32) << 8
            }
            code_words::POINT_ID_XOR20 => {
                self.input.read_bits4()?
                    | (self.input.read_u8()? as u32) << 4
                    | (self.input.read_u8()? as u32) << 12
            }
            code_words::POINT_ID_XOR24 => {
                self.input.read_u8()? as u32
                    | (self.input.read_u8()? as u32) << 8
                    | (self.input.read_u8()? as u32) << 16
            }
            code_words::POINT_ID_XOR32 => {
                self.input.read_u8()? as u32
                    | (self.input.read_u8()? as u32) << 8
                    | (self.input.read_u8()? as u32) << 16
                    | (self.input.read_u8()? as u32) << 24
            }
            _ => bail!("expecting a point id code word, decoded {}", code),
        };

        let Decoder { head, last_point, points, .. } = self;
        let last = match last_point {
            None => head,
            Some(i) => points[*i].as_mut().expect("last point exists"),
        };
        last.prev_next_point_id ^= xor;
        Ok(())
    }

    fn decode_timestamp(&mut self, code: u8) -> anyhow::Result<i64> {
        let prev1 = self.prev_timestamp1;
        let timestamp = match code {
            code_words::TIME_DELTA1_FORWARD => prev1.wrapping_add(self.prev_time_deltas[0]),
            code_words::TIME_DELTA2_FORWARD => prev1.wrapping_add(self.prev_time_deltas[1]),
            code_words::TIME_DELTA3_FORWARD => prev1.wrapping_add(self.prev_time_deltas[2]),
            code_words::TIME_DELTA4_FORWARD => prev1.wrapping_add(self.prev_time_deltas[3]),
            code_words::TIME_DELTA1_REVERSE => prev1.wrapping_sub(self.prev_time_deltas[0]),
            code_words::TIME_DELTA2_REVERSE => prev1.wrapping_sub(self.prev_time_deltas[1]),
            code_words::TIME_DELTA3_REVERSE => prev1.wrapping_sub(self.prev_time_deltas[2]),
            code_words::TIME_DELTA4_REVERSE => prev1.wrapping_sub(self.prev_time_deltas[3]),
            code_words::TIMESTAMP2 => self.prev_timestamp2,
            code_words::TIME_XOR_7BIT => prev1 ^ self.input.read_7bit_u64()? as i64,
            _ => bail!("expecting a timestamp code word, decoded {}", code),
        };

        update_time_deltas(prev1, timestamp, &mut self.prev_time_deltas);
        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = timestamp;
        Ok(timestamp)
    }

    fn decode_state_flags(&mut self, code: u8, idx: usize) -> anyhow::Result<u32> {
        let flags = if code == code_words::STATE_FLAGS2 {
            self.point(Table::Point(idx)).prev_state_flags2
        }
        else {
            self.input.read_7bit_u32()?
        };

        let point = self.points[idx].as_mut().expect("point was created on entry");
        point.prev_state_flags2 = point.prev_state_flags1;
        point.prev_state_flags1 = flags;
        Ok(flags)
    }

    fn decode_value(&mut self, code: u8, idx: usize) -> anyhow::Result<u32> {
        let point = self.points[idx].as_ref().expect("point was created on entry");
        let (prev1, prev2, prev3) = (point.prev_value1, point.prev_value2, point.prev_value3);

        let value_raw = match code {
            code_words::VALUE1 => {
                return Ok(prev1);
            }
            code_words::VALUE2 => {
                let point = self.points[idx].as_mut().expect("point was created on entry");
                point.prev_value2 = prev1;
                point.prev_value1 = prev2;
                return Ok(prev2);
            }
            code_words::VALUE3 => {
                let point = self.points[idx].as_mut().expect("point was created on entry");
                point.prev_value3 = prev2;
                point.prev_value2 = prev1;
                point.prev_value1 = prev3;
                return Ok(prev3);
            }
            code_words::VALUE_ZERO => 0,
            code_words::VALUE_XOR4 => self.input.read_bits4()? ^ prev1,
            code_words::VALUE_XOR8 => self.input.read_u8()? as u32 ^ prev1,
            code_words::VALUE_XOR12 => {
                (self.input.read_bits4()? | (self.input.read_u8()? as u32) << 4) ^ prev1
            }
            code_words::VALUE_XOR16 => {
                (self.input.read_u8()? as u32 | (self.input.read_u8()? as u32) << 8) ^ prev1
            }
            code_words::VALUE_XOR20 => {
                (self.input.read_bits4()?
                    | (self.input.read_u8()? as u32) << 4
                    | (self.input.read_u8()? as u32) << 12)
                    ^ prev1
            }
            code_words::VALUE_XOR24 => {
                (self.input.read_u8()? as u32
                    | (self.input.read_u8()? as u32) << 8
                    | (self.input.read_u8()? as u32) << 16)
                    ^ prev1
            }
            code_words::VALUE_XOR28 => {
                (self.input.read_bits4()?
                    | (self.input.read_u8()? as u32) << 4
                    | (self.input.read_u8()? as u32) << 12
                    | (self.input.read_u8()? as u32) << 20)
                    ^ prev1
            }
            code_words::VALUE_XOR32 => {
                (self.input.read_u8()? as u32
                    | (self.input.read_u8()? as u32) << 8
                    | (self.input.read_u8()? as u32) << 16
                    | (self.input.read_u8()? as u32) << 24)
                    ^ prev1
            }
            _ => bail!("expecting a value code word, decoded {}", code),
        };

        let point = self.points[idx].as_mut().expect("point was created on entry");
        point.prev_value3 = prev2;
        point.prev_value2 = prev1;
        point.prev_value1 = value_raw;
        Ok(value_raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bit_input_reads_msb_first() {
        let mut input = BitInput::new(vec![0b1011_1001]);
        assert_eq!(input.read_bit().unwrap(), 1);
        assert_eq!(input.read_bit().unwrap(), 0);
        assert_eq!(input.read_bits4().unwrap(), 0b1110);
        assert!(!input.is_exhausted());
        assert_eq!(input.read_bit().unwrap(), 0);
        assert_eq!(input.read_bit().unwrap(), 1);
        assert!(input.is_exhausted());
    }

    #[test]
    fn test_bit_input_underflow() {
        let mut input = BitInput::new(vec![0xff]);
        assert_eq!(input.read_bits5().unwrap(), 0b11111);
        assert_eq!(input.read_bit().unwrap(), 1);
        assert_eq!(input.read_bit().unwrap(), 1);
        assert_eq!(input.read_bit().unwrap(), 1);
        assert!(input.read_bit().is_err());
        assert!(input.read_u8().is_err());
    }

    #[test]
    fn test_7bit_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut raw = Vec::new();
            let mut v = value;
            while v >= 0x80 {
                raw.push((v | 0x80) as u8);
                v >>= 7;
            }
            raw.push(v as u8);

            let mut input = BitInput::new(raw);
            assert_eq!(input.read_7bit_u64().unwrap(), value);
        }
    }

    #[test]
    fn test_overlong_7bit_rejected() {
        let mut input = BitInput::new(vec![0xff; 11]);
        assert!(input.read_7bit_u64().is_err());
        let mut input = BitInput::new(vec![0xff; 6]);
        assert!(input.read_7bit_u32().is_err());
    }

    #[test]
    fn test_truncated_block_is_an_error_not_a_hang() {
        let mut decoder = Decoder::new(8);
        // valid header, then a stream that promises more than it holds
        decoder.set_block(&[TSSC_VERSION, 0, 0, 0xff, 0xff]).unwrap();
        let mut iterations = 0;
        loop {
            match decoder.next_measurement() {
                Ok(Some(_)) => {
                    iterations += 1;
                    assert!(iterations < 100, "decoder failed to terminate on truncated input");
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}
