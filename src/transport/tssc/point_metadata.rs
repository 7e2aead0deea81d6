use crate::transport::tssc::code_words;
use crate::transport::tssc::decoder::BitInput;
use crate::transport::tssc::encoder::BitOutput;

/// Per-signal codec state: the component history that residuals are computed
///  against, plus the adaptive prefix code table for this signal's code words.
///
/// The table starts in mode 4 (the three `VALUE*` codes get 1/2/3-bit
///  prefixes, everything else 8 bits) and re-ranks itself from observed code
///  frequencies, first after 5 codes, then after 20, then every 100. Encoder
///  and decoder run this adaptation from the same inputs, so their tables
///  stay in lockstep without any table data on the wire.
pub(super) struct PointMetadata {
    pub prev_next_point_id: u32,
    pub prev_state_flags1: u32,
    pub prev_state_flags2: u32,
    pub prev_value1: u32,
    pub prev_value2: u32,
    pub prev_value3: u32,

    command_stats: [u8; 32],
    commands_sent_since_last_change: u32,

    /// 1: flat 5-bit codes; 2..4: that many codes get short prefixes
    mode: u8,
    mode21: u8,
    mode31: u8,
    mode301: u8,
    mode41: u8,
    mode401: u8,
    mode4001: u8,
    startup_mode: u8,
}

impl PointMetadata {
    pub fn new() -> PointMetadata {
        PointMetadata {
            prev_next_point_id: 0,
            prev_state_flags1: 0,
            prev_state_flags2: 0,
            prev_value1: 0,
            prev_value2: 0,
            prev_value3: 0,
            command_stats: [0; 32],
            commands_sent_since_last_change: 0,
            mode: 4,
            mode21: 0,
            mode31: 0,
            mode301: 0,
            mode41: code_words::VALUE1,
            mode401: code_words::VALUE2,
            mode4001: code_words::VALUE3,
            startup_mode: 0,
        }
    }

    pub fn write_code(&mut self, out: &mut BitOutput, code: u8) {
        match self.mode {
            1 => out.write_bits(code as u32, 5),
            2 => {
                if code == self.mode21 {
                    out.write_bits(1, 1);
                }
                else {
                    out.write_bits(code as u32, 6);
                }
            }
            3 => {
                if code == self.mode31 {
                    out.write_bits(1, 1);
                }
                else if code == self.mode301 {
                    out.write_bits(1, 2);
                }
                else {
                    out.write_bits(code as u32, 7);
                }
            }
            4 => {
                if code == self.mode41 {
                    out.write_bits(1, 1);
                }
                else if code == self.mode401 {
                    out.write_bits(1, 2);
                }
                else if code == self.mode4001 {
                    out.write_bits(1, 3);
                }
                else {
                    out.write_bits(code as u32, 8);
                }
            }
            _ => unreachable!("adaptation only produces modes 1..=4"),
        }

        self.update_code_statistics(code);
    }

    pub fn read_code(&mut self, input: &mut BitInput) -> anyhow::Result<u8> {
        let code = match self.mode {
            1 => input.read_bits5()? as u8,
            2 => {
                if input.read_bit()? == 1 {
                    self.mode21
                }
                else {
                    input.read_bits5()? as u8
                }
            }
            3 => {
                if input.read_bit()? == 1 {
                    self.mode31
                }
                else if input.read_bit()? == 1 {
                    self.mode301
                }
                else {
                    input.read_bits5()? as u8
                }
            }
            4 => {
                if input.read_bit()? == 1 {
                    self.mode41
                }
                else if input.read_bit()? == 1 {
                    self.mode401
                }
                else if input.read_bit()? == 1 {
                    self.mode4001
                }
                else {
                    input.read_bits5()? as u8
                }
            }
            _ => unreachable!("adaptation only produces modes 1..=4"),
        };

        self.update_code_statistics(code);
        Ok(code)
    }

    fn update_code_statistics(&mut self, code: u8) {
        self.commands_sent_since_last_change += 1;
        self.command_stats[code as usize] += 1;

        if self.startup_mode == 0 && self.commands_sent_since_last_change > 5 {
            self.startup_mode += 1;
            self.adapt_commands();
        }
        else if self.startup_mode == 1 && self.commands_sent_since_last_change > 20 {
            self.startup_mode += 1;
            self.adapt_commands();
        }
        else if self.startup_mode == 2 && self.commands_sent_since_last_change > 100 {
            self.adapt_commands();
        }
    }

    /// Re-ranks the three most frequent codes since the last adaptation and
    ///  picks whichever prefix mode would have spent the fewest bits on them.
    fn adapt_commands(&mut self) {
        let mut code1 = 0u8;
        let mut count1 = 0u32;
        let mut code2 = 1u8;
        let mut count2 = 0u32;
        let mut code3 = 2u8;
        let mut count3 = 0u32;
        let mut total = 0u32;

        for i in 0..self.command_stats.len() {
            let count = self.command_stats[i] as u32;
            self.command_stats[i] = 0;
            total += count;

            if count > count3 {
                if count > count1 {
                    code3 = code2;
                    count3 = count2;
                    code2 = code1;
                    count2 = count1;
                    code1 = i as u8;
                    count1 = count;
                }
                else if count > count2 {
                    code3 = code2;
                    count3 = count2;
                    code2 = i as u8;
                    count2 = count;
                }
                else {
                    code3 = i as u8;
                    count3 = count;
                }
            }
        }

        let mode1_size = total * 5;
        let mode2_size = count1 + (total - count1) * 6;
        let mode3_size = count1 + count2 * 2 + (total - count1 - count2) * 7;
        let mode4_size = count1 + count2 * 2 + count3 * 3 + (total - count1 - count2 - count3) * 8;

        let min_size = mode1_size.min(mode2_size).min(mode3_size).min(mode4_size);

        if min_size == mode1_size {
            self.mode = 1;
        }
        else if min_size == mode2_size {
            self.mode = 2;
            self.mode21 = code1;
        }
        else if min_size == mode3_size {
            self.mode = 3;
            self.mode31 = code1;
            self.mode301 = code2;
        }
        else {
            self.mode = 4;
            self.mode41 = code1;
            self.mode401 = code2;
            self.mode4001 = code3;
        }

        self.commands_sent_since_last_change = 0;
    }
}
