//! The MagSgn stream of the high-throughput path: signs and magnitude
//! bodies of the significant samples, growing forward with the `0xFF`-delay
//! byte-stuffing convention.

use crate::bitio::{StuffedBitReader, StuffedBitWriter};

#[derive(Debug, Default)]
pub(crate) struct MagSgnWriter {
    writer: StuffedBitWriter,
}

impl MagSgnWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Write one significant sample: the sign, then `u - 1` bits of
    /// magnitude body. With the exponent-max flag set the body omits the
    /// implicit leading one; otherwise it carries the full magnitude, which
    /// is known to be below `2^(u-1)`.
    pub(crate) fn write_sample(&mut self, negative: bool, exponent_max: bool, u: u32, magnitude: u32) {
        debug_assert!(u >= 1);

        self.writer.write_bit(negative as u32);

        if u > 1 {
            let body = if exponent_max {
                magnitude - (1 << (u - 1))
            } else {
                magnitude
            };

            debug_assert!(body < (1 << (u - 1)));
            self.writer.write(body, (u - 1) as u8);
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

pub(crate) struct MagSgnReader<'a> {
    reader: StuffedBitReader<'a>,
}

impl<'a> MagSgnReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            reader: StuffedBitReader::new(data),
        }
    }

    /// Mirror of [`MagSgnWriter::write_sample`]: returns the signed
    /// coefficient. An exhausted stream yields zero samples.
    pub(crate) fn read_sample(&mut self, exponent_max: bool, u: u32) -> i32 {
        let Some(sign) = self.reader.read_bit() else {
            return 0;
        };

        let magnitude = if u > 1 {
            let body = self.reader.read((u - 1) as u8).unwrap_or(0);

            if exponent_max {
                body + (1 << (u - 1))
            } else {
                body
            }
        } else {
            1
        };

        if sign == 1 {
            -(magnitude as i32)
        } else {
            magnitude as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_round_trip() {
        let samples: [(bool, bool, u32, u32); 6] = [
            (false, true, 1, 1),
            (true, true, 1, 1),
            (false, true, 4, 13),
            (true, false, 4, 7),
            (false, true, 8, 200),
            (true, false, 8, 101),
        ];

        let mut writer = MagSgnWriter::new();
        for &(negative, exponent_max, u, magnitude) in &samples {
            writer.write_sample(negative, exponent_max, u, magnitude);
        }
        let buf = writer.finish();

        let mut reader = MagSgnReader::new(&buf);
        for &(negative, exponent_max, u, magnitude) in &samples {
            let expected = if negative {
                -(magnitude as i32)
            } else {
                magnitude as i32
            };
            assert_eq!(reader.read_sample(exponent_max, u), expected);
        }
    }

    #[test]
    fn stuffing_discipline_holds() {
        // All-ones bodies provoke 0xFF bytes.
        let mut writer = MagSgnWriter::new();
        for _ in 0..8 {
            writer.write_sample(true, true, 8, 255);
        }
        let buf = writer.finish();

        for pair in buf.windows(2) {
            assert!(pair[0] != 0xff || pair[1] & 0x80 == 0);
        }
    }

    #[test]
    fn exhausted_reader_yields_zero() {
        let mut reader = MagSgnReader::new(&[]);
        assert_eq!(reader.read_sample(true, 5), 0);
    }
}
