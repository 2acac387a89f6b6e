//! The adaptive MEL run coder of the high-throughput path.
//!
//! MEL codes the significance of quads whose neighborhood is entirely
//! insignificant. It is a run-length coder with thirteen states; the state
//! picks the exponent of the run it commits to, growing on completed runs
//! and shrinking on hits.

use crate::bitio::{BitReader, BitWriter};

/// The run-length exponent per state.
const MEL_E: [u32; 13] = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 4, 5];

#[derive(Debug, Default)]
pub(crate) struct MelEncoder {
    writer: BitWriter,
    state: usize,
    /// Zeros seen since the last emitted event.
    run: u32,
}

impl MelEncoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Encode one significance symbol.
    pub(crate) fn encode(&mut self, significant: bool) {
        if significant {
            // A hit: the pending partial run, then the one.
            self.writer.write_bit(1);
            self.writer.write(self.run, MEL_E[self.state] as u8);
            self.run = 0;
            self.state = self.state.saturating_sub(1);
        } else {
            self.run += 1;

            if self.run == 1 << MEL_E[self.state] {
                // A full run commits with a single zero bit.
                self.writer.write_bit(0);
                self.run = 0;
                self.state = usize::min(self.state + 1, 12);
            }
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.run > 0 {
            // Flush the partial run as a hit; the trailing one is never
            // consumed because the decoder stops at the last real symbol.
            self.writer.write_bit(1);
            self.writer.write(self.run, MEL_E[self.state] as u8);
        }

        self.writer.finish()
    }
}

pub(crate) struct MelDecoder<'a> {
    reader: BitReader<'a>,
    state: usize,
    pending_zeros: u32,
    pending_one: bool,
}

impl<'a> MelDecoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            state: 0,
            pending_zeros: 0,
            pending_one: false,
        }
    }

    /// Decode one significance symbol. An exhausted stream keeps yielding
    /// insignificance.
    pub(crate) fn decode(&mut self) -> bool {
        if self.pending_zeros == 0 && !self.pending_one {
            match self.reader.read(1) {
                Some(0) => {
                    self.pending_zeros = 1 << MEL_E[self.state];
                    self.state = usize::min(self.state + 1, 12);
                }
                Some(_) => {
                    self.pending_zeros = self.reader.read(MEL_E[self.state] as u8).unwrap_or(0);
                    self.pending_one = true;
                    self.state = self.state.saturating_sub(1);
                }
                None => return false,
            }
        }

        if self.pending_zeros > 0 {
            self.pending_zeros -= 1;
            false
        } else {
            self.pending_one = false;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(symbols: &[bool]) {
        let mut encoder = MelEncoder::new();
        for &symbol in symbols {
            encoder.encode(symbol);
        }
        let buf = encoder.finish();

        let mut decoder = MelDecoder::new(&buf);
        for (i, &symbol) in symbols.iter().enumerate() {
            assert_eq!(decoder.decode(), symbol, "symbol {i}");
        }
    }

    #[test]
    fn alternating_symbols() {
        let symbols: Vec<bool> = (0..64).map(|i| i % 2 == 0).collect();
        round_trip(&symbols);
    }

    #[test]
    fn long_zero_runs_grow_the_state() {
        // 200 zeros drive the state to longer and longer runs.
        let mut symbols = vec![false; 200];
        symbols.push(true);
        symbols.extend([false; 31]);
        round_trip(&symbols);
    }

    #[test]
    fn partial_run_at_the_end() {
        // Ends mid-run; the flush must still convey the trailing zeros.
        let symbols = [true, false, false, false];
        round_trip(&symbols);
    }

    #[test]
    fn all_significant() {
        round_trip(&[true; 40]);
    }

    #[test]
    fn empty_stream_yields_zeros() {
        let mut decoder = MelDecoder::new(&[]);
        for _ in 0..100 {
            assert!(!decoder.decode());
        }
    }
}
