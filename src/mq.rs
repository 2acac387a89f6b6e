//! The MQ arithmetic coder, described in Annex C.
//!
//! The probability machine has 94 states: each of the 47 rows of Table C.2
//! exists once with MPS = 0 (even state) and once with MPS = 1 (odd state).
//! The row form below only serves initialization clarity; the hot paths index
//! the flat `QE`/`NMPS`/`NLPS` tables, which are expanded at compile time.

use crate::bitio::{StuffedBitReader, StuffedBitWriter};

/// Number of probability states.
const NUM_STATES: usize = 94;

/// One coding context: an index into the 94-state machine. The parity of the
/// state is the most probable symbol.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Context(u8);

impl Context {
    pub(crate) fn new(state: u8) -> Self {
        debug_assert!((state as usize) < NUM_STATES);
        Self(state)
    }

    #[inline(always)]
    fn mps(self) -> u32 {
        (self.0 & 1) as u32
    }
}

/// The named context slots shared by the bit-plane coder. The zero-coding
/// lookup table yields slots `0..=8` and the sign-coding table `9..=13`, so
/// only the remaining slots need names.
pub(crate) mod ctx {
    /// First magnitude-refinement context; `MAG0..=MAG2` are `14..=16`.
    pub(crate) const MAG0: usize = 14;
    /// The run-length context.
    pub(crate) const RL: usize = 17;
    /// The uniform context.
    pub(crate) const UNI: usize = 18;
    /// Total number of context slots.
    pub(crate) const COUNT: usize = 19;
}

/// A full set of coding contexts in their initial states: every context
/// starts in state 0, except the uniform context which starts in the
/// self-looping state 92.
#[derive(Clone, Debug)]
pub(crate) struct ContextSet {
    contexts: [Context; ctx::COUNT],
}

impl Default for ContextSet {
    fn default() -> Self {
        let mut set = Self {
            contexts: [Context::default(); ctx::COUNT],
        };
        set.reset();
        set
    }
}

impl ContextSet {
    pub(crate) fn reset(&mut self) {
        for context in &mut self.contexts {
            *context = Context::new(0);
        }

        self.contexts[ctx::UNI] = Context::new(92);
    }

    #[inline(always)]
    pub(crate) fn get(&mut self, label: usize) -> &mut Context {
        &mut self.contexts[label]
    }
}

#[derive(Debug, Clone, Copy)]
struct StateRow {
    qe: u32,
    nmps: u8,
    nlps: u8,
    switch: bool,
}

macro_rules! rows {
    ($($qe:expr, $nmps:expr, $nlps:expr, $switch:expr),+ $(,)?) => {
        [
            $(
                StateRow {
                    qe: $qe,
                    nmps: $nmps,
                    nlps: $nlps,
                    switch: $switch,
                }
            ),+
        ]
    };
}

/// QE values and associated data from Table C.2.
#[rustfmt::skip]
const STATE_ROWS: [StateRow; 47] = rows!(
    0x5601, 1, 1, true,
    0x3401, 2, 6, false,
    0x1801, 3, 9, false,
    0x0AC1, 4, 12, false,
    0x0521, 5, 29, false,
    0x0221, 38, 33, false,
    0x5601, 7, 6, true,
    0x5401, 8, 14, false,
    0x4801, 9, 14, false,
    0x3801, 10, 14, false,
    0x3001, 11, 17, false,
    0x2401, 12, 18, false,
    0x1C01, 13, 20, false,
    0x1601, 29, 21, false,
    0x5601, 15, 14, true,
    0x5401, 16, 14, false,
    0x5101, 17, 15, false,
    0x4801, 18, 16, false,
    0x3801, 19, 17, false,
    0x3401, 20, 18, false,
    0x3001, 21, 19, false,
    0x2801, 22, 19, false,
    0x2401, 23, 20, false,
    0x2201, 24, 21, false,
    0x1C01, 25, 22, false,
    0x1801, 26, 23, false,
    0x1601, 27, 24, false,
    0x1401, 28, 25, false,
    0x1201, 29, 26, false,
    0x1101, 30, 27, false,
    0x0AC1, 31, 28, false,
    0x09C1, 32, 29, false,
    0x08A1, 33, 30, false,
    0x0521, 34, 31, false,
    0x0441, 35, 32, false,
    0x02A1, 36, 33, false,
    0x0221, 37, 34, false,
    0x0141, 38, 35, false,
    0x0111, 39, 36, false,
    0x0085, 40, 37, false,
    0x0049, 41, 38, false,
    0x0025, 42, 39, false,
    0x0015, 43, 40, false,
    0x0009, 44, 41, false,
    0x0005, 45, 42, false,
    0x0001, 46, 43, false,
    0x5601, 46, 46, false,
);

const fn build_qe() -> [u32; NUM_STATES] {
    let mut table = [0; NUM_STATES];
    let mut s = 0;
    while s < NUM_STATES {
        table[s] = STATE_ROWS[s >> 1].qe;
        s += 1;
    }
    table
}

const fn build_nmps() -> [u8; NUM_STATES] {
    let mut table = [0; NUM_STATES];
    let mut s = 0;
    while s < NUM_STATES {
        // An MPS outcome never flips the most probable symbol.
        table[s] = (STATE_ROWS[s >> 1].nmps << 1) | (s as u8 & 1);
        s += 1;
    }
    table
}

const fn build_nlps() -> [u8; NUM_STATES] {
    let mut table = [0; NUM_STATES];
    let mut s = 0;
    while s < NUM_STATES {
        let row = &STATE_ROWS[s >> 1];
        let mps = s as u8 & 1;
        let next_mps = if row.switch { 1 - mps } else { mps };
        table[s] = (row.nlps << 1) | next_mps;
        s += 1;
    }
    table
}

static QE: [u32; NUM_STATES] = build_qe();
static NMPS: [u8; NUM_STATES] = build_nmps();
static NLPS: [u8; NUM_STATES] = build_nlps();

/// The MQ encoder (procedures from C.2).
///
/// The output buffer carries one reserved leading byte that absorbs carry
/// propagation; [`MqEncoder::flush`] strips it again.
#[derive(Debug)]
pub(crate) struct MqEncoder {
    /// The C-register, as illustrated in Table C.1.
    c: u32,
    /// The A-register, as illustrated in Table C.1.
    a: u32,
    /// The bit counter.
    ct: u32,
    buf: Vec<u8>,
}

impl Default for MqEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MqEncoder {
    pub(crate) fn new() -> Self {
        // The INITENC procedure from C.2.8, with the byte pointer parked on
        // the reserved leading zero byte.
        Self {
            c: 0,
            a: 0x8000,
            ct: 12,
            buf: vec![0],
        }
    }

    /// The number of whole bytes produced so far, not counting bits still
    /// pending in the registers. Used for coding-pass length accounting.
    pub(crate) fn bytes_written(&self) -> u32 {
        (self.buf.len() - 1) as u32
    }

    /// Encode one decision in the given context (the ENCODE procedure from
    /// C.2.5, with CODEMPS and CODELPS inlined).
    pub(crate) fn encode(&mut self, context: &mut Context, d: u32) {
        let s = context.0 as usize;
        let qe = QE[s];
        let mps = context.mps();

        self.a -= qe;

        if d == mps {
            if self.a & 0x8000 == 0 {
                // Conditional exchange: the LPS sub-interval became the
                // larger of the two.
                if self.a < qe {
                    self.a = qe;
                } else {
                    self.c += qe;
                }

                context.0 = NMPS[s];
                self.renorm();
            } else {
                self.c += qe;
            }
        } else {
            if self.a < qe {
                self.c += qe;
            } else {
                self.a = qe;
            }

            context.0 = NLPS[s];
            self.renorm();
        }
    }

    /// The RENORME procedure from C.2.6.
    fn renorm(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;

            if self.ct == 0 {
                self.byte_out();
            }

            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// The BYTEOUT procedure from C.2.7 (bit stuffing after `0xFF`, carry
    /// propagation into the previous byte otherwise).
    fn byte_out(&mut self) {
        let last_idx = self.buf.len() - 1;

        if self.buf[last_idx] == 0xff {
            self.buf.push((self.c >> 20) as u8);
            self.c &= 0xf_ffff;
            self.ct = 7;
        } else if self.c & 0x800_0000 != 0 {
            // Carry: propagate into the byte already written.
            self.buf[last_idx] += 1;

            if self.buf[last_idx] == 0xff {
                self.c &= 0x7ff_ffff;
                self.buf.push((self.c >> 20) as u8);
                self.c &= 0xf_ffff;
                self.ct = 7;
            } else {
                self.buf.push((self.c >> 19) as u8);
                self.c &= 0x7_ffff;
                self.ct = 8;
            }
        } else {
            self.buf.push((self.c >> 19) as u8);
            self.c &= 0x7_ffff;
            self.ct = 8;
        }
    }

    /// The FLUSH procedure from C.2.9. Returns the finished codeword
    /// segment, without the reserved leading byte and without a trailing
    /// `0xFF`.
    pub(crate) fn flush(mut self) -> Vec<u8> {
        // SETBITS: fill C with as many one bits as possible without
        // overrunning the interval.
        let limit = self.c + self.a;
        self.c |= 0xffff;

        if self.c >= limit {
            self.c -= 0x8000;
        }

        self.c <<= self.ct;
        self.byte_out();
        self.c <<= self.ct;
        self.byte_out();

        if self.buf.last() == Some(&0xff) {
            self.buf.pop();
        }

        self.buf.split_off(1)
    }
}

/// The MQ decoder (procedures from C.3).
///
/// We use the software-conventions version from Annex G of
/// <https://www.itu.int/rec/T-REC-T.88-201808-I>, in which the code register
/// holds the inverted stream bytes. A truncated stream behaves like one
/// terminated by a marker: reads past the end feed `0xFF` and the decoder
/// keeps producing decisions instead of failing.
pub(crate) struct MqDecoder<'a> {
    data: &'a [u8],
    /// The C-register, as illustrated in Table C.1.
    c: u32,
    /// The A-register, as illustrated in Table C.1.
    a: u32,
    /// The pointer to the current byte.
    bp: usize,
    /// The bit counter.
    ct: u32,
}

impl<'a> MqDecoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        let mut decoder = MqDecoder {
            data,
            c: 0,
            a: 0,
            bp: 0,
            ct: 0,
        };

        // The INITDEC procedure from C.3.5.
        decoder.c = ((decoder.b() as u32) ^ 0xff) << 16;
        decoder.byte_in();
        decoder.c <<= 7;
        decoder.ct -= 7;
        decoder.a = 0x8000;

        decoder
    }

    fn b(&self) -> u8 {
        self.data.get(self.bp).copied().unwrap_or(0xff)
    }

    fn b1(&self) -> u8 {
        self.data.get(self.bp + 1).copied().unwrap_or(0xff)
    }

    /// The BYTEIN procedure from C.3.4. On a marker (a byte above `0x8F`
    /// following `0xFF`) or at the end of the stream, the pointer does not
    /// advance and the register is fed one-bits.
    fn byte_in(&mut self) {
        if self.b() == 0xff {
            if self.b1() > 0x8f {
                self.ct = 8;
            } else {
                self.bp += 1;
                self.c = self.c + 0xfe00 - ((self.b() as u32) << 9);
                self.ct = 7;
            }
        } else {
            self.bp += 1;
            self.c = self.c + 0xff00 - ((self.b() as u32) << 8);
            self.ct = 8;
        }
    }

    /// The RENORMD procedure from C.3.3.
    fn renorm(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_in();
            }

            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;

            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// The DECODE procedure from C.3.2.
    pub(crate) fn decode(&mut self, context: &mut Context) -> u32 {
        let s = context.0 as usize;
        let qe = QE[s];
        let mps = context.mps();

        self.a -= qe;

        if (self.c >> 16) < self.a {
            if self.a & 0x8000 == 0 {
                // The MPS_EXCHANGE procedure from C.3.2.
                let d = if self.a < qe {
                    context.0 = NLPS[s];
                    1 - mps
                } else {
                    context.0 = NMPS[s];
                    mps
                };

                self.renorm();
                d
            } else {
                mps
            }
        } else {
            let mut c_high = self.c >> 16;
            let c_low = self.c & 0xffff;
            c_high -= self.a;
            self.c = (c_high << 16) | c_low;

            // The LPS_EXCHANGE procedure from C.3.2.
            let d = if self.a < qe {
                context.0 = NMPS[s];
                mps
            } else {
                context.0 = NLPS[s];
                1 - mps
            };

            self.a = qe;
            self.renorm();
            d
        }
    }
}

/// The raw (bypass) encoder, the probability-free peer of [`MqEncoder`]: a
/// plain bitstream with the same `0xFF`-delay stuffing convention as the MQ
/// byte stream. Lazy coding passes write their decisions here verbatim.
#[derive(Debug, Default)]
pub struct RawEncoder {
    writer: StuffedBitWriter,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decision.
    #[inline]
    pub fn encode(&mut self, bit: u32) {
        self.writer.write_bit(bit);
    }

    /// The number of whole bytes produced so far.
    pub fn bytes_written(&self) -> u32 {
        self.writer.byte_len() as u32
    }

    /// Terminate the segment and hand the bytes over.
    pub fn flush(self) -> Vec<u8> {
        self.writer.finish()
    }
}

/// The raw (bypass) decoder. An exhausted stream yields one-bits, mirroring
/// the MQ decoder's marker behavior on truncated input.
pub struct RawDecoder<'a> {
    reader: StuffedBitReader<'a>,
}

impl<'a> RawDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: StuffedBitReader::new(data),
        }
    }

    /// Read one decision.
    #[inline]
    pub fn decode(&mut self) -> u32 {
        self.reader.read_bit().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitio::BitWriter;

    // Adapted from the Serenity decoder, which in turn took the example from
    // https://www.itu.int/rec/T-REC-T.88-201808-I
    // H.2 Test sequence for arithmetic coder.
    #[test]
    fn decode_t88_sequence() {
        let input = [
            0x84, 0xC7, 0x3B, 0xFC, 0xE1, 0xA1, 0x43, 0x04, 0x02, 0x20, 0x00, 0x00, 0x41, 0x0D,
            0xBB, 0x86, 0xF4, 0x31, 0x7F, 0xFF, 0x88, 0xFF, 0x37, 0x47, 0x1A, 0xDB, 0x6A, 0xDF,
            0xFF, 0xAC,
        ];

        let expected_output = [
            0x00, 0x02, 0x00, 0x51, 0x00, 0x00, 0x00, 0xC0, 0x03, 0x52, 0x87, 0x2A, 0xAA, 0xAA,
            0xAA, 0xAA, 0x82, 0xC0, 0x20, 0x00, 0xFC, 0xD7, 0x9E, 0xF6, 0xBF, 0x7F, 0xED, 0x90,
            0x4F, 0x46, 0xA3, 0xBF,
        ];

        let mut decoder = MqDecoder::new(&input[..]);
        let mut context = Context::default();
        let mut writer = BitWriter::new();

        for _ in 0..expected_output.len() * 8 {
            writer.write_bit(decoder.decode(&mut context));
        }

        assert_eq!(writer.finish(), expected_output);
    }

    #[test]
    fn flat_tables_preserve_parity() {
        for s in 0..NUM_STATES {
            assert_eq!(NMPS[s] as usize & 1, s & 1);
        }

        // The uniform state self-loops.
        assert_eq!(NMPS[92], 92);
        assert_eq!(NLPS[92], 92);
        assert_eq!(QE[92], 0x5601);
    }

    #[test]
    fn single_context_round_trip() {
        let bits = [0, 0, 1, 0, 1, 1, 0, 1, 0, 0];

        let mut contexts = ContextSet::default();
        let mut encoder = MqEncoder::new();
        for &bit in &bits {
            encoder.encode(contexts.get(0), bit);
        }
        let encoded = encoder.flush();

        let mut contexts = ContextSet::default();
        let mut decoder = MqDecoder::new(&encoded);
        for &bit in &bits {
            assert_eq!(decoder.decode(contexts.get(0)), bit);
        }
    }

    #[test]
    fn multi_context_round_trip() {
        // 1000 decisions spread over ten context slots.
        let decisions: Vec<(usize, u32)> = (0..1000u32)
            .map(|i| ((i % 10) as usize, i % 2))
            .collect();

        let mut contexts = ContextSet::default();
        let mut encoder = MqEncoder::new();
        for &(label, bit) in &decisions {
            encoder.encode(contexts.get(label), bit);
        }
        let encoded = encoder.flush();

        let mut contexts = ContextSet::default();
        let mut decoder = MqDecoder::new(&encoded);
        for &(label, bit) in &decisions {
            assert_eq!(decoder.decode(contexts.get(label)), bit, "label {label}");
        }
    }

    #[test]
    fn skewed_sequence_round_trip() {
        // Long runs of the most probable symbol drive the state machine
        // deep into the low-probability rows.
        let mut bits = vec![0u32; 400];
        for i in (0..400).step_by(37) {
            bits[i] = 1;
        }

        let mut contexts = ContextSet::default();
        let mut encoder = MqEncoder::new();
        for &bit in &bits {
            encoder.encode(contexts.get(5), bit);
        }
        let encoded = encoder.flush();

        let mut contexts = ContextSet::default();
        let mut decoder = MqDecoder::new(&encoded);
        for &bit in &bits {
            assert_eq!(decoder.decode(contexts.get(5)), bit);
        }
    }

    #[test]
    fn empty_flush_is_short() {
        let encoder = MqEncoder::new();
        let encoded = encoder.flush();
        assert!(encoded.len() <= 2);
    }

    #[test]
    fn truncated_stream_keeps_decoding() {
        let mut contexts = ContextSet::default();
        let mut encoder = MqEncoder::new();
        for i in 0..64u32 {
            encoder.encode(contexts.get(0), i % 2);
        }
        let encoded = encoder.flush();

        // Decoding far past the encoded decisions must not panic.
        let mut contexts = ContextSet::default();
        let mut decoder = MqDecoder::new(&encoded[..encoded.len() / 2]);
        for _ in 0..1000 {
            let d = decoder.decode(contexts.get(0));
            assert!(d <= 1);
        }
    }

    #[test]
    fn raw_coder_round_trip() {
        let bits: Vec<u32> = (0..200).map(|i| ((i * 7) >> 2) & 1).collect();

        let mut encoder = RawEncoder::new();
        for &bit in &bits {
            encoder.encode(bit);
        }
        let encoded = encoder.flush();

        let mut decoder = RawDecoder::new(&encoded);
        for &bit in &bits {
            assert_eq!(decoder.decode(), bit);
        }
    }
}
