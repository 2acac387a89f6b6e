//! Bit-plane coding of code-blocks, described in Annex D.
//!
//! Each code-block is coded in three passes per bit-plane (significance
//! propagation, magnitude refinement, cleanup) over a flag grid that carries
//! a one-coefficient border, so the neighborhood reads in the hot loop never
//! branch on block edges. The zero-coding and sign-coding context decisions
//! are precomputed into lookup tables at compile time.
//!
//! Some of the references are taken from the
//! "JPEG2000 Standard for Image Compression" book instead of the
//! specification.

use smallvec::SmallVec;

use crate::error::{MalformedError, Result, bail};
use crate::header::CodeBlockStyle;
use crate::mq::{ContextSet, MqDecoder, MqEncoder, ctx};
use crate::tile::SubBandKind;

/// The maximum nominal code-block side length.
pub(crate) const MAX_BLOCK_SIZE: usize = 64;

/// We only allow 31 bit-planes because we need one bit for the sign.
pub(crate) const MAX_BIT_PLANES: u8 = 31;

// Flag bits for one coefficient. The four cache bits mirror the significance
// of the cardinal neighbors so that the common part of the zero-coding mask
// is one shift away.
const SIG: u8 = 1 << 0;
const VISIT: u8 = 1 << 1;
const REFINE: u8 = 1 << 2;
const SIGN_NEG: u8 = 1 << 3;
const SIG_W: u8 = 1 << 4;
const SIG_E: u8 = 1 << 5;
const SIG_N: u8 = 1 << 6;
const SIG_S: u8 = 1 << 7;

// Bit positions inside the packed zero-coding neighborhood mask.
const MASK_W: usize = 1 << 0;
const MASK_E: usize = 1 << 1;
const MASK_N: usize = 1 << 2;
const MASK_S: usize = 1 << 3;
const MASK_NW: usize = 1 << 4;
const MASK_NE: usize = 1 << 5;
const MASK_SW: usize = 1 << 6;
const MASK_SE: usize = 1 << 7;

/// Zero-coding context per (band kind, packed neighborhood mask), following
/// Table D.1. LL and LH share the horizontal-dominant rules, HL swaps the
/// horizontal and vertical counts, and HH ranks by the diagonal sum.
static ZC_LUT: [u8; 4 * 256] = build_zc_lut();

/// Sign-coding context per (horizontal, vertical) sign contribution in
/// `[-2, 2]`, following Table D.2.
static SC_CTX_LUT: [u8; 25] = build_sc_luts().0;
/// The predicted sign bit companion of [`SC_CTX_LUT`].
static SC_PRED_LUT: [u8; 25] = build_sc_luts().1;

const fn build_zc_lut() -> [u8; 4 * 256] {
    let mut table = [0u8; 4 * 256];
    let mut mask = 0usize;

    while mask < 256 {
        let h = ((mask & MASK_W) != 0) as u8 + ((mask & MASK_E) != 0) as u8;
        let v = ((mask & MASK_N) != 0) as u8 + ((mask & MASK_S) != 0) as u8;
        let d = ((mask & MASK_NW) != 0) as u8
            + ((mask & MASK_NE) != 0) as u8
            + ((mask & MASK_SW) != 0) as u8
            + ((mask & MASK_SE) != 0) as u8;

        table[mask] = zc_context_hv(h, v, d);
        table[256 + mask] = zc_context_hv(v, h, d);
        table[2 * 256 + mask] = zc_context_hv(h, v, d);
        table[3 * 256 + mask] = zc_context_hh(h + v, d);

        mask += 1;
    }

    table
}

const fn zc_context_hv(h: u8, v: u8, d: u8) -> u8 {
    if h == 2 {
        8
    } else if h == 1 && v >= 1 {
        7
    } else if h == 1 && d >= 1 {
        6
    } else if h == 1 {
        5
    } else if v == 2 {
        4
    } else if v == 1 {
        3
    } else if d >= 2 {
        2
    } else if d == 1 {
        1
    } else {
        0
    }
}

const fn zc_context_hh(hv: u8, d: u8) -> u8 {
    if d >= 3 {
        8
    } else if d == 2 {
        if hv >= 1 { 7 } else { 6 }
    } else if d == 1 {
        if hv >= 2 {
            5
        } else if hv == 1 {
            4
        } else {
            3
        }
    } else if hv >= 2 {
        2
    } else if hv == 1 {
        1
    } else {
        0
    }
}

const fn build_sc_luts() -> ([u8; 25], [u8; 25]) {
    let mut contexts = [0u8; 25];
    let mut predictions = [0u8; 25];
    let mut i = 0usize;

    while i < 25 {
        let h = clamp_unit(i as i32 / 5 - 2);
        let v = clamp_unit(i as i32 % 5 - 2);

        let (context, prediction) = match (h, v) {
            (1, 1) => (13, 0),
            (1, 0) => (12, 0),
            (1, -1) => (11, 0),
            (0, 1) => (10, 0),
            (0, 0) => (9, 0),
            (0, -1) => (10, 1),
            (-1, 1) => (11, 1),
            (-1, 0) => (12, 1),
            _ => (13, 1),
        };

        contexts[i] = context;
        predictions[i] = prediction;
        i += 1;
    }

    (contexts, predictions)
}

const fn clamp_unit(x: i32) -> i32 {
    if x > 1 {
        1
    } else if x < -1 {
        -1
    } else {
        x
    }
}

/// The kind of a coding pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    SignificancePropagation,
    MagnitudeRefinement,
    Cleanup,
}

impl PassKind {
    fn of(pass_idx: u32) -> Self {
        match pass_idx % 3 {
            0 => Self::SignificancePropagation,
            1 => Self::MagnitudeRefinement,
            _ => Self::Cleanup,
        }
    }
}

/// One coding pass produced by the encoder.
#[derive(Clone, Copy, Debug)]
pub struct CodingPass {
    pub kind: PassKind,
    /// The number of bytes this pass contributed.
    pub len: u32,
    /// The number of bytes of all passes up to and including this one.
    pub cumulative_len: u32,
    /// A convexity measure used by rate allocators; the coder itself never
    /// fills it in.
    pub slope: Option<u16>,
    /// Whether the codeword segment terminates after this pass.
    pub terminated: bool,
}

/// The output of encoding one code-block.
#[derive(Clone, Debug, Default)]
pub(crate) struct EncodedBlock {
    pub(crate) data: Vec<u8>,
    pub(crate) passes: SmallVec<[CodingPass; 16]>,
    /// The index of the most significant non-zero bit-plane plus one.
    pub(crate) total_planes: u8,
}

/// The bit-plane coding engine.
///
/// One engine serves arbitrarily many code-blocks: [`BlockCoder::resize`]
/// adapts it to the next block without giving up the backing storage, which
/// is allocated for the maximum 64×64 geometry up front.
pub(crate) struct BlockCoder {
    width: usize,
    height: usize,
    /// Absolute coefficient magnitudes, row-major.
    data: Vec<u32>,
    /// One flag byte per coefficient, with a one-coefficient border.
    flags: Vec<u8>,
    contexts: ContextSet,
    vertically_causal: bool,
}

impl BlockCoder {
    pub(crate) fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::with_capacity(MAX_BLOCK_SIZE * MAX_BLOCK_SIZE),
            flags: Vec::with_capacity((MAX_BLOCK_SIZE + 2) * (MAX_BLOCK_SIZE + 2)),
            contexts: ContextSet::default(),
            vertically_causal: false,
        }
    }

    /// Adapt the engine to a (possibly smaller) block. Keeps the backing
    /// storage.
    pub(crate) fn resize(&mut self, width: usize, height: usize) {
        debug_assert!(width <= MAX_BLOCK_SIZE && height <= MAX_BLOCK_SIZE);

        self.width = width;
        self.height = height;

        self.data.clear();
        self.data.resize(width * height, 0);

        self.flags.clear();
        self.flags.resize((width + 2) * (height + 2), 0);
    }

    /// Load signed coefficients; magnitudes go into the data array and signs
    /// into the flag grid.
    pub(crate) fn set_data(&mut self, coefficients: &[i32]) {
        debug_assert_eq!(coefficients.len(), self.width * self.height);

        for y in 0..self.height {
            for x in 0..self.width {
                let value = coefficients[y * self.width + x];
                self.data[y * self.width + x] = value.unsigned_abs();

                if value < 0 {
                    let idx = self.flag_idx(x, y);
                    self.flags[idx] |= SIGN_NEG;
                }
            }
        }
    }

    /// Write the decoded signed coefficients into `out` (row-major, same
    /// extent as the block).
    pub(crate) fn signed_coefficients(&self, out: &mut [i32]) {
        debug_assert_eq!(out.len(), self.width * self.height);

        for y in 0..self.height {
            for x in 0..self.width {
                let magnitude = self.data[y * self.width + x] as i32;
                out[y * self.width + x] = if self.flags[self.flag_idx(x, y)] & SIGN_NEG != 0 {
                    -magnitude
                } else {
                    magnitude
                };
            }
        }
    }

    #[inline(always)]
    fn stride(&self) -> usize {
        self.width + 2
    }

    #[inline(always)]
    fn flag_idx(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.stride() + (x + 1)
    }

    /// The packed zero-coding neighborhood mask of `(x, y)`: the cardinal
    /// bits come from the cache in the coefficient's own flags, the diagonal
    /// bits from the neighbors themselves. In vertically causal mode the
    /// stripe below contributes nothing.
    #[inline(always)]
    fn neighbor_mask(&self, x: usize, y: usize) -> usize {
        let idx = self.flag_idx(x, y);
        let stride = self.stride();

        let mut mask = (self.flags[idx] >> 4) as usize;
        mask |= (((self.flags[idx - stride - 1] & SIG) != 0) as usize) << 4;
        mask |= (((self.flags[idx - stride + 1] & SIG) != 0) as usize) << 5;
        mask |= (((self.flags[idx + stride - 1] & SIG) != 0) as usize) << 6;
        mask |= (((self.flags[idx + stride + 1] & SIG) != 0) as usize) << 7;

        if self.vertically_causal && y % 4 == 3 {
            mask &= !(MASK_S | MASK_SW | MASK_SE);
        }

        mask
    }

    #[inline(always)]
    fn zc_context(&self, band: SubBandKind, x: usize, y: usize) -> usize {
        ZC_LUT[band.zc_table() * 256 + self.neighbor_mask(x, y)] as usize
    }

    /// The sign-coding context and predicted sign of `(x, y)` (Table D.2).
    #[inline(always)]
    fn sc_context(&self, x: usize, y: usize) -> (usize, u32) {
        let idx = self.flag_idx(x, y);
        let stride = self.stride();

        let contribution = |flags: u8| -> i32 {
            if flags & SIG == 0 {
                0
            } else if flags & SIGN_NEG != 0 {
                -1
            } else {
                1
            }
        };

        let h = contribution(self.flags[idx - 1]) + contribution(self.flags[idx + 1]);
        let mut v = contribution(self.flags[idx - stride]);

        if !(self.vertically_causal && y % 4 == 3) {
            v += contribution(self.flags[idx + stride]);
        }

        let lut_idx = ((h + 2) * 5 + (v + 2)) as usize;
        (SC_CTX_LUT[lut_idx] as usize, SC_PRED_LUT[lut_idx] as u32)
    }

    #[inline(always)]
    fn mr_context(&self, x: usize, y: usize) -> usize {
        if self.flags[self.flag_idx(x, y)] & REFINE != 0 {
            ctx::MAG0 + 2
        } else if self.neighbor_mask(x, y) != 0 {
            ctx::MAG0 + 1
        } else {
            ctx::MAG0
        }
    }

    /// Mark `(x, y)` significant and refresh the cardinal caches of its four
    /// neighbors. Border cells absorb the updates of edge coefficients.
    fn set_significant(&mut self, x: usize, y: usize, negative: bool) {
        let idx = self.flag_idx(x, y);
        let stride = self.stride();

        self.flags[idx] |= SIG;
        if negative {
            self.flags[idx] |= SIGN_NEG;
        }

        self.flags[idx - 1] |= SIG_E;
        self.flags[idx + 1] |= SIG_W;
        self.flags[idx - stride] |= SIG_S;
        self.flags[idx + stride] |= SIG_N;
    }

    fn clear_visits(&mut self) {
        for flag in &mut self.flags {
            *flag &= !VISIT;
        }
    }

    /// Whether the four-row stripe column starting at `(x, y0)` qualifies
    /// for run-length mode: fully inside the block, entirely insignificant
    /// and unvisited, with empty neighborhoods.
    fn run_length_candidate(&self, x: usize, y0: usize) -> bool {
        if y0 % 4 != 0 || self.height - y0 < 4 {
            return false;
        }

        (0..4).all(|dy| {
            let flags = self.flags[self.flag_idx(x, y0 + dy)];
            flags & (SIG | VISIT) == 0 && self.neighbor_mask(x, y0 + dy) == 0
        })
    }

    // Encoding.

    /// Encode the loaded coefficients and return the codeword segment with
    /// its coding-pass accounting. A block whose coefficients are all zero
    /// produces no output bytes.
    pub(crate) fn encode(&mut self, band: SubBandKind, style: &CodeBlockStyle) -> EncodedBlock {
        let max_magnitude = self.data.iter().copied().max().unwrap_or(0);

        if max_magnitude == 0 {
            return EncodedBlock::default();
        }

        let total_planes = (32 - max_magnitude.leading_zeros()) as u8;
        self.vertically_causal = style.vertically_causal;
        self.contexts.reset();

        let mut encoder = MqEncoder::new();
        let mut passes: SmallVec<[CodingPass; 16]> = SmallVec::new();
        let mut pass_idx = 0u32;

        for plane in (0..total_planes).rev() {
            for _ in 0..3 {
                let kind = PassKind::of(pass_idx);

                match kind {
                    PassKind::SignificancePropagation => {
                        self.encode_significance_pass(&mut encoder, band, plane);
                    }
                    PassKind::MagnitudeRefinement => {
                        self.encode_refinement_pass(&mut encoder, plane);
                    }
                    PassKind::Cleanup => {
                        self.encode_cleanup_pass(&mut encoder, band, plane);

                        if style.segmentation_symbols {
                            for bit in [1, 0, 1, 0] {
                                encoder.encode(self.contexts.get(ctx::UNI), bit);
                            }
                        }

                        self.clear_visits();
                    }
                }

                if style.reset_contexts {
                    self.contexts.reset();
                }

                let cumulative_len = encoder.bytes_written();
                let len = cumulative_len - passes.last().map(|p| p.cumulative_len).unwrap_or(0);
                passes.push(CodingPass {
                    kind,
                    len,
                    cumulative_len,
                    slope: None,
                    terminated: false,
                });
                pass_idx += 1;
            }
        }

        let data = encoder.flush();

        // The flush drains the pending register bits into the final pass.
        if let Some(last) = passes.last_mut() {
            let total = data.len() as u32;
            last.len += total - last.cumulative_len;
            last.cumulative_len = total;
            last.terminated = true;
        }

        EncodedBlock {
            data,
            passes,
            total_planes,
        }
    }

    fn encode_significance_pass(&mut self, encoder: &mut MqEncoder, band: SubBandKind, plane: u8) {
        self.for_each_position(|coder, x, y| {
            let idx = coder.flag_idx(x, y);

            if coder.flags[idx] & SIG != 0 {
                return;
            }

            let mask = coder.neighbor_mask(x, y);
            if mask == 0 {
                return;
            }

            let bit = (coder.data[y * coder.width + x] >> plane) & 1;
            let zc = ZC_LUT[band.zc_table() * 256 + mask] as usize;
            encoder.encode(coder.contexts.get(zc), bit);

            if bit == 1 {
                let negative = coder.flags[idx] & SIGN_NEG != 0;
                let (sc, prediction) = coder.sc_context(x, y);
                encoder.encode(coder.contexts.get(sc), negative as u32 ^ prediction);
                coder.set_significant(x, y, negative);
            }

            let idx = coder.flag_idx(x, y);
            coder.flags[idx] |= VISIT;
        });
    }

    fn encode_refinement_pass(&mut self, encoder: &mut MqEncoder, plane: u8) {
        self.for_each_position(|coder, x, y| {
            let idx = coder.flag_idx(x, y);

            if coder.flags[idx] & SIG == 0 || coder.flags[idx] & VISIT != 0 {
                return;
            }

            let bit = (coder.data[y * coder.width + x] >> plane) & 1;
            let mr = coder.mr_context(x, y);
            encoder.encode(coder.contexts.get(mr), bit);
            coder.flags[idx] |= REFINE;
        });
    }

    fn encode_cleanup_pass(&mut self, encoder: &mut MqEncoder, band: SubBandKind, plane: u8) {
        let width = self.width;
        let height = self.height;

        for y0 in (0..height).step_by(4) {
            for x in 0..width {
                let mut y = y0;

                if self.run_length_candidate(x, y0) {
                    let first_non_zero = (0..4)
                        .find(|dy| (self.data[(y0 + dy) * width + x] >> plane) & 1 == 1);

                    let Some(run) = first_non_zero else {
                        // The whole stripe column stays insignificant.
                        encoder.encode(self.contexts.get(ctx::RL), 0);
                        continue;
                    };

                    encoder.encode(self.contexts.get(ctx::RL), 1);
                    encoder.encode(self.contexts.get(ctx::UNI), (run as u32 >> 1) & 1);
                    encoder.encode(self.contexts.get(ctx::UNI), run as u32 & 1);

                    // The first non-zero coefficient's significance is
                    // implied; only its sign is coded.
                    y = y0 + run;
                    let negative = self.flags[self.flag_idx(x, y)] & SIGN_NEG != 0;
                    let (sc, prediction) = self.sc_context(x, y);
                    encoder.encode(self.contexts.get(sc), negative as u32 ^ prediction);
                    self.set_significant(x, y, negative);
                    y += 1;
                }

                while y < (y0 + 4).min(height) {
                    let idx = self.flag_idx(x, y);

                    if self.flags[idx] & (SIG | VISIT) == 0 {
                        let bit = (self.data[y * width + x] >> plane) & 1;
                        let zc = self.zc_context(band, x, y);
                        encoder.encode(self.contexts.get(zc), bit);

                        if bit == 1 {
                            let negative = self.flags[idx] & SIGN_NEG != 0;
                            let (sc, prediction) = self.sc_context(x, y);
                            encoder.encode(self.contexts.get(sc), negative as u32 ^ prediction);
                            self.set_significant(x, y, negative);
                        }
                    }

                    y += 1;
                }
            }
        }
    }

    // Decoding.

    /// Decode a codeword segment into the engine. `total_planes` counts down
    /// from the most significant non-zero plane; `num_passes` bounds the
    /// decoding so that streams truncated at a pass boundary decode to the
    /// planes they actually carry.
    pub(crate) fn decode(
        &mut self,
        data: &[u8],
        band: SubBandKind,
        total_planes: u8,
        num_passes: u32,
        style: &CodeBlockStyle,
    ) -> Result<()> {
        if total_planes > MAX_BIT_PLANES {
            bail!(MalformedError::TooManyBitPlanes);
        }

        // An empty segment decodes to an all-zero block without invoking the
        // arithmetic decoder.
        if data.is_empty() || total_planes == 0 || num_passes == 0 {
            return Ok(());
        }

        self.vertically_causal = style.vertically_causal;
        self.contexts.reset();

        let mut decoder = MqDecoder::new(data);

        for pass_idx in 0..num_passes {
            let Some(plane) = (total_planes as u32)
                .checked_sub(1 + pass_idx / 3)
                .map(|p| p as u8)
            else {
                break;
            };

            match PassKind::of(pass_idx) {
                PassKind::SignificancePropagation => {
                    self.decode_significance_pass(&mut decoder, band, plane);
                }
                PassKind::MagnitudeRefinement => {
                    self.decode_refinement_pass(&mut decoder, plane);
                }
                PassKind::Cleanup => {
                    self.decode_cleanup_pass(&mut decoder, band, plane);

                    if style.segmentation_symbols {
                        let mut symbol = 0;
                        for _ in 0..4 {
                            symbol = (symbol << 1) | decoder.decode(self.contexts.get(ctx::UNI));
                        }

                        if symbol != 0b1010 {
                            bail!(MalformedError::InvalidSegmentationSymbol);
                        }
                    }

                    self.clear_visits();
                }
            }

            if style.reset_contexts {
                self.contexts.reset();
            }
        }

        Ok(())
    }

    fn decode_significance_pass(&mut self, decoder: &mut MqDecoder<'_>, band: SubBandKind, plane: u8) {
        self.for_each_position(|coder, x, y| {
            let idx = coder.flag_idx(x, y);

            if coder.flags[idx] & SIG != 0 {
                return;
            }

            let mask = coder.neighbor_mask(x, y);
            if mask == 0 {
                return;
            }

            let zc = ZC_LUT[band.zc_table() * 256 + mask] as usize;
            let bit = decoder.decode(coder.contexts.get(zc));

            if bit == 1 {
                coder.data[y * coder.width + x] |= 1 << plane;
                let (sc, prediction) = coder.sc_context(x, y);
                let sign = decoder.decode(coder.contexts.get(sc)) ^ prediction;
                coder.set_significant(x, y, sign == 1);
            }

            let idx = coder.flag_idx(x, y);
            coder.flags[idx] |= VISIT;
        });
    }

    fn decode_refinement_pass(&mut self, decoder: &mut MqDecoder<'_>, plane: u8) {
        self.for_each_position(|coder, x, y| {
            let idx = coder.flag_idx(x, y);

            if coder.flags[idx] & SIG == 0 || coder.flags[idx] & VISIT != 0 {
                return;
            }

            let mr = coder.mr_context(x, y);
            let bit = decoder.decode(coder.contexts.get(mr));
            coder.data[y * coder.width + x] |= bit << plane;
            coder.flags[idx] |= REFINE;
        });
    }

    fn decode_cleanup_pass(&mut self, decoder: &mut MqDecoder<'_>, band: SubBandKind, plane: u8) {
        let width = self.width;
        let height = self.height;

        for y0 in (0..height).step_by(4) {
            for x in 0..width {
                let mut y = y0;

                if self.run_length_candidate(x, y0) {
                    if decoder.decode(self.contexts.get(ctx::RL)) == 0 {
                        // All four coefficients in the stripe column remain
                        // insignificant.
                        continue;
                    }

                    let mut run = decoder.decode(self.contexts.get(ctx::UNI));
                    run = (run << 1) | decoder.decode(self.contexts.get(ctx::UNI));

                    y = y0 + run as usize;
                    self.data[y * width + x] |= 1 << plane;
                    let (sc, prediction) = self.sc_context(x, y);
                    let sign = decoder.decode(self.contexts.get(sc)) ^ prediction;
                    self.set_significant(x, y, sign == 1);
                    y += 1;
                }

                while y < (y0 + 4).min(height) {
                    let idx = self.flag_idx(x, y);

                    if self.flags[idx] & (SIG | VISIT) == 0 {
                        let zc = self.zc_context(band, x, y);
                        let bit = decoder.decode(self.contexts.get(zc));

                        if bit == 1 {
                            self.data[y * width + x] |= 1 << plane;
                            let (sc, prediction) = self.sc_context(x, y);
                            let sign = decoder.decode(self.contexts.get(sc)) ^ prediction;
                            self.set_significant(x, y, sign == 1);
                        }
                    }

                    y += 1;
                }
            }
        }
    }

    /// Visit every coefficient in stripe order: four-row stripes, column by
    /// column within each stripe (D.3).
    fn for_each_position(&mut self, mut action: impl FnMut(&mut Self, usize, usize)) {
        for y0 in (0..self.height).step_by(4) {
            for x in 0..self.width {
                for y in y0..(y0 + 4).min(self.height) {
                    action(self, x, y);
                }
            }
        }
    }
}
