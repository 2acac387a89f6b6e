//! The high-throughput block coder: a cleanup-only codec that replaces the
//! three-pass arithmetic coding of a code-block with three interleaved
//! streams.
//!
//! The frame layout is `[MagSgn][MEL ‖ VLC][SCUP]`: MagSgn grows forward
//! from the start, MEL forward from the start of the suffix region, VLC
//! backward from its end. The final two bytes carry, in their low twelve
//! bits, the length of the MEL+VLC+SCUP region.
//!
//! Samples are coded per quad (2x2 block): quads with an entirely
//! insignificant neighborhood go through the MEL run coder, everything else
//! through the VLC tables. Each significant quad carries a `u` value (the
//! bit-plane count of its largest magnitude); each significant sample costs
//! one sign bit and `u - 1` magnitude-body bits in MagSgn, with a per-sample
//! exponent-max flag in VLC deciding whether the leading one is implicit.

mod magsgn;
mod mel;
mod vlc;

use smallvec::smallvec;

use crate::bitplane::{CodingPass, EncodedBlock, PassKind};
use crate::error::{MalformedError, Result, bail};
use crate::ht::magsgn::{MagSgnReader, MagSgnWriter};
use crate::ht::mel::{MelDecoder, MelEncoder};
use crate::ht::vlc::{VlcReader, VlcWriter, read_u_ext, write_u_ext};

/// One quad's worth of bookkeeping while a pair is in flight.
#[derive(Clone, Copy, Default)]
struct QuadInfo {
    rho: u8,
    u: u32,
    u_off: bool,
    /// Exponent-max flags per sample slot.
    emb: [bool; 4],
}

/// The high-throughput coding engine. Reusable across code-blocks via
/// [`HtBlockCoder::resize`], like its arithmetic sibling.
pub(crate) struct HtBlockCoder {
    width: usize,
    height: usize,
    /// Signed coefficients, row-major.
    coefficients: Vec<i32>,
    /// Significance pattern per quad, for context formation.
    quad_rho: Vec<u8>,
}

impl HtBlockCoder {
    pub(crate) fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            coefficients: Vec::with_capacity(64 * 64),
            quad_rho: Vec::with_capacity(32 * 32),
        }
    }

    pub(crate) fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;

        self.coefficients.clear();
        self.coefficients.resize(width * height, 0);

        self.quad_rho.clear();
        self.quad_rho
            .resize(width.div_ceil(2) * height.div_ceil(2), 0);
    }

    pub(crate) fn set_data(&mut self, coefficients: &[i32]) {
        debug_assert_eq!(coefficients.len(), self.width * self.height);
        self.coefficients.copy_from_slice(coefficients);
    }

    pub(crate) fn signed_coefficients(&self, out: &mut [i32]) {
        out.copy_from_slice(&self.coefficients);
    }

    fn quad_width(&self) -> usize {
        self.width.div_ceil(2)
    }

    fn quad_height(&self) -> usize {
        self.height.div_ceil(2)
    }

    /// The sample slots of quad `(qx, qy)` in raster order; `None` marks
    /// positions outside the block.
    fn quad_samples(&self, qx: usize, qy: usize) -> [Option<usize>; 4] {
        let mut slots = [None; 4];

        for (slot, (dx, dy)) in [(0, 0), (1, 0), (0, 1), (1, 1)].into_iter().enumerate() {
            let x = qx * 2 + dx;
            let y = qy * 2 + dy;

            if x < self.width && y < self.height {
                slots[slot] = Some(y * self.width + x);
            }
        }

        slots
    }

    /// The quad context from the neighborhood's significance. The initial
    /// row draws on the west quad's east column; later rows combine the
    /// west, north and north-east quads.
    fn context(&self, qx: usize, qy: usize) -> usize {
        let qw = self.quad_width();

        if qy == 0 {
            if qx == 0 {
                0
            } else {
                let west = self.quad_rho[qx - 1];
                (((west >> 1) & 1) | (((west >> 3) & 1) << 1)) as usize
            }
        } else {
            let mut ctx = 0;

            if qx > 0 && self.quad_rho[qy * qw + qx - 1] != 0 {
                ctx |= 1;
            }
            if self.quad_rho[(qy - 1) * qw + qx] != 0 {
                ctx |= 2;
            }
            if qx + 1 < qw && self.quad_rho[(qy - 1) * qw + qx + 1] != 0 {
                ctx |= 4;
            }

            ctx
        }
    }

    /// Encode the loaded coefficients into one cleanup segment. All-zero
    /// blocks produce no output bytes.
    pub(crate) fn encode(&mut self) -> Result<EncodedBlock> {
        let max_magnitude = self
            .coefficients
            .iter()
            .map(|c| c.unsigned_abs())
            .max()
            .unwrap_or(0);

        if max_magnitude == 0 {
            return Ok(EncodedBlock::default());
        }

        let total_planes = (32 - max_magnitude.leading_zeros()) as u8;

        self.quad_rho.iter_mut().for_each(|rho| *rho = 0);

        let mut magsgn = MagSgnWriter::new();
        let mut mel = MelEncoder::new();
        let mut vlc = VlcWriter::new();

        let (qw, qh) = (self.quad_width(), self.quad_height());

        for qy in 0..qh {
            for pair_x in (0..qw).step_by(2) {
                let pair: Vec<usize> = (pair_x..(pair_x + 2).min(qw)).collect();
                let mut infos = [QuadInfo::default(); 2];

                // Significance patterns and codewords.
                for (i, &qx) in pair.iter().enumerate() {
                    let slots = self.quad_samples(qx, qy);
                    let mut info = QuadInfo::default();

                    for (slot, idx) in slots.into_iter().enumerate() {
                        let Some(idx) = idx else { continue };
                        let magnitude = self.coefficients[idx].unsigned_abs();

                        if magnitude > 0 {
                            info.rho |= 1 << slot;
                            info.u = u32::max(info.u, 32 - magnitude.leading_zeros());
                        }
                    }

                    info.u_off = info.u > 1;

                    for (slot, idx) in slots.into_iter().enumerate() {
                        let Some(idx) = idx else { continue };
                        let magnitude = self.coefficients[idx].unsigned_abs();
                        info.emb[slot] =
                            magnitude > 0 && 32 - magnitude.leading_zeros() == info.u;
                    }

                    let ctx = self.context(qx, qy);

                    if ctx == 0 {
                        mel.encode(info.rho != 0);
                    }

                    if info.rho != 0 || ctx != 0 {
                        vlc.write_code(ctx, info.rho, info.u_off);
                    }

                    self.quad_rho[qy * qw + qx] = info.rho;
                    infos[i] = info;
                }

                // U values of the pair, then the exponent-max flags.
                for info in infos.iter().take(pair.len()) {
                    if info.u_off {
                        write_u_ext(&mut vlc, info.u - 2);
                    }
                }

                for info in infos.iter().take(pair.len()) {
                    if info.rho != 0 && info.u > 1 {
                        for slot in 0..4 {
                            if info.rho & (1 << slot) != 0 {
                                vlc.write_bit(info.emb[slot] as u32);
                            }
                        }
                    }
                }

                // Sign and magnitude bodies.
                for (i, &qx) in pair.iter().enumerate() {
                    let info = &infos[i];

                    if info.rho == 0 {
                        continue;
                    }

                    for (slot, idx) in self.quad_samples(qx, qy).into_iter().enumerate() {
                        let Some(idx) = idx else { continue };

                        if info.rho & (1 << slot) != 0 {
                            let value = self.coefficients[idx];
                            magsgn.write_sample(
                                value < 0,
                                info.emb[slot],
                                info.u,
                                value.unsigned_abs(),
                            );
                        }
                    }
                }
            }
        }

        let mut data = magsgn.finish();
        let mel_bytes = mel.finish();
        let vlc_bytes = vlc.finish();

        let scup = mel_bytes.len() + vlc_bytes.len() + 2;
        if scup > 0xfff {
            bail!(MalformedError::ScupOutOfRange);
        }

        data.extend_from_slice(&mel_bytes);
        data.extend_from_slice(&vlc_bytes);
        data.push((scup >> 8) as u8);
        data.push((scup & 0xff) as u8);

        Ok(EncodedBlock {
            passes: smallvec![CodingPass {
                kind: PassKind::Cleanup,
                len: data.len() as u32,
                cumulative_len: data.len() as u32,
                slope: None,
                terminated: true,
            }],
            data,
            total_planes,
        })
    }

    /// Decode one cleanup segment into the engine. Empty segments decode to
    /// an all-zero block.
    pub(crate) fn decode(&mut self, data: &[u8]) -> Result<()> {
        self.coefficients.iter_mut().for_each(|c| *c = 0);
        self.quad_rho.iter_mut().for_each(|rho| *rho = 0);

        if data.is_empty() {
            return Ok(());
        }

        if data.len() < 2 {
            bail!(MalformedError::ScupOutOfRange);
        }

        let scup = (((data[data.len() - 2] & 0x0f) as usize) << 8) | data[data.len() - 1] as usize;

        if scup < 2 || scup > data.len() {
            bail!(MalformedError::ScupOutOfRange);
        }

        let suffix_start = data.len() - scup;
        let mut magsgn = MagSgnReader::new(&data[..suffix_start]);
        let mut mel = MelDecoder::new(&data[suffix_start..data.len() - 2]);
        let mut vlc = VlcReader::new(&data[suffix_start..data.len() - 2]);

        let (qw, qh) = (self.quad_width(), self.quad_height());

        for qy in 0..qh {
            let initial = qy == 0;

            for pair_x in (0..qw).step_by(2) {
                let pair: Vec<usize> = (pair_x..(pair_x + 2).min(qw)).collect();
                let mut infos = [QuadInfo::default(); 2];

                for (i, &qx) in pair.iter().enumerate() {
                    let ctx = self.context(qx, qy);
                    let mut info = QuadInfo::default();

                    let coded = if ctx == 0 { mel.decode() } else { true };

                    if coded {
                        let Some((rho, u_off)) = vlc.read_code(initial, ctx) else {
                            bail!(MalformedError::InvalidHtCodeword);
                        };

                        info.rho = rho;
                        info.u_off = u_off && rho != 0;
                    }

                    self.quad_rho[qy * qw + qx] = info.rho;
                    infos[i] = info;
                }

                for info in infos.iter_mut().take(pair.len()) {
                    if info.u_off {
                        info.u = 2 + read_u_ext(&mut vlc);
                    } else if info.rho != 0 {
                        info.u = 1;
                    }
                }

                for info in infos.iter_mut().take(pair.len()) {
                    if info.rho != 0 && info.u > 1 {
                        for slot in 0..4 {
                            if info.rho & (1 << slot) != 0 {
                                info.emb[slot] = vlc.read_bit() == 1;
                            }
                        }
                    } else if info.rho != 0 {
                        // With a single bit-plane every significant sample
                        // tops out.
                        info.emb = [true; 4];
                    }
                }

                for (i, &qx) in pair.iter().enumerate() {
                    let info = &infos[i];

                    if info.rho == 0 {
                        continue;
                    }

                    for (slot, idx) in self.quad_samples(qx, qy).into_iter().enumerate() {
                        let Some(idx) = idx else { continue };

                        if info.rho & (1 << slot) != 0 {
                            self.coefficients[idx] = magsgn.read_sample(info.emb[slot], info.u);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
