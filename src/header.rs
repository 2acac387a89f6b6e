//! The validated header record the core consumes.
//!
//! Marker parsing happens outside the core; whatever parses SIZ, COD, COC,
//! QCD, QCC and CAP hands the result over as a [`Header`]. The core treats
//! it read-only and trusts [`Header::validate`] has been run.

use crate::error::{MalformedError, Result, bail};
use crate::tile::SubBandKind;

/// The order in which packets of a tile are emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProgressionOrder {
    #[default]
    LayerResolutionComponentPosition,
    ResolutionLayerComponentPosition,
    ResolutionPositionComponentLayer,
    PositionComponentResolutionLayer,
    ComponentPositionResolutionLayer,
}

/// The wavelet filter the (external) transform stage applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WaveletTransform {
    /// The reversible 5-3 filter. Bit-exact across platforms.
    #[default]
    Reversible53,
    /// The irreversible 9-7 filter.
    Irreversible97,
}

/// The code-block style flags from the COD/COC `SPcod` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CodeBlockStyle {
    /// Selectively bypass the arithmetic coder from the eleventh pass on.
    pub selective_bypass: bool,
    /// Reset the context probabilities after every coding pass.
    pub reset_contexts: bool,
    /// Terminate the codeword segment after every coding pass.
    pub terminate_each_pass: bool,
    /// Restrict context formation to the current stripe.
    pub vertically_causal: bool,
    /// Use the predictable-termination convention.
    pub predictable_termination: bool,
    /// Code a segmentation symbol after every cleanup pass.
    pub segmentation_symbols: bool,
    /// Code this block with the high-throughput engine.
    pub high_throughput: bool,
}

/// Coding parameters from a COD or COC marker segment.
#[derive(Clone, Debug)]
pub struct CodingStyle {
    pub progression_order: ProgressionOrder,
    /// Number of quality layers, at least 1.
    pub num_layers: u16,
    /// Number of wavelet decomposition levels; resolutions run
    /// `0..=num_decompositions`.
    pub num_decompositions: u8,
    /// Code-block width exponent offset: the nominal width is
    /// `1 << (code_block_width_exp + 2)`.
    pub code_block_width_exp: u8,
    /// Code-block height exponent offset, like the width.
    pub code_block_height_exp: u8,
    pub code_block_style: CodeBlockStyle,
    pub transformation: WaveletTransform,
    /// Precinct size exponents `(PPx, PPy)` per resolution. When shorter
    /// than the resolution count, the last entry (or the maximal size) is
    /// reused.
    pub precinct_exponents: Vec<(u8, u8)>,
    /// Frame each packet with a start-of-packet marker.
    pub use_sop: bool,
    /// Terminate each packet header with an end-of-packet-header marker.
    pub use_eph: bool,
}

impl Default for CodingStyle {
    fn default() -> Self {
        Self {
            progression_order: ProgressionOrder::default(),
            num_layers: 1,
            num_decompositions: 5,
            code_block_width_exp: 4,
            code_block_height_exp: 4,
            code_block_style: CodeBlockStyle::default(),
            transformation: WaveletTransform::default(),
            precinct_exponents: vec![],
            use_sop: false,
            use_eph: false,
        }
    }
}

impl CodingStyle {
    pub fn num_resolutions(&self) -> u8 {
        self.num_decompositions + 1
    }

    /// The nominal code-block width, `1 << (exp + 2)`.
    pub fn code_block_width(&self) -> u32 {
        1 << (self.code_block_width_exp + 2)
    }

    /// The nominal code-block height, `1 << (exp + 2)`.
    pub fn code_block_height(&self) -> u32 {
        1 << (self.code_block_height_exp + 2)
    }

    /// The precinct size exponents at a resolution. Without explicit
    /// precinct sizes, precincts are maximal (`2^15`).
    pub fn precinct_exponents(&self, resolution: u8) -> (u8, u8) {
        self.precinct_exponents
            .get(resolution as usize)
            .or_else(|| self.precinct_exponents.last())
            .copied()
            .unwrap_or((15, 15))
    }
}

/// The quantization style from the QCD/QCC `Sqcd` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QuantizationStyle {
    /// No quantization (reversible paths).
    #[default]
    None,
    /// One base step size, derived per sub-band.
    ScalarDerived,
    /// One explicit step size per sub-band.
    ScalarExpounded,
}

/// One sub-band quantization step size.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepSize {
    pub exponent: u8,
    pub mantissa: u16,
}

/// Quantization parameters from a QCD or QCC marker segment.
#[derive(Clone, Debug)]
pub struct Quantization {
    pub style: QuantizationStyle,
    pub guard_bits: u8,
    /// In declaration order: the lowest resolution's LL band, then
    /// `(HL, LH, HH)` per resolution from low to high.
    pub step_sizes: Vec<StepSize>,
}

impl Default for Quantization {
    fn default() -> Self {
        Self {
            style: QuantizationStyle::None,
            guard_bits: 2,
            step_sizes: vec![StepSize {
                exponent: 10,
                mantissa: 0,
            }],
        }
    }
}

impl Quantization {
    /// The step size of a band, resolving the derived style with E.3.
    pub fn step_size(&self, resolution: u8, band: SubBandKind, num_decompositions: u8) -> StepSize {
        let fallback = self.step_sizes.last().copied().unwrap_or_default();

        match self.style {
            QuantizationStyle::ScalarDerived => {
                let base = self.step_sizes.first().copied().unwrap_or(fallback);
                // Epsilon_b = epsilon_0 - N_L + n_b, see Equation E-3.
                let decomposition_level = if resolution == 0 {
                    num_decompositions
                } else {
                    num_decompositions - (resolution - 1)
                };
                let exponent = (base.exponent as i16 - num_decompositions as i16
                    + decomposition_level as i16)
                    .max(0) as u8;

                StepSize {
                    exponent,
                    mantissa: base.mantissa,
                }
            }
            QuantizationStyle::None | QuantizationStyle::ScalarExpounded => {
                let idx = if resolution == 0 {
                    0
                } else {
                    1 + 3 * (resolution as usize - 1) + band.quantization_offset()
                };

                self.step_sizes.get(idx).copied().unwrap_or(fallback)
            }
        }
    }

    /// The maximum number of magnitude bit-planes of a band, `Mb` from
    /// Equation E-2.
    pub fn num_bit_planes(&self, resolution: u8, band: SubBandKind, num_decompositions: u8) -> u8 {
        let exponent = self.step_size(resolution, band, num_decompositions).exponent;
        (self.guard_bits + exponent).saturating_sub(1)
    }
}

/// Size, depth and subsampling of one image component, with the optional
/// per-component coding and quantization overrides of COC/QCC.
#[derive(Clone, Debug)]
pub struct Component {
    /// Bit depth, 1..=38.
    pub precision: u8,
    pub is_signed: bool,
    /// Horizontal subsampling factor, at least 1.
    pub dx: u8,
    /// Vertical subsampling factor, at least 1.
    pub dy: u8,
    pub coding_style: Option<CodingStyle>,
    pub quantization: Option<Quantization>,
}

impl Component {
    pub fn new(precision: u8, is_signed: bool, dx: u8, dy: u8) -> Self {
        Self {
            precision,
            is_signed,
            dx,
            dy,
            coding_style: None,
            quantization: None,
        }
    }
}

/// The validated header record.
#[derive(Clone, Debug)]
pub struct Header {
    /// Reference grid width (`Xsiz`).
    pub width: u32,
    /// Reference grid height (`Ysiz`).
    pub height: u32,
    /// Image area offset (`XOsiz`, `YOsiz`).
    pub x_offset: u32,
    pub y_offset: u32,
    /// Nominal tile extent (`XTsiz`, `YTsiz`).
    pub tile_width: u32,
    pub tile_height: u32,
    /// Tile grid offset (`XTOsiz`, `YTOsiz`).
    pub tile_x_offset: u32,
    pub tile_y_offset: u32,
    pub components: Vec<Component>,
    /// The default coding style, overridable per component.
    pub coding_style: CodingStyle,
    /// The default quantization, overridable per component.
    pub quantization: Quantization,
    /// The HTJ2K capability bit from the CAP marker segment.
    pub ht_enabled: bool,
}

impl Header {
    /// Check the structural invariants the rest of the core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0
            || self.height == 0
            || self.tile_width == 0
            || self.tile_height == 0
            || self.x_offset >= self.width
            || self.y_offset >= self.height
            || self.tile_x_offset > self.x_offset
            || self.tile_y_offset > self.y_offset
        {
            bail!(MalformedError::InvalidDimensions);
        }

        if self.components.is_empty() || self.components.len() > 16384 {
            bail!(MalformedError::InvalidComponentCount);
        }

        for component in &self.components {
            if component.precision == 0 || component.precision > 38 {
                bail!(MalformedError::InvalidPrecision);
            }

            if component.dx == 0 || component.dy == 0 {
                bail!(MalformedError::InvalidSubsampling);
            }
        }

        for c in 0..self.components.len() {
            let style = self.coding_style(c);

            // Nominal side lengths must stay within 4..=64 and the area
            // within 4096 coefficients.
            if style.code_block_width_exp > 4
                || style.code_block_height_exp > 4
                || style.code_block_width_exp + style.code_block_height_exp > 8
            {
                bail!(MalformedError::InvalidCodeBlockSize);
            }

            if style.num_layers == 0 {
                bail!(MalformedError::InvalidDimensions);
            }

            if style.num_decompositions > 31 {
                bail!(MalformedError::InvalidDecompositionLevels);
            }

            for &(ppx, ppy) in &style.precinct_exponents {
                if ppx > 15 || ppy > 15 {
                    bail!(MalformedError::InvalidDimensions);
                }
            }
        }

        Ok(())
    }

    /// The coding style of a component, falling back to the header default.
    pub fn coding_style(&self, component: usize) -> &CodingStyle {
        self.components[component]
            .coding_style
            .as_ref()
            .unwrap_or(&self.coding_style)
    }

    /// The quantization of a component, falling back to the header default.
    pub fn quantization(&self, component: usize) -> &Quantization {
        self.components[component]
            .quantization
            .as_ref()
            .unwrap_or(&self.quantization)
    }

    /// Whether a component's code-blocks use the high-throughput engine.
    pub fn uses_ht(&self, component: usize) -> bool {
        self.ht_enabled || self.coding_style(component).code_block_style.high_throughput
    }

    pub fn num_x_tiles(&self) -> u32 {
        (self.width - self.tile_x_offset).div_ceil(self.tile_width)
    }

    pub fn num_y_tiles(&self) -> u32 {
        (self.height - self.tile_y_offset).div_ceil(self.tile_height)
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_x_tiles() * self.num_y_tiles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_header(width: u32, height: u32) -> Header {
        Header {
            width,
            height,
            x_offset: 0,
            y_offset: 0,
            tile_width: width,
            tile_height: height,
            tile_x_offset: 0,
            tile_y_offset: 0,
            components: vec![Component::new(8, false, 1, 1)],
            coding_style: CodingStyle::default(),
            quantization: Quantization::default(),
            ht_enabled: false,
        }
    }

    #[test]
    fn validation_accepts_simple_header() {
        simple_header(64, 64).validate().unwrap();
    }

    #[test]
    fn validation_rejects_degenerate_headers() {
        let mut header = simple_header(0, 64);
        assert!(header.validate().is_err());

        header = simple_header(64, 64);
        header.components.clear();
        assert!(header.validate().is_err());

        header = simple_header(64, 64);
        header.components[0].precision = 39;
        assert!(header.validate().is_err());

        header = simple_header(64, 64);
        header.components[0].dx = 0;
        assert!(header.validate().is_err());

        header = simple_header(64, 64);
        header.coding_style.code_block_width_exp = 5;
        assert!(header.validate().is_err());
    }

    #[test]
    fn component_overrides_win() {
        let mut header = simple_header(64, 64);
        header.components[0].coding_style = Some(CodingStyle {
            num_decompositions: 2,
            ..CodingStyle::default()
        });

        assert_eq!(header.coding_style(0).num_decompositions, 2);
        assert_eq!(header.coding_style.num_decompositions, 5);
    }

    #[test]
    fn derived_quantization_follows_resolution() {
        let quantization = Quantization {
            style: QuantizationStyle::ScalarDerived,
            guard_bits: 2,
            step_sizes: vec![StepSize {
                exponent: 10,
                mantissa: 0,
            }],
        };

        // The finest resolution keeps the base exponent, lower resolutions
        // keep it too through the level offset of E-3.
        let top = quantization.step_size(3, SubBandKind::HighHigh, 3);
        let low = quantization.step_size(0, SubBandKind::LowLow, 3);
        assert_eq!(top.exponent, 8);
        assert_eq!(low.exponent, 10);
    }

    #[test]
    fn tile_grid_counts() {
        let mut header = simple_header(100, 100);
        header.tile_width = 32;
        header.tile_height = 64;

        assert_eq!(header.num_x_tiles(), 4);
        assert_eq!(header.num_y_tiles(), 2);
        assert_eq!(header.num_tiles(), 8);
    }
}
