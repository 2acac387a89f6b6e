//! The tile geometry tree: tile, tile-components, resolutions, sub-bands,
//! precincts and code-blocks, derived once per tile from the header.
//!
//! Ownership is strictly tree-shaped. Code-blocks are owned by their
//! sub-band; a precinct only names the blocks it covers by index, so the
//! packet codec resolves `(band index, code-block index)` pairs through the
//! owning resolution.

use crate::bitplane::CodingPass;
use crate::error::{MalformedError, Result, bail};
use crate::header::{Header, WaveletTransform};
use crate::rect::IntRect;
use crate::tag_tree::TagTree;

/// One of the four sub-band kinds of the wavelet pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubBandKind {
    LowLow,
    HighLow,
    LowHigh,
    HighHigh,
}

impl SubBandKind {
    /// The zero-coding table slice of this band kind. LL and LH share the
    /// horizontal-dominant rules, HL swaps the axes, HH ranks diagonals.
    pub(crate) fn zc_table(self) -> usize {
        match self {
            Self::LowLow => 0,
            Self::HighLow => 1,
            Self::LowHigh => 2,
            Self::HighHigh => 3,
        }
    }

    /// Position of this band within a resolution's quantization record.
    pub(crate) fn quantization_offset(self) -> usize {
        match self {
            Self::LowLow | Self::HighLow => 0,
            Self::LowHigh => 1,
            Self::HighHigh => 2,
        }
    }
}

/// The bytes and passes a code-block contributes to one quality layer.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct LayerContribution {
    pub(crate) num_passes: u32,
    pub(crate) num_bytes: u32,
}

/// The unit of entropy coding: a rectangular sub-area of one band.
#[derive(Clone, Debug)]
pub struct CodeBlock {
    pub rect: IntRect,
    /// Horizontal index in the band's code-block grid.
    pub x_idx: u32,
    /// Vertical index in the band's code-block grid.
    pub y_idx: u32,
    /// The compressed codeword segment. On the decode side, the layer
    /// contributions accumulate here in layer order.
    pub data: Vec<u8>,
    /// Coding-pass accounting produced by the encoder.
    pub passes: Vec<CodingPass>,
    /// Number of missing most-significant bit-planes, conveyed through the
    /// insignificant-MSB tag tree.
    pub zero_bit_planes: u8,
    /// Number of coded magnitude bit-planes.
    pub total_bit_planes: u8,
    /// The first quality layer this block contributed bytes to; `None`
    /// until the block appears in a packet.
    pub first_included_in_layer: Option<u16>,
    /// Decode-side count of coding passes accumulated across layers.
    pub num_passes: u32,
    /// The `Lblock` state variable of the packet length coding (B.10.7.1).
    pub(crate) l_block: u32,
    /// Encode-side split of `data` and `passes` over the quality layers.
    pub(crate) layer_contributions: Vec<LayerContribution>,
}

impl CodeBlock {
    fn new(rect: IntRect, x_idx: u32, y_idx: u32) -> Self {
        Self {
            rect,
            x_idx,
            y_idx,
            data: vec![],
            passes: vec![],
            zero_bit_planes: 0,
            total_bit_planes: 0,
            first_included_in_layer: None,
            num_passes: 0,
            l_block: 3,
            layer_contributions: vec![],
        }
    }
}

/// One sub-band of a resolution, owning the full code-block grid.
#[derive(Clone, Debug)]
pub struct Band {
    pub kind: SubBandKind,
    pub rect: IntRect,
    /// Code-block grid dimensions over the whole band.
    pub grid_width: u32,
    pub grid_height: u32,
    pub code_blocks: Vec<CodeBlock>,
}

/// The code-blocks of one band covered by one precinct, together with the
/// two tag trees their packet headers are coded with.
#[derive(Clone, Debug)]
pub struct PrecinctBand {
    /// Index into the owning resolution's band array.
    pub band_idx: usize,
    /// Indices into that band's `code_blocks`, in raster order.
    pub code_blocks: Vec<u32>,
    /// Grid origin of the covered blocks within the band grid.
    grid_x0: u32,
    grid_y0: u32,
    pub(crate) inclusion_tree: TagTree,
    pub(crate) imsb_tree: TagTree,
}

impl PrecinctBand {
    /// Map a band-grid position to this precinct's local tag-tree grid.
    pub(crate) fn local(&self, x_idx: u32, y_idx: u32) -> (u32, u32) {
        (x_idx - self.grid_x0, y_idx - self.grid_y0)
    }
}

/// A precinct: the grouping of code-blocks that shares one packet per layer.
#[derive(Clone, Debug)]
pub struct Precinct {
    pub rect: IntRect,
    pub bands: Vec<PrecinctBand>,
}

/// One level of the wavelet pyramid of a tile-component.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub resolution: u8,
    pub rect: IntRect,
    /// One band (LL) at resolution zero, three (HL, LH, HH) above.
    pub bands: Vec<Band>,
    /// Precincts in raster order.
    pub precincts: Vec<Precinct>,
}

/// One component of a tile, owning the coefficient plane.
#[derive(Clone, Debug)]
pub struct TileComponent {
    pub rect: IntRect,
    pub resolutions: Vec<Resolution>,
    /// Row-major signed coefficients, exchanged with the wavelet stage.
    pub data: Vec<i32>,
    /// The parallel floating-point plane the 9-7 wavelet path works on;
    /// empty for the reversible filter.
    pub real_data: Vec<f32>,
}

/// A single tile of the image.
#[derive(Clone, Debug)]
pub struct Tile {
    pub idx: u32,
    pub rect: IntRect,
    pub components: Vec<TileComponent>,
}

impl Tile {
    /// Derive the full geometry tree of tile `idx` from the header.
    pub fn build(header: &Header, idx: u32) -> Result<Tile> {
        if idx >= header.num_tiles() {
            bail!(MalformedError::InvalidTileIndex);
        }

        let rect = {
            let x_coord = idx % header.num_x_tiles();
            let y_coord = idx / header.num_x_tiles();

            // See B-7 through B-10.
            let x0 = u32::max(
                header.tile_x_offset + x_coord * header.tile_width,
                header.x_offset,
            );
            let y0 = u32::max(
                header.tile_y_offset + y_coord * header.tile_height,
                header.y_offset,
            );
            let x1 = u32::min(
                header.tile_x_offset + (x_coord + 1) * header.tile_width,
                header.width,
            );
            let y1 = u32::min(
                header.tile_y_offset + (y_coord + 1) * header.tile_height,
                header.height,
            );

            IntRect::from_ltrb(x0, y0, x1, y1)
        };

        let mut components = vec![];

        for (c, component) in header.components.iter().enumerate() {
            let style = header.coding_style(c);

            // Per-component bounds are the subsampled tile bounds, B-12.
            let comp_rect = IntRect::from_ltrb(
                rect.x0.div_ceil(component.dx as u32),
                rect.y0.div_ceil(component.dy as u32),
                rect.x1.div_ceil(component.dx as u32),
                rect.y1.div_ceil(component.dy as u32),
            );

            // The wavelet-domain geometry lives in component-local
            // coordinates: the resolution pyramid of the origin-anchored
            // extent tiles exactly into the Mallat layout of the
            // coefficient plane, so a band coordinate doubles as an index
            // into `data`.
            let local_rect = IntRect::from_xywh(0, 0, comp_rect.width(), comp_rect.height());

            let num_decompositions = style.num_decompositions;
            let mut resolutions = vec![];

            for r in 0..=num_decompositions {
                let res_rect = local_rect.ceil_shift((num_decompositions - r) as u32);
                resolutions.push(build_resolution(header, c, r, res_rect));
            }

            let real_data = if style.transformation == WaveletTransform::Irreversible97 {
                vec![0.0; comp_rect.area()]
            } else {
                vec![]
            };

            components.push(TileComponent {
                rect: comp_rect,
                resolutions,
                data: vec![0; comp_rect.area()],
                real_data,
            });
        }

        Ok(Tile {
            idx,
            rect,
            components,
        })
    }
}

fn build_resolution(header: &Header, component: usize, r: u8, rect: IntRect) -> Resolution {
    let style = header.coding_style(component);
    let (ppx, ppy) = style.precinct_exponents(r);

    // Code-blocks may not straddle precincts, so the nominal size is capped
    // by the precinct size.
    let cb_width = u32::min(style.code_block_width(), 1 << ppx);
    let cb_height = u32::min(style.code_block_height(), 1 << ppy);

    let band_rects: Vec<(SubBandKind, IntRect)> = if r == 0 {
        vec![(SubBandKind::LowLow, rect)]
    } else {
        // The three detail bands are the quadrants of this resolution's
        // bounds under an integer mid-point split; the top-left quadrant is
        // the area the next lower resolution reconstructs.
        let mx = (rect.x0 + rect.x1).div_ceil(2);
        let my = (rect.y0 + rect.y1).div_ceil(2);

        vec![
            (
                SubBandKind::HighLow,
                IntRect::from_ltrb(mx, rect.y0, rect.x1, my),
            ),
            (
                SubBandKind::LowHigh,
                IntRect::from_ltrb(rect.x0, my, mx, rect.y1),
            ),
            (
                SubBandKind::HighHigh,
                IntRect::from_ltrb(mx, my, rect.x1, rect.y1),
            ),
        ]
    };

    let bands: Vec<Band> = band_rects
        .into_iter()
        .map(|(kind, band_rect)| build_band(kind, band_rect, cb_width, cb_height))
        .collect();

    let precincts = build_precincts(&bands, rect, ppx, ppy);

    Resolution {
        resolution: r,
        rect,
        bands,
        precincts,
    }
}

fn build_band(kind: SubBandKind, rect: IntRect, cb_width: u32, cb_height: u32) -> Band {
    let (grid_width, grid_height) = if rect.is_empty() {
        (0, 0)
    } else {
        (
            rect.width().div_ceil(cb_width),
            rect.height().div_ceil(cb_height),
        )
    };

    let mut code_blocks = vec![];

    for y_idx in 0..grid_height {
        for x_idx in 0..grid_width {
            let block = IntRect::from_ltrb(
                rect.x0 + x_idx * cb_width,
                rect.y0 + y_idx * cb_height,
                u32::min(rect.x0 + (x_idx + 1) * cb_width, rect.x1),
                u32::min(rect.y0 + (y_idx + 1) * cb_height, rect.y1),
            );

            code_blocks.push(CodeBlock::new(block, x_idx, y_idx));
        }
    }

    Band {
        kind,
        rect,
        grid_width,
        grid_height,
        code_blocks,
    }
}

fn build_precincts(bands: &[Band], res_rect: IntRect, ppx: u8, ppy: u8) -> Vec<Precinct> {
    if res_rect.is_empty() {
        return vec![];
    }

    let ppx_pow2 = 1u32 << ppx;
    let ppy_pow2 = 1u32 << ppy;

    // See B-16.
    let x_start = (res_rect.x0 >> ppx) << ppx;
    let y_start = (res_rect.y0 >> ppy) << ppy;
    let num_x = res_rect.x1.div_ceil(ppx_pow2) - (res_rect.x0 >> ppx);
    let num_y = res_rect.y1.div_ceil(ppy_pow2) - (res_rect.y0 >> ppy);

    let mut precincts: Vec<Precinct> = (0..num_x * num_y)
        .map(|i| {
            let x0 = x_start + (i % num_x) * ppx_pow2;
            let y0 = y_start + (i / num_x) * ppy_pow2;

            Precinct {
                rect: IntRect::from_xywh(x0, y0, ppx_pow2, ppy_pow2),
                bands: vec![],
            }
        })
        .collect();

    // Hand every code-block to the precinct containing its top-left corner,
    // then size each precinct-band's tag trees by the covered grid span.
    for (band_idx, band) in bands.iter().enumerate() {
        let mut assignment: Vec<Vec<u32>> = vec![vec![]; precincts.len()];

        for (cb_idx, block) in band.code_blocks.iter().enumerate() {
            let px = (block.rect.x0 >> ppx) - (res_rect.x0 >> ppx);
            let py = (block.rect.y0 >> ppy) - (res_rect.y0 >> ppy);
            assignment[(py * num_x + px) as usize].push(cb_idx as u32);
        }

        for (precinct, cb_indices) in precincts.iter_mut().zip(assignment) {
            if cb_indices.is_empty() {
                continue;
            }

            let grid_x0 = cb_indices
                .iter()
                .map(|&i| band.code_blocks[i as usize].x_idx)
                .min()
                .unwrap_or(0);
            let grid_y0 = cb_indices
                .iter()
                .map(|&i| band.code_blocks[i as usize].y_idx)
                .min()
                .unwrap_or(0);
            let grid_x1 = cb_indices
                .iter()
                .map(|&i| band.code_blocks[i as usize].x_idx)
                .max()
                .unwrap_or(0);
            let grid_y1 = cb_indices
                .iter()
                .map(|&i| band.code_blocks[i as usize].y_idx)
                .max()
                .unwrap_or(0);

            let grid_width = grid_x1 - grid_x0 + 1;
            let grid_height = grid_y1 - grid_y0 + 1;

            precinct.bands.push(PrecinctBand {
                band_idx,
                code_blocks: cb_indices,
                grid_x0,
                grid_y0,
                inclusion_tree: TagTree::new(grid_width, grid_height),
                imsb_tree: TagTree::new(grid_width, grid_height),
            });
        }
    }

    precincts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CodingStyle, Component, Quantization};

    fn header_b4() -> Header {
        Header {
            width: 1432,
            height: 954,
            x_offset: 152,
            y_offset: 234,
            tile_width: 396,
            tile_height: 297,
            tile_x_offset: 0,
            tile_y_offset: 0,
            components: vec![Component::new(8, false, 1, 1), Component::new(8, false, 2, 2)],
            coding_style: CodingStyle::default(),
            quantization: Quantization::default(),
            ht_enabled: false,
        }
    }

    /// Test case for the example in B.4.
    #[test]
    fn tile_grid_example_b4() {
        let header = header_b4();

        assert_eq!(header.num_x_tiles(), 4);
        assert_eq!(header.num_y_tiles(), 4);
        assert_eq!(header.num_tiles(), 16);

        let tile_0_0 = Tile::build(&header, 0).unwrap();
        assert_eq!(tile_0_0.rect, IntRect::from_ltrb(152, 234, 396, 297));
        assert_eq!(tile_0_0.components[0].rect, IntRect::from_ltrb(152, 234, 396, 297));
        assert_eq!(tile_0_0.components[0].rect.width(), 244);
        assert_eq!(tile_0_0.components[0].rect.height(), 63);

        let tile_1_0 = Tile::build(&header, 1).unwrap();
        assert_eq!(tile_1_0.rect, IntRect::from_ltrb(396, 234, 792, 297));

        let tile_0_1 = Tile::build(&header, 4).unwrap();
        assert_eq!(tile_0_1.rect, IntRect::from_ltrb(152, 297, 396, 594));

        let tile_3_3 = Tile::build(&header, 15).unwrap();
        assert_eq!(tile_3_3.rect, IntRect::from_ltrb(1188, 891, 1432, 954));

        // The subsampled component halves every coordinate, rounding up.
        assert_eq!(tile_0_0.components[1].rect, IntRect::from_ltrb(76, 117, 198, 149));
        assert_eq!(tile_1_0.components[1].rect, IntRect::from_ltrb(198, 117, 396, 149));

        let tile_1_1 = Tile::build(&header, 5).unwrap();
        let tile_2_1 = Tile::build(&header, 6).unwrap();
        assert_eq!(
            tile_1_1.components[1].rect.width(),
            tile_2_1.components[1].rect.width()
        );
        assert_eq!(
            tile_1_1.components[1].rect.height(),
            tile_2_1.components[1].rect.height()
        );
    }

    #[test]
    fn invalid_tile_index_is_rejected() {
        let header = header_b4();
        assert!(Tile::build(&header, 16).is_err());
    }

    fn square_header(size: u32, decompositions: u8, cb_exp: u8) -> Header {
        Header {
            width: size,
            height: size,
            x_offset: 0,
            y_offset: 0,
            tile_width: size,
            tile_height: size,
            tile_x_offset: 0,
            tile_y_offset: 0,
            components: vec![Component::new(8, false, 1, 1)],
            coding_style: CodingStyle {
                num_decompositions: decompositions,
                code_block_width_exp: cb_exp,
                code_block_height_exp: cb_exp,
                ..CodingStyle::default()
            },
            quantization: Quantization::default(),
            ht_enabled: false,
        }
    }

    #[test]
    fn resolution_pyramid_bounds() {
        let header = square_header(64, 2, 2);
        let tile = Tile::build(&header, 0).unwrap();
        let resolutions = &tile.components[0].resolutions;

        assert_eq!(resolutions.len(), 3);
        assert_eq!(resolutions[0].rect, IntRect::from_ltrb(0, 0, 16, 16));
        assert_eq!(resolutions[1].rect, IntRect::from_ltrb(0, 0, 32, 32));
        assert_eq!(resolutions[2].rect, IntRect::from_ltrb(0, 0, 64, 64));

        assert_eq!(resolutions[0].bands.len(), 1);
        assert_eq!(resolutions[0].bands[0].kind, SubBandKind::LowLow);

        let detail = &resolutions[2].bands;
        assert_eq!(detail.len(), 3);
        assert_eq!(detail[0].kind, SubBandKind::HighLow);
        assert_eq!(detail[0].rect, IntRect::from_ltrb(32, 0, 64, 32));
        assert_eq!(detail[1].kind, SubBandKind::LowHigh);
        assert_eq!(detail[1].rect, IntRect::from_ltrb(0, 32, 32, 64));
        assert_eq!(detail[2].kind, SubBandKind::HighHigh);
        assert_eq!(detail[2].rect, IntRect::from_ltrb(32, 32, 64, 64));
    }

    #[test]
    fn code_block_grid_is_clipped() {
        // 16-sized code-blocks over a 20-wide band leave a 4-wide rim.
        let header = square_header(40, 1, 2);
        let tile = Tile::build(&header, 0).unwrap();
        let band = &tile.components[0].resolutions[1].bands[0];

        assert_eq!(band.rect, IntRect::from_ltrb(20, 0, 40, 20));
        assert_eq!(band.grid_width, 2);
        assert_eq!(band.grid_height, 2);

        assert_eq!(band.code_blocks[0].rect, IntRect::from_ltrb(20, 0, 36, 16));
        assert_eq!(band.code_blocks[1].rect, IntRect::from_ltrb(36, 0, 40, 16));
        assert_eq!(band.code_blocks[3].rect, IntRect::from_ltrb(36, 16, 40, 20));
    }

    #[test]
    fn every_code_block_is_covered_by_one_precinct() {
        let mut header = square_header(128, 2, 4);
        header.coding_style.precinct_exponents = vec![(6, 6); 3];

        let tile = Tile::build(&header, 0).unwrap();

        for resolution in &tile.components[0].resolutions {
            for (band_idx, band) in resolution.bands.iter().enumerate() {
                let mut covered = vec![0u32; band.code_blocks.len()];

                for precinct in &resolution.precincts {
                    for pb in precinct.bands.iter().filter(|pb| pb.band_idx == band_idx) {
                        for &cb in &pb.code_blocks {
                            covered[cb as usize] += 1;
                        }
                    }
                }

                assert!(covered.iter().all(|&c| c == 1));
            }
        }
    }

    #[test]
    fn maximal_precincts_cover_each_resolution_once() {
        let header = square_header(64, 2, 2);
        let tile = Tile::build(&header, 0).unwrap();

        for resolution in &tile.components[0].resolutions {
            assert_eq!(resolution.precincts.len(), 1);
        }
    }
}
