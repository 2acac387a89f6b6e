//! The tile coding pipeline: entropy coding of every code-block, then
//! packet sequencing — and the mirror image of that for decoding.
//!
//! The choice between the arithmetic three-pass coder and the
//! high-throughput coder is made once per component from the header flags
//! and carried as a sum type, not behind a trait object.

use crate::bitplane::{BlockCoder, EncodedBlock, MAX_BIT_PLANES};
use crate::error::{Error, MalformedError, Result, UnsupportedError, bail};
use crate::header::{CodeBlockStyle, Header};
use crate::ht::HtBlockCoder;
use crate::log::{ldebug, lwarn};
use crate::packet::{decode_packet, encode_packet};
use crate::progression::PacketIterator;
use crate::tile::{LayerContribution, SubBandKind, Tile, TileComponent};

/// The per-code-block entropy engine of one component.
enum EntropyEngine {
    Standard(BlockCoder),
    HighThroughput(HtBlockCoder),
}

impl EntropyEngine {
    fn for_component(header: &Header, component: usize) -> Self {
        if header.uses_ht(component) {
            Self::HighThroughput(HtBlockCoder::new())
        } else {
            Self::Standard(BlockCoder::new())
        }
    }

    fn resize(&mut self, width: usize, height: usize) {
        match self {
            Self::Standard(coder) => coder.resize(width, height),
            Self::HighThroughput(coder) => coder.resize(width, height),
        }
    }

    fn encode(
        &mut self,
        coefficients: &[i32],
        band: SubBandKind,
        style: &CodeBlockStyle,
    ) -> Result<EncodedBlock> {
        match self {
            Self::Standard(coder) => {
                coder.set_data(coefficients);
                Ok(coder.encode(band, style))
            }
            Self::HighThroughput(coder) => {
                coder.set_data(coefficients);
                coder.encode()
            }
        }
    }

    fn decode(
        &mut self,
        data: &[u8],
        band: SubBandKind,
        total_planes: u8,
        num_passes: u32,
        style: &CodeBlockStyle,
        out: &mut [i32],
    ) -> Result<()> {
        match self {
            Self::Standard(coder) => {
                coder.decode(data, band, total_planes, num_passes, style)?;
                coder.signed_coefficients(out);
            }
            Self::HighThroughput(coder) => {
                // The frame is self-describing; refinement segments beyond
                // the cleanup pass carry no separate byte ranges here and
                // are accepted without effect.
                coder.decode(data)?;
                coder.signed_coefficients(out);
            }
        }

        Ok(())
    }
}

/// Encode one tile: run the entropy coder over every code-block, then emit
/// every packet in the header's progression order.
///
/// The tile's per-component `data` planes are consumed as wavelet
/// coefficients in the Mallat layout the (external) forward transform
/// produces.
pub fn encode_tile(header: &Header, tile: &mut Tile) -> Result<Vec<u8>> {
    for (c, component) in tile.components.iter_mut().enumerate() {
        encode_component_blocks(header, c, component)?;
    }

    let mut iterator = PacketIterator::new(header, tile);
    let mut out = vec![];

    while let Some(position) = iterator.next() {
        let style = header.coding_style(position.component as usize);
        let component = &mut tile.components[position.component as usize];
        let resolution = &mut component.resolutions[position.resolution as usize];

        encode_packet(
            &mut out,
            &mut resolution.bands,
            &mut resolution.precincts[position.precinct as usize],
            &position,
            style,
        )
        .map_err(|e| e.stage("packet assembly"))?;
    }

    Ok(out)
}

/// Decode one tile from a packet byte stream: walk the packets in
/// progression order, then entropy-decode every code-block into the
/// components' coefficient planes.
pub fn decode_tile(header: &Header, tile: &mut Tile, data: &[u8]) -> Result<()> {
    let mut iterator = PacketIterator::new(header, tile);
    let mut offset = 0;

    while let Some(position) = iterator.next() {
        let c = position.component as usize;
        let style = header.coding_style(c);
        let quantization = header.quantization(c);
        let component = &mut tile.components[c];
        let resolution = &mut component.resolutions[position.resolution as usize];

        let band_bit_planes: Vec<u8> = resolution
            .bands
            .iter()
            .map(|band| {
                quantization.num_bit_planes(
                    resolution.resolution,
                    band.kind,
                    style.num_decompositions,
                )
            })
            .collect();

        offset += decode_packet(
            &data[offset..],
            &mut resolution.bands,
            &mut resolution.precincts[position.precinct as usize],
            &position,
            style,
            &band_bit_planes,
        )
        .map_err(|e| e.stage("packet parsing"))?;
    }

    ldebug!("parsed {} packets for tile {}", iterator.num_packets(), tile.idx);

    if offset != data.len() {
        lwarn!(
            "tile stream has {} unread bytes after the last packet",
            data.len() - offset
        );
    }

    for (c, component) in tile.components.iter_mut().enumerate() {
        decode_component_blocks(header, c, component)?;
    }

    Ok(())
}

fn encode_component_blocks(
    header: &Header,
    c: usize,
    component: &mut TileComponent,
) -> Result<()> {
    let style = header.coding_style(c);
    let quantization = header.quantization(c);

    if style.code_block_style.selective_bypass || style.code_block_style.terminate_each_pass {
        // Multiple codeword segments per block are not realized.
        bail!(UnsupportedError::Capability);
    }

    let mut engine = EntropyEngine::for_component(header, c);
    let mut scratch: Vec<i32> = vec![];

    let num_layers = style.num_layers as usize;
    let comp_width = component.rect.width() as usize;
    let TileComponent {
        resolutions, data, ..
    } = component;

    for resolution in resolutions.iter_mut() {
        for band in resolution.bands.iter_mut() {
            let mb = quantization.num_bit_planes(
                resolution.resolution,
                band.kind,
                style.num_decompositions,
            );

            for (cb_idx, block) in band.code_blocks.iter_mut().enumerate() {
                let (width, height) = (block.rect.width() as usize, block.rect.height() as usize);

                if width == 0 || height == 0 {
                    continue;
                }

                scratch.clear();
                scratch.extend((0..height).flat_map(|y| {
                    let row = (block.rect.y0 as usize + y) * comp_width + block.rect.x0 as usize;
                    data[row..row + width].iter().copied()
                }));

                engine.resize(width, height);
                let encoded = engine
                    .encode(&scratch, band.kind, &style.code_block_style)
                    .map_err(|e| e.stage("entropy coding").code_block(cb_idx as u32))?;

                if encoded.total_planes > mb || encoded.total_planes > MAX_BIT_PLANES {
                    return Err(Error::from(MalformedError::TooManyBitPlanes)
                        .stage("entropy coding")
                        .code_block(cb_idx as u32));
                }

                block.total_bit_planes = encoded.total_planes;
                block.zero_bit_planes = mb - encoded.total_planes;
                block.num_passes = encoded.passes.len() as u32;
                block.first_included_in_layer = if encoded.passes.is_empty() {
                    None
                } else {
                    Some(0)
                };

                // Everything lands in the first quality layer; later layers
                // only exist as empty increments. A rate allocator would
                // split the pass list at pass boundaries instead.
                let mut contributions = vec![LayerContribution::default(); num_layers];
                if !encoded.passes.is_empty() {
                    contributions[0] = LayerContribution {
                        num_passes: encoded.passes.len() as u32,
                        num_bytes: encoded.data.len() as u32,
                    };
                }

                block.layer_contributions = contributions;
                block.passes = encoded.passes.into_vec();
                block.data = encoded.data;
            }
        }
    }

    Ok(())
}

fn decode_component_blocks(
    header: &Header,
    c: usize,
    component: &mut TileComponent,
) -> Result<()> {
    let style = header.coding_style(c);

    if style.code_block_style.selective_bypass || style.code_block_style.terminate_each_pass {
        bail!(UnsupportedError::Capability);
    }

    let mut engine = EntropyEngine::for_component(header, c);
    let mut scratch: Vec<i32> = vec![];

    let comp_width = component.rect.width() as usize;
    let TileComponent {
        resolutions, data, ..
    } = component;

    data.iter_mut().for_each(|value| *value = 0);

    for resolution in resolutions.iter_mut() {
        for band in resolution.bands.iter_mut() {
            for (cb_idx, block) in band.code_blocks.iter_mut().enumerate() {
                let (width, height) = (block.rect.width() as usize, block.rect.height() as usize);

                if width == 0 || height == 0 || block.num_passes == 0 || block.data.is_empty() {
                    continue;
                }

                scratch.clear();
                scratch.resize(width * height, 0);

                engine.resize(width, height);
                engine
                    .decode(
                        &block.data,
                        band.kind,
                        block.total_bit_planes,
                        block.num_passes,
                        &style.code_block_style,
                        &mut scratch,
                    )
                    .map_err(|e| e.stage("entropy decoding").code_block(cb_idx as u32))?;

                for y in 0..height {
                    let row = (block.rect.y0 as usize + y) * comp_width + block.rect.x0 as usize;
                    data[row..row + width].copy_from_slice(&scratch[y * width..(y + 1) * width]);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CodingStyle, Component, Quantization};

    fn basic_header(size: u32, decompositions: u8) -> Header {
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
                code_block_width_exp: 2,
                code_block_height_exp: 2,
                ..CodingStyle::default()
            },
            quantization: Quantization::default(),
            ht_enabled: false,
        }
    }

    fn ramp(area: usize) -> Vec<i32> {
        (0..area)
            .map(|i| {
                let v = (i as i32 * 7) % 250;
                if i % 3 == 0 { -v } else { v }
            })
            .collect()
    }

    #[test]
    fn tile_round_trip() {
        let header = basic_header(32, 2);
        header.validate().unwrap();

        let mut tile = Tile::build(&header, 0).unwrap();
        let coefficients = ramp(tile.components[0].data.len());
        tile.components[0].data.copy_from_slice(&coefficients);

        let stream = encode_tile(&header, &mut tile).unwrap();

        let mut decoded = Tile::build(&header, 0).unwrap();
        decode_tile(&header, &mut decoded, &stream).unwrap();

        assert_eq!(decoded.components[0].data, coefficients);
    }

    #[test]
    fn ht_tile_round_trip() {
        let mut header = basic_header(32, 1);
        header.ht_enabled = true;

        let mut tile = Tile::build(&header, 0).unwrap();
        let coefficients = ramp(tile.components[0].data.len());
        tile.components[0].data.copy_from_slice(&coefficients);

        let stream = encode_tile(&header, &mut tile).unwrap();

        let mut decoded = Tile::build(&header, 0).unwrap();
        decode_tile(&header, &mut decoded, &stream).unwrap();

        assert_eq!(decoded.components[0].data, coefficients);
    }

    #[test]
    fn all_zero_tile_round_trip() {
        let header = basic_header(16, 1);
        let mut tile = Tile::build(&header, 0).unwrap();

        let stream = encode_tile(&header, &mut tile).unwrap();

        // Every packet is empty: one presence bit each.
        let mut decoded = Tile::build(&header, 0).unwrap();
        decode_tile(&header, &mut decoded, &stream).unwrap();

        assert!(decoded.components[0].data.iter().all(|&v| v == 0));
    }

    #[test]
    fn unsupported_style_is_rejected() {
        let mut header = basic_header(16, 1);
        header.coding_style.code_block_style.selective_bypass = true;

        let mut tile = Tile::build(&header, 0).unwrap();
        assert!(encode_tile(&header, &mut tile).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let header = basic_header(32, 1);
        let mut tile = Tile::build(&header, 0).unwrap();
        let coefficients = ramp(tile.components[0].data.len());
        tile.components[0].data.copy_from_slice(&coefficients);

        let stream = encode_tile(&header, &mut tile).unwrap();

        let mut decoded = Tile::build(&header, 0).unwrap();
        assert!(decode_tile(&header, &mut decoded, &stream[..stream.len() / 2]).is_err());
    }
}
