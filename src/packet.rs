//! The packet codec: one packet carries the contributions of every
//! code-block of one precinct to one quality layer (B.9, B.10).
//!
//! A packet is a bit-stuffed header followed by the verbatim concatenation
//! of the included code-blocks' bytes, optionally framed by start-of-packet
//! and end-of-packet-header markers.

use crate::bitio::{StuffedBitReader, StuffedBitWriter};
use crate::error::{IoError, MalformedError, Result, bail, err};
use crate::header::CodingStyle;
use crate::progression::PacketPosition;
use crate::tile::{Band, CodeBlock, LayerContribution, Precinct};

/// Start-of-packet marker.
pub(crate) const SOP: [u8; 2] = [0xff, 0x91];
/// End-of-packet-header marker.
pub(crate) const EPH: [u8; 2] = [0xff, 0x92];

/// Encode the packet of `position` into `out`.
///
/// At layer zero the precinct's tag trees are rebuilt from the blocks'
/// first-inclusion layers and insignificant-MSB counts; later layers
/// continue the incremental coding.
pub(crate) fn encode_packet(
    out: &mut Vec<u8>,
    bands: &mut [Band],
    precinct: &mut Precinct,
    position: &PacketPosition,
    style: &CodingStyle,
) -> Result<()> {
    let layer = position.layer;

    if style.use_sop {
        out.extend_from_slice(&SOP);
        out.extend_from_slice(&[0x00, 0x04]);
        out.extend_from_slice(&layer.to_be_bytes());
    }

    if layer == 0 {
        seed_tag_trees(bands, precinct);
    }

    let mut writer = StuffedBitWriter::new();
    let mut body: Vec<(usize, u32, usize, usize)> = vec![];

    // B.10.3: the first bit denotes whether the packet is empty.
    let any_included = precinct.bands.iter().any(|pb| {
        pb.code_blocks.iter().any(|&cb| {
            contribution(&bands[pb.band_idx], cb, layer).num_passes > 0
        })
    });

    writer.write_bit(any_included as u32);

    if any_included {
        for pb_idx in 0..precinct.bands.len() {
            let pb = &mut precinct.bands[pb_idx];
            let band = &mut bands[pb.band_idx];

            for &cb_idx in &pb.code_blocks {
                let block = &mut band.code_blocks[cb_idx as usize];
                let added = contribution_of(block, layer);
                let included = added.num_passes > 0;

                // B.10.4: inclusion information, through the tag tree until
                // the block's first layer, one bit afterwards.
                let previously_included =
                    block.first_included_in_layer.is_some_and(|first| first < layer);

                if previously_included {
                    writer.write_bit(included as u32);
                } else {
                    let (x, y) = pb.local(block.x_idx, block.y_idx);
                    pb.inclusion_tree
                        .encode(&mut writer, x, y, layer as u32 + 1);
                }

                if !included {
                    continue;
                }

                // B.10.5: the missing bit-plane count rides along with the
                // first inclusion.
                if !previously_included {
                    let (x, y) = pb.local(block.x_idx, block.y_idx);
                    pb.imsb_tree.encode(&mut writer, x, y, u32::MAX);
                }

                encode_pass_count(&mut writer, added.num_passes)?;
                encode_length(&mut writer, block, added)?;

                let start: u32 = block
                    .layer_contributions
                    .iter()
                    .take(layer as usize)
                    .map(|c| c.num_bytes)
                    .sum();

                body.push((
                    pb.band_idx,
                    cb_idx,
                    start as usize,
                    added.num_bytes as usize,
                ));
            }
        }
    }

    out.extend_from_slice(&writer.finish());

    if style.use_eph {
        out.extend_from_slice(&EPH);
    }

    // The body follows the header verbatim, in header order.
    for (band_idx, cb_idx, start, len) in body {
        let block = &bands[band_idx].code_blocks[cb_idx as usize];
        out.extend_from_slice(&block.data[start..start + len]);
    }

    Ok(())
}

/// Decode the packet of `position` from the front of `data` into the
/// precinct's code-blocks. `band_bit_planes` holds `Mb` per band of the
/// resolution. Returns the number of bytes consumed.
pub(crate) fn decode_packet(
    data: &[u8],
    bands: &mut [Band],
    precinct: &mut Precinct,
    position: &PacketPosition,
    style: &CodingStyle,
    band_bit_planes: &[u8],
) -> Result<usize> {
    let layer = position.layer;
    let mut offset = 0;

    if style.use_sop && data.len() >= 2 && data[..2] == SOP {
        // SOP: `FF 91 00 04` and the packet's layer.
        if data.len() < 6 || data[2..4] != [0x00, 0x04] {
            bail!(MalformedError::InvalidSopMarker);
        }

        offset = 6;
    }

    if layer == 0 {
        for pb in &mut precinct.bands {
            pb.inclusion_tree.clear();
            pb.imsb_tree.clear();
        }
    }

    let mut reader = StuffedBitReader::new(&data[offset..]);
    let mut body: Vec<(usize, u32, u32)> = vec![];

    let empty = reader.read_bit().ok_or(IoError::UnexpectedEof)? == 0;

    if !empty {
        for pb_idx in 0..precinct.bands.len() {
            let pb = &mut precinct.bands[pb_idx];
            let band = &mut bands[pb.band_idx];

            for &cb_idx in &pb.code_blocks {
                let block = &mut band.code_blocks[cb_idx as usize];
                let previously_included = block.first_included_in_layer.is_some();

                let included = if previously_included {
                    reader.read_bit().ok_or(IoError::UnexpectedEof)? == 1
                } else {
                    let (x, y) = pb.local(block.x_idx, block.y_idx);
                    let first_layer = pb
                        .inclusion_tree
                        .decode(&mut reader, x, y, layer as u32 + 1)
                        .ok_or(IoError::UnexpectedEof)?;

                    first_layer <= layer as u32
                };

                if !included {
                    continue;
                }

                if !previously_included {
                    let (x, y) = pb.local(block.x_idx, block.y_idx);
                    let missing = pb
                        .imsb_tree
                        .decode(&mut reader, x, y, u32::MAX)
                        .ok_or(IoError::UnexpectedEof)?;

                    let mb = band_bit_planes[pb.band_idx];

                    if missing >= mb as u32 {
                        bail!(MalformedError::TagTreeValueTooLarge);
                    }

                    block.zero_bit_planes = missing as u8;
                    block.total_bit_planes = mb - block.zero_bit_planes;
                    block.first_included_in_layer = Some(layer);
                }

                let added_passes = decode_pass_count(&mut reader)?;
                let length = decode_length(&mut reader, block, added_passes)?;

                body.push((pb.band_idx, cb_idx, length));
                block.num_passes += added_passes;
            }
        }
    }

    reader.align().ok_or(IoError::UnexpectedEof)?;
    offset += reader.byte_pos();

    if style.use_eph {
        if data.len() < offset + 2 || data[offset..offset + 2] != EPH {
            bail!(MalformedError::MissingEphMarker);
        }

        offset += 2;
    }

    for (band_idx, cb_idx, length) in body {
        let length = length as usize;

        if data.len() < offset + length {
            bail!(MalformedError::PacketLengthOverflow);
        }

        let block = &mut bands[band_idx].code_blocks[cb_idx as usize];
        block.data.extend_from_slice(&data[offset..offset + length]);
        offset += length;
    }

    Ok(offset)
}

fn contribution(band: &Band, cb_idx: u32, layer: u16) -> LayerContribution {
    contribution_of(&band.code_blocks[cb_idx as usize], layer)
}

fn contribution_of(block: &CodeBlock, layer: u16) -> LayerContribution {
    block
        .layer_contributions
        .get(layer as usize)
        .copied()
        .unwrap_or_default()
}

/// Rebuild the precinct's tag trees for the first layer: the inclusion tree
/// holds each block's first contributing layer (unset leaves mean the block
/// never contributes), the other tree its missing bit-plane count.
fn seed_tag_trees(bands: &mut [Band], precinct: &mut Precinct) {
    for pb in &mut precinct.bands {
        pb.inclusion_tree.clear();
        pb.imsb_tree.clear();

        let band = &bands[pb.band_idx];

        for &cb_idx in &pb.code_blocks {
            let block = &band.code_blocks[cb_idx as usize];
            let (x, y) = pb.local(block.x_idx, block.y_idx);

            if let Some(first) = block.first_included_in_layer {
                pb.inclusion_tree.set_value(x, y, first as u32);
                pb.imsb_tree.set_value(x, y, block.zero_bit_planes as u32);
            }
        }
    }
}

/// Encode the number of coding passes per Table B.4.
fn encode_pass_count(writer: &mut StuffedBitWriter, count: u32) -> Result<()> {
    match count {
        1 => writer.write_bit(0),
        2 => writer.write(0b10, 2),
        3..=5 => {
            writer.write(0b11, 2);
            writer.write(count - 3, 2);
        }
        6..=36 => {
            writer.write(0b1111, 4);
            writer.write(count - 6, 5);
        }
        37..=164 => {
            writer.write(0x1ff, 9);
            writer.write(count - 37, 7);
        }
        _ => bail!(MalformedError::TooManyCodingPasses),
    }

    Ok(())
}

/// Decode the number of coding passes per Table B.4.
fn decode_pass_count(reader: &mut StuffedBitReader<'_>) -> Result<u32> {
    let mut read = |bits: u8| reader.read(bits).ok_or(IoError::UnexpectedEof);

    if read(1)? == 0 {
        return Ok(1);
    }

    if read(1)? == 0 {
        return Ok(2);
    }

    let two = read(2)?;
    if two != 0b11 {
        return Ok(3 + two);
    }

    let five = read(5)?;
    if five != 0b11111 {
        return Ok(6 + five);
    }

    Ok(37 + read(7)?)
}

/// Encode the byte count of a block's contribution (B.10.7.1): `k` one-bits
/// grow the block's `Lblock` state, then the length occupies
/// `Lblock + floor(log2(added passes))` bits.
fn encode_length(
    writer: &mut StuffedBitWriter,
    block: &mut CodeBlock,
    added: LayerContribution,
) -> Result<()> {
    let base_bits = added.num_passes.ilog2();
    let needed = 32 - added.num_bytes.leading_zeros();
    let grow = needed.saturating_sub(block.l_block + base_bits);

    block.l_block += grow;

    for _ in 0..grow {
        writer.write_bit(1);
    }
    writer.write_bit(0);

    let bits = block.l_block + base_bits;
    if bits > 32 {
        bail!(MalformedError::PacketLengthOverflow);
    }

    writer.write(added.num_bytes, bits as u8);
    Ok(())
}

/// Mirror of [`encode_length`].
fn decode_length(
    reader: &mut StuffedBitReader<'_>,
    block: &mut CodeBlock,
    added_passes: u32,
) -> Result<u32> {
    let mut grow = 0;

    while reader.read_bit().ok_or(IoError::UnexpectedEof)? == 1 {
        grow += 1;

        if block.l_block + grow > 32 {
            bail!(MalformedError::PacketLengthOverflow);
        }
    }

    block.l_block += grow;
    let bits = block.l_block + added_passes.ilog2();

    if bits > 32 {
        bail!(MalformedError::PacketLengthOverflow);
    }

    match reader.read(bits as u8) {
        Some(length) => Ok(length),
        None => err!(IoError::UnexpectedEof),
    }
}
