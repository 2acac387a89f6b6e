/*!
The code-block, tile-geometry and packet coding core of a JPEG 2000 codec.

This crate implements the data path between decoded wavelet coefficients and
a compliant packet byte stream, in both directions:

- bit-level I/O with the two byte-stuffing disciplines of the codestream and
  the continuation-bit integer encoding of the pointer marker segments;
- the MQ arithmetic coder and the three-pass EBCOT bit-plane coder, plus the
  high-throughput (MagSgn/MEL/VLC) block coder as a peer engine;
- the tile / resolution / sub-band / precinct / code-block geometry with its
  subsampled bounds arithmetic;
- tag trees, packet headers and the five progression orders of Tier-2.

Marker parsing, the wavelet transform, file containers, color handling and
rate control live outside: the host hands in a validated [`Header`] and the
per-tile coefficient planes, and receives the packet stream (or, decoding,
the reconstructed coefficients ready for the inverse transform).

```
use jpeg2000_core::{Component, CodingStyle, Header, Quantization, Tile};

let header = Header {
    width: 64,
    height: 64,
    x_offset: 0,
    y_offset: 0,
    tile_width: 64,
    tile_height: 64,
    tile_x_offset: 0,
    tile_y_offset: 0,
    components: vec![Component::new(8, false, 1, 1)],
    coding_style: CodingStyle::default(),
    quantization: Quantization::default(),
    ht_enabled: false,
};
header.validate()?;

let mut tile = Tile::build(&header, 0)?;
// ... fill `tile.components[0].data` with wavelet coefficients ...
let stream = jpeg2000_core::encode_tile(&header, &mut tile)?;

let mut decoded = Tile::build(&header, 0)?;
jpeg2000_core::decode_tile(&header, &mut decoded, &stream)?;
assert_eq!(decoded.components[0].data, tile.components[0].data);
# Ok::<(), jpeg2000_core::Error>(())
```
*/

#![forbid(unsafe_code)]

pub mod bitio;
pub(crate) mod bitplane;
mod codec;
pub mod error;
mod header;
mod ht;
pub(crate) mod log;
mod mq;
mod packet;
pub mod progression;
pub(crate) mod rect;
mod tag_tree;
mod tile;

pub use bitplane::{CodingPass, PassKind};
pub use codec::{decode_tile, encode_tile};
pub use error::{Error, ErrorKind, IoError, MalformedError, Result, UnsupportedError};
pub use header::{
    CodeBlockStyle, CodingStyle, Component, Header, ProgressionOrder, Quantization,
    QuantizationStyle, StepSize, WaveletTransform,
};
pub use mq::{RawDecoder, RawEncoder};
pub use progression::{PacketIterator, PacketPosition};
pub use rect::IntRect;
pub use tile::{Band, CodeBlock, Precinct, PrecinctBand, Resolution, SubBandKind, Tile, TileComponent};
