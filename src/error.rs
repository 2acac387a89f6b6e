//! Error types for the coding core.

use core::fmt;

/// The main error type for encoding and decoding operations.
///
/// An error keeps its original [`ErrorKind`] while it travels up to the tile
/// boundary; the layers it passes through only attach context (the coding
/// stage and, where known, the code-block index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    stage: Option<&'static str>,
    code_block: Option<u32>,
}

/// The three failure classes of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The underlying byte source was exhausted or failed.
    Io(IoError),
    /// A structural invariant of the codestream was violated.
    Malformed(MalformedError),
    /// A capability the implementation does not realize.
    Unsupported(UnsupportedError),
}

/// Errors raised by the byte and bit readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// A byte was required but the stream was exhausted.
    UnexpectedEof,
}

/// Errors raised when a structural invariant does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedError {
    /// Image or tile dimensions are zero or inconsistent.
    InvalidDimensions,
    /// The component count is outside 1..=16384.
    InvalidComponentCount,
    /// A component precision is outside 1..=38.
    InvalidPrecision,
    /// A component subsampling factor is zero.
    InvalidSubsampling,
    /// A code-block exponent produces a side length outside 4..=64.
    InvalidCodeBlockSize,
    /// The decomposition level count exceeds the representable 31.
    InvalidDecompositionLevels,
    /// The requested tile index lies outside the tile grid.
    InvalidTileIndex,
    /// A tag-tree value exceeds the layer count it is bounded by.
    TagTreeValueTooLarge,
    /// The number of coding passes signalled for one layer exceeds 164.
    TooManyCodingPasses,
    /// The number of bit-planes of a code-block exceeds the representable 31.
    TooManyBitPlanes,
    /// A packet declared more body bytes than the stream holds.
    PacketLengthOverflow,
    /// The SCUP field of a high-throughput code-block is out of range.
    ScupOutOfRange,
    /// A high-throughput VLC peek matched no codeword.
    InvalidHtCodeword,
    /// A segmentation symbol decoded to something other than 1010.
    InvalidSegmentationSymbol,
    /// An expected start-of-packet marker was absent or inconsistent.
    InvalidSopMarker,
    /// An expected end-of-packet-header marker was absent.
    MissingEphMarker,
}

/// Capabilities the core recognizes but does not realize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedError {
    /// A capability bit beyond plain HT code-blocks was requested.
    Capability,
    /// A combination of coding passes the high-throughput engine cannot
    /// represent.
    HtPassCombination,
}

impl Error {
    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attach the name of the coding stage the error passed through.
    ///
    /// The innermost stage wins; later calls keep the existing context.
    pub(crate) fn stage(mut self, stage: &'static str) -> Self {
        self.stage.get_or_insert(stage);
        self
    }

    /// Attach the index of the code-block that failed.
    pub(crate) fn code_block(mut self, idx: u32) -> Self {
        self.code_block.get_or_insert(idx);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(stage) = self.stage {
            write!(f, "{stage}: ")?;
        }

        match &self.kind {
            ErrorKind::Io(e) => write!(f, "{e}")?,
            ErrorKind::Malformed(e) => write!(f, "{e}")?,
            ErrorKind::Unsupported(e) => write!(f, "{e}")?,
        }

        if let Some(idx) = self.code_block {
            write!(f, " (code-block {idx})")?;
        }

        Ok(())
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of data"),
        }
    }
}

impl fmt::Display for MalformedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions => write!(f, "invalid image or tile dimensions"),
            Self::InvalidComponentCount => write!(f, "invalid component count"),
            Self::InvalidPrecision => write!(f, "invalid component precision"),
            Self::InvalidSubsampling => write!(f, "invalid component subsampling"),
            Self::InvalidCodeBlockSize => write!(f, "invalid code-block size"),
            Self::InvalidDecompositionLevels => {
                write!(f, "invalid number of decomposition levels")
            }
            Self::InvalidTileIndex => write!(f, "tile index outside the tile grid"),
            Self::TagTreeValueTooLarge => write!(f, "tag-tree value exceeds its bound"),
            Self::TooManyCodingPasses => write!(f, "too many coding passes in one layer"),
            Self::TooManyBitPlanes => write!(f, "number of bit-planes is too large"),
            Self::PacketLengthOverflow => write!(f, "packet body exceeds the stream"),
            Self::ScupOutOfRange => write!(f, "HT segment length out of range"),
            Self::InvalidHtCodeword => write!(f, "invalid HT codeword"),
            Self::InvalidSegmentationSymbol => write!(f, "invalid segmentation symbol"),
            Self::InvalidSopMarker => write!(f, "invalid start-of-packet marker"),
            Self::MissingEphMarker => write!(f, "missing end-of-packet-header marker"),
        }
    }
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability => write!(f, "unsupported capability"),
            Self::HtPassCombination => {
                write!(f, "unsupported high-throughput pass combination")
            }
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for IoError {}
impl std::error::Error for MalformedError {}
impl std::error::Error for UnsupportedError {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            stage: None,
            code_block: None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        ErrorKind::Io(e).into()
    }
}

impl From<MalformedError> for Error {
    fn from(e: MalformedError) -> Self {
        ErrorKind::Malformed(e).into()
    }
}

impl From<UnsupportedError> for Error {
    fn from(e: UnsupportedError) -> Self {
        ErrorKind::Unsupported(e).into()
    }
}

/// Result type for coding operations.
pub type Result<T> = core::result::Result<T, Error>;

macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

macro_rules! err {
    ($err:expr) => {
        Err($err.into())
    };
}

pub(crate) use bail;
pub(crate) use err;
