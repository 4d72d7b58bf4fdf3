//! Format parsers for the dimuse sequencer.
//!
//! Turns big-endian `MAP ` block lists, `iMUS` container headers, VOC chunk
//! headers and WAV files into the structured types of `dm-ir`.

mod cue_map;
mod imus;
mod voc;
mod wav_format;

pub use cue_map::{encode_map, parse_map, MAX_MAP_BYTES};
pub use imus::{build_imus, probe_header, ImusHeader, Probe, IMUS_PREFIX_LEN};
pub use voc::{parse_voc_block, VocBlock, VocHeader, VOC_MAGIC};
pub use wav_format::{load_wav, pcm_to_wav, write_wav, DecodedSound};

use thiserror::Error;

/// Error type for format parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Invalid file header or magic bytes
    #[error("invalid header")]
    InvalidHeader,
    /// Unexpected end of data
    #[error("unexpected end of data")]
    UnexpectedEof,
    /// Unsupported format version or encoding
    #[error("unsupported format")]
    UnsupportedVersion,
    /// A cue-map block with an unknown tag
    #[error("unknown map block {0:?}")]
    UnknownBlock([u8; 4]),
    /// Block sizes do not add up to the declared map size
    #[error("map declares {declared} bytes but blocks span {walked}")]
    MapSizeMismatch { declared: usize, walked: usize },
    /// Map larger than the fixed parse buffer
    #[error("map of {0} bytes exceeds the parse buffer")]
    MapTooLarge(usize),
    /// A `FRMT` block the mixer cannot play
    #[error("unsupported audio format: {word_size} bits, {channels} channels")]
    UnsupportedFormat { word_size: u32, channels: u32 },
    /// Marker text longer than the marker bound
    #[error("marker text of {0} bytes is too long")]
    MarkerTooLong(usize),
    /// Any other structural problem reported by the reader
    #[error("malformed data: {0}")]
    Malformed(String),
}

impl From<binrw::Error> for FormatError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                FormatError::UnexpectedEof
            }
            other => FormatError::Malformed(other.to_string()),
        }
    }
}
