//! Creative VOC chunk headers.
//!
//! VOC files interleave block headers with their sample data, so the
//! engine navigates them inline while streaming rather than through a
//! separate cue map. This module only decodes single headers.

use binrw::io::Cursor;
use binrw::{binread, BinRead};
use dm_ir::AudioFormat;

use crate::FormatError;

pub const VOC_MAGIC: &[u8; 20] = b"Creative Voice File\x1a";

#[binread]
#[br(little, magic = b"Creative Voice File\x1a")]
struct VocFileHeader {
    header_size: u16,
    version: u16,
    #[allow(dead_code)]
    checksum: u16,
}

#[binread]
#[br(little)]
struct ExtendedSound {
    rate: u32,
    bits: u8,
    channels: u8,
    codec: u16,
    #[allow(dead_code)]
    reserved: u32,
}

/// The fixed VOC file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VocHeader {
    /// Offset of the first block.
    pub data_start: u32,
    pub version: u16,
}

impl VocHeader {
    pub const LEN: usize = 26;

    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let hdr = VocFileHeader::read(&mut Cursor::new(bytes))
            .map_err(|_| FormatError::InvalidHeader)?;
        if (hdr.header_size as usize) < Self::LEN {
            return Err(FormatError::InvalidHeader);
        }
        Ok(Self { data_start: hdr.header_size as u32, version: hdr.version })
    }
}

/// A decoded block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VocBlock {
    /// Type 0: end of data.
    Terminator,
    /// Types 1 and 9: `length` PCM bytes in a new format follow.
    SoundData { format: AudioFormat, length: u32 },
    /// Type 2: `length` more PCM bytes in the current format.
    Continuation { length: u32 },
    /// Type 4: numbered marker.
    Marker(u16),
    /// Type 6: loop start; 0xFFFF repeats forever.
    RepeatStart(u16),
    /// Type 7: loop end.
    RepeatEnd,
    /// Anything else: `length` body bytes to discard.
    Skip { length: u32 },
}

/// Decode the block header at the start of `bytes`.
///
/// Returns the block and the number of header bytes it occupies, or
/// `Ok(None)` when more bytes are needed to decide.
pub fn parse_voc_block(bytes: &[u8]) -> Result<Option<(VocBlock, u32)>, FormatError> {
    let Some(&kind) = bytes.first() else {
        return Ok(None);
    };
    if kind == 0 {
        return Ok(Some((VocBlock::Terminator, 1)));
    }
    if bytes.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]);
    let body = &bytes[4..];

    let block = match kind {
        1 => {
            if body.len() < 2 {
                return Ok(None);
            }
            if body[1] != 0 || size < 2 {
                return Err(FormatError::UnsupportedVersion);
            }
            let rate = 1_000_000 / (256 - body[0] as u32);
            let format = AudioFormat::new(8, rate, 1);
            (VocBlock::SoundData { format, length: size - 2 }, 6)
        }
        2 => (VocBlock::Continuation { length: size }, 4),
        4 => {
            if body.len() < 2 {
                return Ok(None);
            }
            (VocBlock::Marker(u16::from_le_bytes([body[0], body[1]])), 6)
        }
        6 => {
            if body.len() < 2 {
                return Ok(None);
            }
            (VocBlock::RepeatStart(u16::from_le_bytes([body[0], body[1]])), 6)
        }
        7 => (VocBlock::RepeatEnd, 4 + size),
        9 => {
            if body.len() < 12 {
                return Ok(None);
            }
            let ext = ExtendedSound::read(&mut Cursor::new(body))?;
            if ext.codec != 0 || ext.bits != 8 || !(1..=2).contains(&ext.channels) || size < 12 {
                return Err(FormatError::UnsupportedVersion);
            }
            let format = AudioFormat::new(8, ext.rate, ext.channels);
            (VocBlock::SoundData { format, length: size - 12 }, 16)
        }
        _ => (VocBlock::Skip { length: size }, 4),
    };
    Ok(Some(block))
}
