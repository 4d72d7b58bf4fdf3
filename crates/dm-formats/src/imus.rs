//! `iMUS` container header.
//!
//! ```text
//! "iMUS" u32be   size of everything that follows
//! "MAP " u32be   cue map block list
//! "DATA" u32be   raw PCM
//! ```

use binrw::io::Cursor;
use binrw::{binread, BinRead};
use dm_ir::CueMap;

use crate::cue_map::{encode_map, parse_map, MAX_MAP_BYTES};
use crate::voc::{VocHeader, VOC_MAGIC};
use crate::FormatError;

/// Bytes needed before the header length of an `iMUS` file is known.
pub const IMUS_PREFIX_LEN: usize = 16;

#[binread]
#[br(big, magic = b"iMUS")]
struct ImusPrefix {
    #[allow(dead_code)]
    total: u32,
    #[br(magic = b"MAP ")]
    map_size: u32,
}

#[binread]
#[br(big, magic = b"DATA")]
struct DataHeader {
    size: u32,
}

/// A parsed `iMUS` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImusHeader {
    pub map: CueMap,
    /// Offset of the first PCM byte within the file.
    pub data_start: u32,
    /// Length of the PCM that follows.
    pub data_len: u32,
}

/// Result of looking at the first bytes of a sound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Not enough bytes yet; at least this many are required.
    NeedMore(usize),
    Imus(ImusHeader),
    Voc(VocHeader),
    /// Neither container; the caller must supply a map.
    Unknown,
}

/// Identify the container of a sound from its leading bytes.
///
/// Streams call this repeatedly as the ring buffer fills, so a short prefix
/// is answered with [`Probe::NeedMore`] rather than an error.
pub fn probe_header(prefix: &[u8]) -> Result<Probe, FormatError> {
    if prefix.len() < 4 {
        return Ok(Probe::NeedMore(IMUS_PREFIX_LEN));
    }
    if &prefix[..4] == b"iMUS" {
        return probe_imus(prefix);
    }
    if VOC_MAGIC.starts_with(&prefix[..4]) {
        if prefix.len() < VocHeader::LEN {
            return Ok(Probe::NeedMore(VocHeader::LEN));
        }
        return VocHeader::parse(prefix).map(Probe::Voc);
    }
    Ok(Probe::Unknown)
}

fn probe_imus(prefix: &[u8]) -> Result<Probe, FormatError> {
    if prefix.len() < IMUS_PREFIX_LEN {
        return Ok(Probe::NeedMore(IMUS_PREFIX_LEN));
    }
    let head = ImusPrefix::read(&mut Cursor::new(prefix))
        .map_err(|_| FormatError::InvalidHeader)?;
    let map_size = head.map_size as usize;
    if map_size > MAX_MAP_BYTES {
        return Err(FormatError::MapTooLarge(map_size));
    }
    let header_len = IMUS_PREFIX_LEN + map_size + 8;
    if prefix.len() < header_len {
        return Ok(Probe::NeedMore(header_len));
    }

    let map = parse_map(&prefix[8..IMUS_PREFIX_LEN + map_size])?;
    let data = DataHeader::read(&mut Cursor::new(&prefix[IMUS_PREFIX_LEN + map_size..]))
        .map_err(|_| FormatError::InvalidHeader)?;

    Ok(Probe::Imus(ImusHeader {
        map,
        data_start: header_len as u32,
        data_len: data.size,
    }))
}

/// Wrap a cue map and PCM into an `iMUS` file.
pub fn build_imus(map: &CueMap, data: &[u8]) -> Vec<u8> {
    let map_bytes = encode_map(map);
    let total = map_bytes.len() + 8 + data.len();

    let mut out = Vec::with_capacity(total + 8);
    out.extend_from_slice(b"iMUS");
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&map_bytes);
    out.extend_from_slice(b"DATA");
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}
