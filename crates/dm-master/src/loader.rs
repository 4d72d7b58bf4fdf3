//! Turns sound files into the containers the engine plays.

use dm_formats::{build_imus, load_wav, probe_header, FormatError, Probe};
use dm_ir::CueMap;

/// Container a sound arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoundKind {
    Imus,
    Voc,
    /// Converted to iMUS with a single-region map.
    Wav,
}

/// Validate `data` and convert anything the engine cannot read directly.
pub fn prepare_sound(data: Vec<u8>) -> Result<(Vec<u8>, SoundKind), FormatError> {
    if data.starts_with(b"RIFF") {
        let decoded = load_wav(&data)?;
        let map = CueMap::linear(decoded.format, decoded.pcm.len() as u32);
        return Ok((build_imus(&map, &decoded.pcm), SoundKind::Wav));
    }
    match probe_header(&data)? {
        Probe::Imus(_) => Ok((data, SoundKind::Imus)),
        Probe::Voc(_) => Ok((data, SoundKind::Voc)),
        Probe::NeedMore(_) => Err(FormatError::UnexpectedEof),
        Probe::Unknown => Err(FormatError::InvalidHeader),
    }
}
