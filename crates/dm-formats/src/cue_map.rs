//! `MAP ` block list parser.
//!
//! On disk a cue map is a `MAP ` tag and big-endian size followed by typed
//! blocks, each `tag: [u8; 4]`, `size: u32 BE`, then `size` bytes of body.
//! Every body starts with the logical offset the block takes effect at.

use binrw::io::Cursor;
use binrw::{binrw, BinRead, BinWrite};
use dm_ir::{AudioFormat, CueMap, MapBlock, MapEvent, MarkerText, MAX_MARKER_LEN};

use crate::FormatError;

/// Largest block list the parser accepts, in bytes.
pub const MAX_MAP_BYTES: usize = 0x8000;

#[binrw]
#[brw(big)]
struct BlockHeader {
    tag: [u8; 4],
    size: u32,
}

#[binrw]
#[brw(big)]
struct FrmtBody {
    offset: u32,
    #[allow(dead_code)]
    endian: u32,
    word_size: u32,
    rate: u32,
    channels: u32,
}

#[binrw]
#[brw(big)]
struct RegnBody {
    offset: u32,
    length: u32,
}

#[binrw]
#[brw(big)]
struct JumpBody {
    offset: u32,
    dest: u32,
    hook_id: i32,
    fade_ms: u32,
}

#[binrw]
#[brw(big)]
struct OffsetBody {
    offset: u32,
}

/// Parse a big-endian `MAP ` block list into a [`CueMap`].
///
/// The walk must consume exactly the declared size; anything else is a
/// hard parse error.
pub fn parse_map(bytes: &[u8]) -> Result<CueMap, FormatError> {
    let head = BlockHeader::read(&mut Cursor::new(bytes))?;
    if &head.tag != b"MAP " {
        return Err(FormatError::InvalidHeader);
    }
    let declared = head.size as usize;
    if declared > MAX_MAP_BYTES {
        return Err(FormatError::MapTooLarge(declared));
    }
    let body = bytes.get(8..8 + declared).ok_or(FormatError::UnexpectedEof)?;

    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos < declared {
        if declared - pos < 8 {
            return Err(FormatError::MapSizeMismatch { declared, walked: pos + 8 });
        }
        let hdr = BlockHeader::read(&mut Cursor::new(&body[pos..]))?;
        let end = pos + 8 + hdr.size as usize;
        if end > declared {
            return Err(FormatError::MapSizeMismatch { declared, walked: end });
        }
        blocks.push(parse_block(hdr.tag, &body[pos + 8..end])?);
        pos = end;
    }

    Ok(CueMap::new(blocks))
}

fn parse_block(tag: [u8; 4], content: &[u8]) -> Result<MapBlock, FormatError> {
    let mut cur = Cursor::new(content);
    match &tag {
        b"FRMT" => {
            let b = FrmtBody::read(&mut cur)?;
            let format = AudioFormat::new(b.word_size as u8, b.rate, b.channels as u8);
            if b.word_size > 16 || b.channels > 2 || !format.is_valid() {
                return Err(FormatError::UnsupportedFormat {
                    word_size: b.word_size,
                    channels: b.channels,
                });
            }
            Ok(MapBlock::new(b.offset, MapEvent::Format(format)))
        }
        b"REGN" => {
            let b = RegnBody::read(&mut cur)?;
            Ok(MapBlock::new(b.offset, MapEvent::Region { length: b.length }))
        }
        b"JUMP" => {
            let b = JumpBody::read(&mut cur)?;
            Ok(MapBlock::new(
                b.offset,
                MapEvent::Jump { dest: b.dest, hook_id: b.hook_id, fade_ms: b.fade_ms },
            ))
        }
        b"STOP" => {
            let b = OffsetBody::read(&mut cur)?;
            Ok(MapBlock::new(b.offset, MapEvent::Stop))
        }
        b"TEXT" => {
            let b = OffsetBody::read(&mut cur)?;
            let raw = &content[4..];
            let raw = raw.split(|&c| c == 0).next().unwrap_or(raw);
            if raw.len() > MAX_MARKER_LEN {
                return Err(FormatError::MarkerTooLong(raw.len()));
            }
            // Replacement characters are wider than the bytes they stand
            // for, so cut at the capacity on a character boundary.
            let mut text = MarkerText::new();
            for c in String::from_utf8_lossy(raw).chars() {
                if text.try_push(c).is_err() {
                    break;
                }
            }
            Ok(MapBlock::new(b.offset, MapEvent::Text(text)))
        }
        b"SYNC" => {
            let b = OffsetBody::read(&mut cur)?;
            Ok(MapBlock::new(b.offset, MapEvent::Sync(content[4..].to_vec())))
        }
        _ => Err(FormatError::UnknownBlock(tag)),
    }
}

/// Serialize a [`CueMap`] back to its big-endian on-disk form.
pub fn encode_map(map: &CueMap) -> Vec<u8> {
    let mut body = Cursor::new(Vec::new());
    for block in map.blocks() {
        // Writes into a Vec cannot fail.
        let _ = write_block(&mut body, block);
    }
    let body = body.into_inner();

    let mut out = Cursor::new(Vec::with_capacity(body.len() + 8));
    let _ = BlockHeader { tag: *b"MAP ", size: body.len() as u32 }.write(&mut out);
    let mut out = out.into_inner();
    out.extend_from_slice(&body);
    out
}

fn write_block(w: &mut Cursor<Vec<u8>>, block: &MapBlock) -> binrw::BinResult<()> {
    let offset = block.offset;
    match &block.event {
        MapEvent::Format(fmt) => {
            BlockHeader { tag: *b"FRMT", size: 20 }.write(w)?;
            FrmtBody {
                offset,
                endian: 0,
                word_size: fmt.word_size as u32,
                rate: fmt.sample_rate,
                channels: fmt.channels as u32,
            }
            .write(w)
        }
        MapEvent::Region { length } => {
            BlockHeader { tag: *b"REGN", size: 8 }.write(w)?;
            RegnBody { offset, length: *length }.write(w)
        }
        MapEvent::Jump { dest, hook_id, fade_ms } => {
            BlockHeader { tag: *b"JUMP", size: 16 }.write(w)?;
            JumpBody { offset, dest: *dest, hook_id: *hook_id, fade_ms: *fade_ms }.write(w)
        }
        MapEvent::Stop => {
            BlockHeader { tag: *b"STOP", size: 4 }.write(w)?;
            OffsetBody { offset }.write(w)
        }
        MapEvent::Text(text) => {
            BlockHeader { tag: *b"TEXT", size: 4 + text.len() as u32 + 1 }.write(w)?;
            OffsetBody { offset }.write(w)?;
            text.as_bytes().write_be(w)?;
            0u8.write_be(w)
        }
        MapEvent::Sync(data) => {
            BlockHeader { tag: *b"SYNC", size: 4 + data.len() as u32 }.write(w)?;
            OffsetBody { offset }.write(w)?;
            data.write_be(w)
        }
    }
}
