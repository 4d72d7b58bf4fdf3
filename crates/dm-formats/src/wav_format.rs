//! WAV encoding and decoding.
//!
//! Decoded sounds are converted into the sequencer's native PCM layout:
//! unsigned offset-binary samples, 16-bit words big-endian.

use crate::FormatError;
use dm_ir::AudioFormat;
use std::io::Write;

// --- Writing ---

/// Write little-endian mixer output (8-bit unsigned or 16-bit signed) as a WAV file.
pub fn write_wav(
    w: &mut impl Write,
    pcm: &[u8],
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
) -> std::io::Result<()> {
    let block_align = channels * (bits_per_sample / 8);
    let data_size = pcm.len() as u32;

    write_riff_header(w, data_size)?;
    write_fmt_chunk(w, channels, sample_rate, block_align, bits_per_sample)?;
    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;
    w.write_all(pcm)
}

pub fn pcm_to_wav(pcm: &[u8], channels: u16, sample_rate: u32, bits_per_sample: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(44 + pcm.len());
    // Writing into a Vec cannot fail.
    let _ = write_wav(&mut buf, pcm, channels, sample_rate, bits_per_sample);
    buf
}

fn write_riff_header(w: &mut impl Write, data_size: u32) -> std::io::Result<()> {
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_size).to_le_bytes())?;
    w.write_all(b"WAVE")
}

fn write_fmt_chunk(
    w: &mut impl Write,
    num_channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
) -> std::io::Result<()> {
    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&1u16.to_le_bytes())?;
    w.write_all(&num_channels.to_le_bytes())?;
    w.write_all(&sample_rate.to_le_bytes())?;
    w.write_all(&(sample_rate * block_align as u32).to_le_bytes())?;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&bits_per_sample.to_le_bytes())
}

// --- Reading ---

/// PCM decoded from a WAV file, ready to be wrapped in a linear cue map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSound {
    pub format: AudioFormat,
    pub pcm: Vec<u8>,
}

/// Load a WAV file from raw bytes.
pub fn load_wav(data: &[u8]) -> Result<DecodedSound, FormatError> {
    let header = parse_header(data)?;
    let end = (header.data_offset + header.data_size).min(data.len());
    let raw = &data[header.data_offset..end];

    let pcm = match header.bits_per_sample {
        8 => raw.to_vec(),
        _ => to_offset_binary_be(raw),
    };
    let format = AudioFormat::new(
        header.bits_per_sample as u8,
        header.sample_rate,
        header.num_channels as u8,
    );
    Ok(DecodedSound { pcm, format })
}

struct WavHeader {
    num_channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    data_offset: usize,
    data_size: usize,
}

fn parse_header(data: &[u8]) -> Result<WavHeader, FormatError> {
    if data.len() < 44 {
        return Err(FormatError::UnexpectedEof);
    }
    if &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(FormatError::InvalidHeader);
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u32, u16)> = None;
    let mut data_chunk: Option<(usize, usize)> = None;

    while pos + 8 <= data.len() {
        let chunk_id = &data[pos..pos + 4];
        let chunk_size = read_u32_le(data, pos + 4) as usize;

        if chunk_id == b"fmt " && chunk_size >= 16 && pos + 24 <= data.len() {
            if read_u16_le(data, pos + 8) != 1 {
                return Err(FormatError::UnsupportedVersion);
            }
            let channels = read_u16_le(data, pos + 10);
            let rate = read_u32_le(data, pos + 12);
            let bits = read_u16_le(data, pos + 22);
            fmt = Some((channels, rate, bits));
        } else if chunk_id == b"data" {
            data_chunk = Some((pos + 8, chunk_size));
        }

        pos += 8 + chunk_size;
        if pos % 2 != 0 {
            pos += 1;
        }
    }

    let (num_channels, sample_rate, bits_per_sample) = fmt.ok_or(FormatError::InvalidHeader)?;
    let (data_offset, data_size) = data_chunk.ok_or(FormatError::InvalidHeader)?;

    if !matches!(bits_per_sample, 8 | 16) || !(1..=2).contains(&num_channels) {
        return Err(FormatError::UnsupportedFormat {
            word_size: bits_per_sample as u32,
            channels: num_channels as u32,
        });
    }

    Ok(WavHeader { num_channels, sample_rate, bits_per_sample, data_offset, data_size })
}

/// Signed little-endian 16-bit -> unsigned big-endian.
fn to_offset_binary_be(raw: &[u8]) -> Vec<u8> {
    raw.chunks_exact(2)
        .flat_map(|c| {
            let v = i16::from_le_bytes([c[0], c[1]]) as u16 ^ 0x8000;
            v.to_be_bytes()
        })
        .collect()
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav(channels: u16, sample_rate: u32, bits: u16, pcm_data: &[u8]) -> Vec<u8> {
        pcm_to_wav(pcm_data, channels, sample_rate, bits)
    }

    #[test]
    fn load_8bit_mono_keeps_unsigned_bytes() {
        let wav = make_wav(1, 22050, 8, &[128, 255, 0, 192]);
        let sound = load_wav(&wav).unwrap();
        assert_eq!(sound.format, AudioFormat::new(8, 22050, 1));
        assert_eq!(sound.pcm, vec![128, 255, 0, 192]);
    }

    #[test]
    fn load_16bit_converts_to_offset_binary() {
        let pcm: Vec<u8> = [0i16, 1000, -32768, 32767]
            .iter()
            .flat_map(|&v| v.to_le_bytes())
            .collect();
        let wav = make_wav(2, 44100, 16, &pcm);
        let sound = load_wav(&wav).unwrap();
        assert_eq!(sound.format, AudioFormat::new(16, 44100, 2));
        assert_eq!(
            sound.pcm,
            vec![0x80, 0x00, 0x83, 0xE8, 0x00, 0x00, 0xFF, 0xFF]
        );
    }

    #[test]
    fn written_header_is_canonical() {
        let wav = pcm_to_wav(&[0; 8], 2, 22050, 16);
        assert_eq!(wav.len(), 52);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32_le(&wav, 4), 44);
        assert_eq!(read_u32_le(&wav, 28), 22050 * 4);
        assert_eq!(read_u32_le(&wav, 40), 8);
    }

    #[test]
    fn invalid_header_rejected() {
        let mut wav = make_wav(1, 22050, 8, &[128; 4]);
        wav[8] = b'X';
        assert_eq!(load_wav(&wav), Err(FormatError::InvalidHeader));
    }

    #[test]
    fn too_short_rejected() {
        assert_eq!(load_wav(&[0; 10]), Err(FormatError::UnexpectedEof));
    }

    #[test]
    fn wide_samples_rejected() {
        let wav = make_wav(1, 22050, 24, &[0; 6]);
        assert_eq!(
            load_wav(&wav),
            Err(FormatError::UnsupportedFormat { word_size: 24, channels: 1 })
        );
    }
}
