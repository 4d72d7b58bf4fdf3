//! Ring-buffered streaming of sound data.
//!
//! Each stream borrows the preallocated buffer of its [`BufferCategory`];
//! with one buffer per category at most three sounds stream at once.

use std::io::SeekFrom;

use arrayvec::ArrayVec;
use dm_ir::{BufferCategory, SoundId};
use slotmap::{new_key_type, SlotMap};
use tracing::{trace, warn};

use crate::config::StreamConfig;
use crate::error::{EngineError, HostError};
use crate::host::SoundProvider;

new_key_type! {
    /// Generation-checked handle to a [`RingStream`].
    pub struct StreamKey;
}

/// Streams serviced per [`StreamBank::fetch_order`] pass.
pub const MAX_FETCH_PER_PASS: usize = 2;

/// Byte used to pad past the end of a source: mid-scale for every word size.
pub const SILENCE_BYTE: u8 = 0x80;

/// Where a stream's bytes come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSource {
    /// Pulled from the provider with seek/read.
    File,
    /// Pushed by the caller with `feed_stream`.
    Fed,
}

/// Snapshot reported by `query_stream`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub buffer_size: u32,
    pub critical_size: u32,
    pub buffered: u32,
    pub paused: bool,
}

/// A circular byte buffer with read/load cursors.
///
/// The backing `Vec` is `size + max_read` long: a read that crosses the
/// seam is served contiguously by copying the wrapped head into the
/// overflow region past `size`.
pub struct RingStream {
    pub sound: SoundId,
    pub category: BufferCategory,
    pub source: StreamSource,
    buf: Vec<u8>,
    size: u32,
    max_read: u32,
    read: u32,
    load: u32,
    load_size: u32,
    critical_size: u32,
    /// Offset in the source of the next byte to fetch.
    file_offset: u32,
    paused: bool,
}

impl RingStream {
    fn new(
        sound: SoundId,
        category: BufferCategory,
        source: StreamSource,
        buf: Vec<u8>,
        config: &StreamConfig,
    ) -> Self {
        let size = (buf.len() as u32).saturating_sub(config.max_read);
        Self {
            sound,
            category,
            source,
            buf,
            size,
            max_read: config.max_read,
            read: 0,
            load: 0,
            load_size: config.load_size,
            critical_size: config.critical_size,
            file_offset: 0,
            paused: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max_read(&self) -> u32 {
        self.max_read
    }

    /// Bytes loaded but not yet read: `(load - read) mod size`.
    pub fn buffered_bytes(&self) -> u32 {
        (self.load + self.size - self.read) % self.size
    }

    /// Bytes that can still be loaded. One byte stays free so a full ring
    /// is distinguishable from an empty one.
    pub fn free_space(&self) -> u32 {
        self.size - 1 - self.buffered_bytes()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_critical(&self) -> bool {
        self.buffered_bytes() < self.critical_size
    }

    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }

    /// Move the source cursor; the next fetch reads from here.
    pub fn set_file_offset(&mut self, offset: u32) {
        self.file_offset = offset;
        self.paused = false;
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            buffer_size: self.size,
            critical_size: self.critical_size,
            buffered: self.buffered_bytes(),
            paused: self.paused,
        }
    }

    /// A contiguous view of the next `len` buffered bytes.
    ///
    /// Returns `None` if fewer bytes are buffered or `len` exceeds the
    /// overflow region.
    pub fn request_contiguous(&mut self, len: u32) -> Option<&[u8]> {
        if len > self.buffered_bytes() || len > self.max_read {
            return None;
        }
        let start = self.read as usize;
        let end = start + len as usize;
        let size = self.size as usize;
        if end > size {
            let (ring, overflow) = self.buf.split_at_mut(size);
            overflow[..end - size].copy_from_slice(&ring[..end - size]);
        }
        Some(&self.buf[start..end])
    }

    /// Copy the next `out.len()` buffered bytes without consuming them.
    pub fn peek_into(&self, out: &mut [u8]) -> usize {
        let n = (out.len() as u32).min(self.buffered_bytes()) as usize;
        let start = self.read as usize;
        let first = n.min(self.size as usize - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        n
    }

    pub fn advance_read(&mut self, n: u32) {
        let n = n.min(self.buffered_bytes());
        self.read = (self.read + n) % self.size;
    }

    pub fn advance_load(&mut self, n: u32) {
        let n = n.min(self.free_space());
        self.load = (self.load + n) % self.size;
    }

    /// Drop the last `n` loaded bytes.
    pub fn trim_load(&mut self, n: u32) {
        let n = n.min(self.buffered_bytes());
        self.load = (self.load + self.size - n) % self.size;
    }

    /// Discard everything buffered.
    pub fn flush(&mut self) {
        self.load = self.read;
    }

    /// Write `data` at the load cursor, wrapping at the seam.
    fn write_at_load(&mut self, data: &[u8]) -> u32 {
        let n = data.len().min(self.free_space() as usize);
        let start = self.load as usize;
        let first = n.min(self.size as usize - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.advance_load(n as u32);
        n as u32
    }

    /// Fill the bytes past the load cursor with silence without loading them.
    fn pad_tail(&mut self) {
        let n = self.free_space().min(self.max_read) as usize;
        let start = self.load as usize;
        let first = n.min(self.size as usize - start);
        self.buf[start..start + first].fill(SILENCE_BYTE);
        self.buf[..n - first].fill(SILENCE_BYTE);
    }

    /// Load up to `load_size` bytes from the provider.
    ///
    /// A short read marks the stream paused and pads the tail with silence.
    /// Returns the number of bytes loaded.
    pub fn fetch<P: SoundProvider>(&mut self, provider: &mut P) -> Result<u32, HostError> {
        if self.source != StreamSource::File || self.paused {
            return Ok(0);
        }
        let want = self.load_size.min(self.free_space());
        if want == 0 {
            return Ok(0);
        }
        provider.seek(self.sound, SeekFrom::Start(self.file_offset as u64), self.category)?;

        let start = self.load as usize;
        let first = (want as usize).min(self.size as usize - start);
        let mut got = provider.read(self.sound, &mut self.buf[start..start + first], self.category)?;
        if got == first && (want as usize) > first {
            let rest = want as usize - first;
            got += provider.read(self.sound, &mut self.buf[..rest], self.category)?;
        }

        let got = got as u32;
        self.advance_load(got);
        self.file_offset += got;
        if got < want {
            trace!(sound = self.sound, offset = self.file_offset, "stream reached end of data");
            self.paused = true;
            self.pad_tail();
        }
        Ok(got)
    }

    /// Push caller-supplied bytes into a fed stream. Returns bytes accepted.
    pub fn feed(&mut self, data: &[u8], paused: bool) -> u32 {
        let n = self.write_at_load(data);
        if (n as usize) < data.len() {
            warn!(sound = self.sound, dropped = data.len() - n as usize, "fed stream overflow");
        }
        self.file_offset += n;
        self.paused = paused;
        if paused {
            self.pad_tail();
        }
        n
    }
}

/// All streams plus the per-category buffers they borrow.
pub struct StreamBank {
    streams: SlotMap<StreamKey, RingStream>,
    buffers: [Option<Vec<u8>>; 3],
    config: StreamConfig,
    last_fetched: Option<StreamKey>,
}

impl StreamBank {
    pub fn new(config: StreamConfig) -> Self {
        let buffers = BufferCategory::ALL.map(|category| {
            Some(vec![0u8; (config.buffer_size(category) + config.max_read) as usize])
        });
        Self {
            streams: SlotMap::with_capacity_and_key(BufferCategory::ALL.len()),
            buffers,
            config,
            last_fetched: None,
        }
    }

    /// Take the buffer of `category` for a new stream.
    ///
    /// Fails when the category is in use or its buffer cannot hold two
    /// atomic reads.
    pub fn allocate(
        &mut self,
        sound: SoundId,
        category: BufferCategory,
        source: StreamSource,
    ) -> Result<StreamKey, EngineError> {
        if self.config.buffer_size(category) < 2 * self.config.max_read.max(1) {
            warn!(sound, ?category, "stream buffer smaller than two atomic reads");
            return Err(EngineError::NoStream(sound));
        }
        let buf = self.buffers[category.index()]
            .take()
            .ok_or(EngineError::NoStream(sound))?;
        let stream = RingStream::new(sound, category, source, buf, &self.config);
        Ok(self.streams.insert(stream))
    }

    /// Free a stream and return its buffer to the category.
    pub fn release(&mut self, key: StreamKey) {
        if let Some(stream) = self.streams.remove(key) {
            self.buffers[stream.category.index()] = Some(stream.buf);
            if self.last_fetched == Some(key) {
                self.last_fetched = None;
            }
        }
    }

    pub fn release_all(&mut self) {
        let keys: ArrayVec<StreamKey, 3> = self.streams.keys().collect();
        for key in keys {
            self.release(key);
        }
    }

    pub fn get(&self, key: StreamKey) -> Option<&RingStream> {
        self.streams.get(key)
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut RingStream> {
        self.streams.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn category_in_use(&self, category: BufferCategory) -> bool {
        self.buffers[category.index()].is_none()
    }

    pub fn find_sound(&self, sound: SoundId) -> Option<StreamKey> {
        self.streams.iter().find(|(_, s)| s.sound == sound).map(|(k, _)| k)
    }

    pub fn owner_of(&self, category: BufferCategory) -> Option<SoundId> {
        self.streams
            .values()
            .find(|s| s.category == category)
            .map(|s| s.sound)
    }

    /// Streams to fetch this pass, neediest first.
    ///
    /// Only file-backed, unpaused streams are candidates. When two needy
    /// streams compete, the one that did not lead the previous pass leads
    /// this one; a third candidate is skipped.
    pub fn fetch_order(&mut self) -> ArrayVec<StreamKey, MAX_FETCH_PER_PASS> {
        let mut order = ArrayVec::new();
        for (key, stream) in &self.streams {
            if stream.source != StreamSource::File || stream.paused {
                continue;
            }
            if order.try_push(key).is_err() {
                warn!(sound = stream.sound, "more than two streams active, skipping fetch");
            }
        }
        if order.len() == MAX_FETCH_PER_PASS {
            let a_critical = self.streams[order[0]].is_critical();
            let b_critical = self.streams[order[1]].is_critical();
            let swap = match (a_critical, b_critical) {
                (true, true) => self.last_fetched == Some(order[0]),
                (false, true) => true,
                _ => false,
            };
            if swap {
                order.swap(0, 1);
            }
        }
        if let Some(&first) = order.first() {
            self.last_fetched = Some(first);
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryProvider;

    fn small_config() -> StreamConfig {
        StreamConfig {
            music_buffer: 64,
            speech_buffer: 64,
            sfx_buffer: 64,
            load_size: 16,
            critical_size: 24,
            max_read: 16,
        }
    }

    fn fed_stream(bank: &mut StreamBank) -> StreamKey {
        bank.allocate(1, BufferCategory::Music, StreamSource::Fed).unwrap()
    }

    #[test]
    fn wrap_read_is_byte_exact() {
        let cfg = small_config();
        for read_index in 40..64u32 {
            for request in 1..=16u32 {
                let mut bank = StreamBank::new(cfg);
                let key = fed_stream(&mut bank);
                let s = bank.get_mut(key).unwrap();
                // Move both cursors to `read_index`, then load a known pattern.
                s.feed(&vec![0; read_index as usize], false);
                s.advance_read(read_index);
                let pattern: Vec<u8> = (0..32).map(|i| i as u8 + 1).collect();
                s.feed(&pattern, false);

                let got = s.request_contiguous(request).unwrap().to_vec();
                assert_eq!(got, pattern[..request as usize].to_vec(),
                    "read_index {} request {}", read_index, request);
            }
        }
    }

    #[test]
    fn buffered_and_free_bytes() {
        let mut bank = StreamBank::new(small_config());
        let key = fed_stream(&mut bank);
        let s = bank.get_mut(key).unwrap();
        assert_eq!(s.buffered_bytes(), 0);
        assert_eq!(s.free_space(), 63);
        assert_eq!(s.feed(&[1; 100], false), 63);
        assert_eq!(s.buffered_bytes(), 63);
        s.advance_read(10);
        assert_eq!(s.buffered_bytes(), 53);
        s.trim_load(3);
        assert_eq!(s.buffered_bytes(), 50);
        s.flush();
        assert_eq!(s.buffered_bytes(), 0);
    }

    #[test]
    fn request_beyond_buffered_fails() {
        let mut bank = StreamBank::new(small_config());
        let key = fed_stream(&mut bank);
        let s = bank.get_mut(key).unwrap();
        s.feed(&[1; 8], false);
        assert!(s.request_contiguous(9).is_none());
        s.feed(&[1; 30], false);
        assert!(s.request_contiguous(17).is_none());
    }

    #[test]
    fn fetch_pauses_and_pads_at_end() {
        let mut provider = MemoryProvider::new();
        provider.insert_streamed(7, (1u8..=20).collect());
        provider.open_sound(7).unwrap();
        let mut bank = StreamBank::new(small_config());
        let key = bank.allocate(7, BufferCategory::Speech, StreamSource::File).unwrap();
        let s = bank.get_mut(key).unwrap();

        assert_eq!(s.fetch(&mut provider).unwrap(), 16);
        assert!(!s.is_paused());
        assert_eq!(s.fetch(&mut provider).unwrap(), 4);
        assert!(s.is_paused());
        assert_eq!(s.buffered_bytes(), 20);
        assert_eq!(s.fetch(&mut provider).unwrap(), 0);

        let mut tail = [0u8; 4];
        s.advance_read(16);
        s.peek_into(&mut tail);
        assert_eq!(tail, [17, 18, 19, 20]);
        // Bytes past the load cursor are silence.
        assert_eq!(s.buf[20..36], [SILENCE_BYTE; 16]);
    }

    #[test]
    fn category_is_exclusive() {
        let mut bank = StreamBank::new(small_config());
        let key = fed_stream(&mut bank);
        assert_eq!(
            bank.allocate(2, BufferCategory::Music, StreamSource::Fed),
            Err(EngineError::NoStream(2))
        );
        assert!(bank.category_in_use(BufferCategory::Music));
        bank.release(key);
        assert!(bank.allocate(2, BufferCategory::Music, StreamSource::Fed).is_ok());
    }

    #[test]
    fn undersized_buffer_rejected() {
        let cfg = StreamConfig { sfx_buffer: 20, ..small_config() };
        let mut bank = StreamBank::new(cfg);
        assert!(bank.allocate(1, BufferCategory::Sfx, StreamSource::Fed).is_err());
    }

    #[test]
    fn fairness_alternates_needy_streams() {
        let mut provider = MemoryProvider::new();
        provider.insert_streamed(1, vec![0; 1000]);
        provider.insert_streamed(2, vec![0; 1000]);
        let mut bank = StreamBank::new(small_config());
        let a = bank.allocate(1, BufferCategory::Music, StreamSource::File).unwrap();
        let b = bank.allocate(2, BufferCategory::Speech, StreamSource::File).unwrap();

        let first = bank.fetch_order();
        assert_eq!(first.len(), 2);
        let second = bank.fetch_order();
        assert_eq!(second[0], first[1]);
        assert_eq!(second[1], first[0]);

        // Make `a` comfortable: the needy `b` goes first.
        provider.open_sound(1).unwrap();
        let s = bank.get_mut(a).unwrap();
        s.fetch(&mut provider).unwrap();
        s.fetch(&mut provider).unwrap();
        assert!(!s.is_critical());
        assert_eq!(bank.fetch_order()[0], b);
    }

    #[test]
    fn third_stream_is_skipped() {
        let mut bank = StreamBank::new(small_config());
        for (sound, cat) in [(1, BufferCategory::Music), (2, BufferCategory::Speech), (3, BufferCategory::Sfx)] {
            bank.allocate(sound, cat, StreamSource::File).unwrap();
        }
        assert_eq!(bank.fetch_order().len(), MAX_FETCH_PER_PASS);
    }

    #[test]
    fn fed_streams_are_never_fetched() {
        let mut bank = StreamBank::new(small_config());
        fed_stream(&mut bank);
        assert!(bank.fetch_order().is_empty());
    }
}
