//! The game/resource side of the engine.

use std::collections::HashMap;
use std::io::SeekFrom;

use dm_ir::{BufferCategory, SoundId};

use crate::error::HostError;

/// Supplies sound bytes to the engine.
///
/// A sound whose whole resource is available through [`sound_data`] plays
/// directly from it; anything else is opened and streamed through
/// [`seek`]/[`read`] into a ring buffer.
///
/// [`sound_data`]: SoundProvider::sound_data
/// [`seek`]: SoundProvider::seek
/// [`read`]: SoundProvider::read
pub trait SoundProvider {
    /// Whole in-memory resource, for sounds that are not streamed.
    fn sound_data(&self, sound: SoundId) -> Option<&[u8]>;

    fn open_sound(&mut self, sound: SoundId) -> Result<(), HostError>;

    fn close_sound(&mut self, sound: SoundId);

    fn close_all_sounds(&mut self);

    /// Position the read cursor of an open sound. Returns the new offset.
    fn seek(
        &mut self,
        sound: SoundId,
        pos: SeekFrom,
        category: BufferCategory,
    ) -> Result<u64, HostError>;

    /// Read from the cursor; a short read means end of data.
    fn read(
        &mut self,
        sound: SoundId,
        buf: &mut [u8],
        category: BufferCategory,
    ) -> Result<usize, HostError>;

    /// Pre-extracted big-endian cue map for sounds stored as raw PCM.
    fn fetch_map(&self, sound: SoundId) -> Option<&[u8]>;
}

struct StreamedSound {
    data: Vec<u8>,
    cursor: Option<u64>,
}

/// In-memory [`SoundProvider`] used by tests, benches and the CLI.
#[derive(Default)]
pub struct MemoryProvider {
    resources: HashMap<SoundId, Vec<u8>>,
    streamed: HashMap<SoundId, StreamedSound>,
    maps: HashMap<SoundId, Vec<u8>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sound played from a whole resource.
    pub fn insert_resource(&mut self, sound: SoundId, data: Vec<u8>) {
        self.resources.insert(sound, data);
    }

    /// Register a sound that is streamed through seek/read.
    pub fn insert_streamed(&mut self, sound: SoundId, data: Vec<u8>) {
        self.streamed.insert(sound, StreamedSound { data, cursor: None });
    }

    /// Register an external cue map for a raw PCM sound.
    pub fn insert_map(&mut self, sound: SoundId, map: Vec<u8>) {
        self.maps.insert(sound, map);
    }

    pub fn is_open(&self, sound: SoundId) -> bool {
        self.streamed.get(&sound).is_some_and(|s| s.cursor.is_some())
    }
}

impl SoundProvider for MemoryProvider {
    fn sound_data(&self, sound: SoundId) -> Option<&[u8]> {
        self.resources.get(&sound).map(Vec::as_slice)
    }

    fn open_sound(&mut self, sound: SoundId) -> Result<(), HostError> {
        let entry = self.streamed.get_mut(&sound).ok_or(HostError::NotFound(sound))?;
        entry.cursor = Some(0);
        Ok(())
    }

    fn close_sound(&mut self, sound: SoundId) {
        if let Some(entry) = self.streamed.get_mut(&sound) {
            entry.cursor = None;
        }
    }

    fn close_all_sounds(&mut self) {
        for entry in self.streamed.values_mut() {
            entry.cursor = None;
        }
    }

    fn seek(
        &mut self,
        sound: SoundId,
        pos: SeekFrom,
        _category: BufferCategory,
    ) -> Result<u64, HostError> {
        let entry = self.streamed.get_mut(&sound).ok_or(HostError::NotFound(sound))?;
        let cursor = entry.cursor.ok_or(HostError::NotOpen(sound))?;
        let len = entry.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(delta) => cursor as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if target < 0 || target > len {
            return Err(HostError::BadSeek { sound, offset: target.max(0) as u64 });
        }
        entry.cursor = Some(target as u64);
        Ok(target as u64)
    }

    fn read(
        &mut self,
        sound: SoundId,
        buf: &mut [u8],
        _category: BufferCategory,
    ) -> Result<usize, HostError> {
        let entry = self.streamed.get_mut(&sound).ok_or(HostError::NotFound(sound))?;
        let cursor = entry.cursor.ok_or(HostError::NotOpen(sound))? as usize;
        let start = cursor.min(entry.data.len());
        let n = buf.len().min(entry.data.len() - start);
        buf[..n].copy_from_slice(&entry.data[start..start + n]);
        entry.cursor = Some((start + n) as u64);
        Ok(n)
    }

    fn fetch_map(&self, sound: SoundId) -> Option<&[u8]> {
        self.maps.get(&sound).map(Vec::as_slice)
    }
}
