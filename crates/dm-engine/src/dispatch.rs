//! Per-track playback cursor.
//!
//! A [`Dispatch`] moves through three states once per feed call:
//! `NeedMap` (identify the container and load its cue map), `SeekRegion`
//! (walk map events or VOC block headers to the next run of PCM) and
//! `PlayingRegion` (hand PCM to the mixer). A crossfade of old material can
//! be attached at any time and is mixed under the live region.

use core::fmt::Write as _;

use dm_formats::{parse_map, parse_voc_block, probe_header, Probe, VocBlock};
use dm_ir::{AudioFormat, CueMap, MapEvent, MarkerText, SoundId};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::crossfade::{Crossfade, FadeBuffer, FadeBufferPool};
use crate::error::{EngineError, HostError};
use crate::host::SoundProvider;
use crate::interpreter::{check_hook, fade_size, predict_jump, MapStep, MapWalker, HOOK_WILDCARD};
use crate::mixer::Mixer;
use crate::ring_stream::{StreamBank, StreamKey};
use crate::tracks::{Track, PITCH_UNITY};
use crate::zones::{ZoneList, ZonePool};

/// Markers fired during one feed pass, processed once the pass ends.
pub const MAX_PENDING_MARKERS: usize = 8;

/// Bound on state transitions per feed call.
const MAX_STEPS_PER_FEED: u32 = 64;

/// Bound on jumps taken by one map walk.
const MAX_JUMPS_PER_SEEK: u32 = 16;

/// VOC block headers are at most this long.
const VOC_BLOCK_HEADER_MAX: u32 = 16;

/// A VOC repeat count that loops until broken by a hook.
const VOC_REPEAT_FOREVER: u16 = 0xFFFF;

pub type MarkerQueue = Deque<(SoundId, MarkerText), MAX_PENDING_MARKERS>;

/// How region boundaries are found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingMode {
    /// Regions, jumps and markers come from a [`CueMap`].
    #[default]
    CueMap,
    /// Block headers are read inline from a VOC file.
    VocChunks,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchState {
    #[default]
    NeedMap,
    SeekRegion,
    PlayingRegion,
}

/// Where a dispatch reads its bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SoundSource {
    #[default]
    None,
    /// The provider's whole in-memory resource.
    Resource,
    /// A ring-buffered stream.
    Stream(StreamKey),
}

impl SoundSource {
    pub fn stream(self) -> Option<StreamKey> {
        match self {
            SoundSource::Stream(key) => Some(key),
            _ => None,
        }
    }
}

/// Repeat and skip bookkeeping of a VOC file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocCursor {
    pub loop_start: Option<u32>,
    pub loop_count: u16,
    /// Body bytes of an unknown block still to discard.
    pub skip: u32,
}

/// Result of one feed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    Played,
    /// No data yet; try again next call.
    Starved,
    /// End of the sound; the track should be cleared.
    Ended,
}

enum Nav {
    Region,
    Waiting,
    Stop,
}

enum Chunk {
    Played(u32),
    Starved,
    Ended,
}

/// Everything a dispatch borrows from the engine while feeding.
pub struct FeedContext<'a, P> {
    pub provider: &'a mut P,
    pub streams: &'a mut StreamBank,
    pub zones: &'a mut ZonePool,
    pub mixer: &'a mut Mixer,
    pub fade_buffers: &'a mut FadeBufferPool,
    pub markers: &'a mut MarkerQueue,
    /// Output sample rate.
    pub feed_rate: u32,
}

/// Source frames needed for `out_frames` output frames.
pub fn source_frames(src_rate: u32, out_frames: u32, pitch: i32, feed_rate: u32) -> u32 {
    let num = out_frames as u64 * src_rate as u64 * pitch.max(1) as u64;
    let den = feed_rate.max(1) as u64 * PITCH_UNITY as u64;
    (num / den).max(1) as u32
}

/// Output frames produced by `in_frames` source frames.
pub fn output_frames(src_rate: u32, in_frames: u32, pitch: i32, feed_rate: u32) -> u32 {
    let num = in_frames as u64 * feed_rate as u64 * PITCH_UNITY as u64;
    let den = src_rate.max(1) as u64 * pitch.max(1) as u64;
    (num / den) as u32
}

fn queue_marker(markers: &mut MarkerQueue, sound: SoundId, text: MarkerText) {
    if markers.push_back((sound, text)).is_err() {
        warn!(sound, marker = text.as_str(), "marker queue full, dropping marker");
    }
}

#[derive(Debug, Default)]
pub struct Dispatch {
    pub state: DispatchState,
    pub mode: StreamingMode,
    pub source: SoundSource,
    pub format: AudioFormat,
    /// Logical byte position: relative to `data_start` for cue maps, the
    /// file offset for VOC.
    pub current_offset: u32,
    pub audio_remaining: u32,
    /// File offset of logical offset 0.
    pub data_start: u32,
    pub map: Option<CueMap>,
    pub zones: ZoneList,
    pub crossfade: Option<Crossfade>,
    pub voc: VocCursor,
    /// Jump block already decided by prefetch.
    predicted_jump: Option<usize>,
    /// Logical offset to resume at once the map of a switched-in sound loads.
    sync_target: Option<u32>,
    fade_started: bool,
}

impl Dispatch {
    pub fn new(source: SoundSource) -> Self {
        Self { source, ..Default::default() }
    }

    pub fn predicted_jump(&self) -> Option<usize> {
        self.predicted_jump
    }

    /// The track hook as it stood before prefetch consumed it.
    ///
    /// Save data keeps no prediction since the ring is refilled on restore,
    /// so the hook a predicted jump matched is handed back for the restored
    /// track to predict again.
    pub fn unconsumed_hook(&self, hook: i32) -> i32 {
        let block = self
            .predicted_jump
            .and_then(|i| self.map.as_ref()?.get(i))
            .map(|b| &b.event);
        match block {
            Some(MapEvent::Jump { hook_id: 0, .. }) => HOOK_WILDCARD,
            Some(MapEvent::Jump { hook_id, .. }) => *hook_id,
            _ => hook,
        }
    }

    /// Playback position in milliseconds.
    pub fn position_ms(&self) -> i32 {
        let rate = self.format.byte_rate();
        if rate == 0 {
            return 0;
        }
        (self.current_offset as u64 * 1000 / rate as u64) as i32
    }

    /// Return zones and the fade buffer to their pools. The caller releases
    /// the stream.
    pub fn release(&mut self, zones: &mut ZonePool, fade_buffers: &mut FadeBufferPool) {
        self.zones.clear(zones);
        if let Some(cf) = self.crossfade.take() {
            fade_buffers.release(cf.into_buffer());
        }
    }

    /// Reset to load a different sound through `source`.
    pub fn restart(&mut self, source: SoundSource, zones: &mut ZonePool) {
        self.zones.clear(zones);
        self.state = DispatchState::NeedMap;
        self.mode = StreamingMode::CueMap;
        self.source = source;
        self.current_offset = 0;
        self.audio_remaining = 0;
        self.data_start = 0;
        self.map = None;
        self.voc = VocCursor::default();
        self.predicted_jump = None;
        self.sync_target = None;
    }

    /// Resume the switched-in sound at `offset` plus whatever old material
    /// plays before its map loads.
    pub fn sync_to(&mut self, offset: u32) {
        self.sync_target = Some(offset);
    }

    /// Attach old material, replacing any crossfade in progress.
    pub fn start_crossfade(
        &mut self,
        buffer: FadeBuffer,
        format: AudioFormat,
        fade_buffers: &mut FadeBufferPool,
    ) {
        if let Some(old) = self.crossfade.take() {
            fade_buffers.release(old.into_buffer());
        }
        if buffer.is_empty() {
            fade_buffers.release(buffer);
            return;
        }
        self.crossfade = Some(Crossfade::new(buffer, format));
        self.fade_started = true;
    }

    /// Copy up to `fade_ms` of the material at the cursor into a fade
    /// buffer, without consuming it.
    pub fn capture_fade<P: SoundProvider>(
        &self,
        sound: SoundId,
        fade_ms: u32,
        provider: &P,
        streams: &StreamBank,
        zones: &ZonePool,
        fade_buffers: &mut FadeBufferPool,
    ) -> Option<FadeBuffer> {
        if self.state == DispatchState::NeedMap {
            return None;
        }
        match self.source {
            SoundSource::Stream(key) => {
                let stream = streams.get(key)?;
                let head = self.zones.head(zones).map_or(0, |z| z.size);
                let fade = fade_size(self.format, fade_ms, head.min(stream.buffered_bytes()));
                if fade == 0 {
                    return None;
                }
                let mut buffer = fade_buffers.allocate(fade)?;
                let n = stream.peek_into(buffer.bytes_mut());
                buffer.truncate(n as u32);
                Some(buffer)
            }
            SoundSource::Resource => {
                let data = provider.sound_data(sound)?;
                let start = (self.data_start + self.current_offset) as usize;
                let available = data.len().saturating_sub(start) as u32;
                let fade = fade_size(self.format, fade_ms, available);
                if fade == 0 {
                    return None;
                }
                let mut buffer = fade_buffers.allocate(fade)?;
                let len = buffer.len() as usize;
                buffer.bytes_mut().copy_from_slice(&data[start..start + len]);
                Some(buffer)
            }
            SoundSource::None => None,
        }
    }

    /// Account for `n` bytes just loaded into this dispatch's stream.
    pub fn on_loaded<P>(&mut self, track: &mut Track, ctx: &mut FeedContext<'_, P>, n: u32) {
        if self.state == DispatchState::NeedMap || n == 0 {
            return;
        }
        self.zones.grow_tail(ctx.zones, n);
        self.predict(track, ctx);
    }

    /// Look for a jump in the freshly buffered tail zone and prepare it so
    /// the stream fetches the destination next.
    fn predict<P>(&mut self, track: &mut Track, ctx: &mut FeedContext<'_, P>) {
        if self.mode != StreamingMode::CueMap || self.predicted_jump.is_some() || track.jump_hook == 0 {
            return;
        }
        let (Some(map), SoundSource::Stream(key)) = (self.map.as_ref(), self.source) else {
            return;
        };
        let Some(stream) = ctx.streams.get_mut(key) else {
            return;
        };
        let Some(tail) = self.zones.tail(ctx.zones).copied() else {
            return;
        };
        if tail.fading {
            return;
        }
        let Some(plan) = predict_jump(map, tail.offset, tail.end(), track.jump_hook, stream.is_paused())
        else {
            return;
        };
        let Some(excess) = self.zones.split_for_jump(ctx.zones, plan.at, plan.fade, plan.dest) else {
            return;
        };
        stream.trim_load(excess);
        stream.set_file_offset(self.data_start + plan.dest);
        if let Some(MapEvent::Jump { hook_id, .. }) = map.get(plan.index).map(|b| &b.event) {
            check_hook(&mut track.jump_hook, *hook_id);
        }
        debug!(sound = track.sound, at = plan.at, dest = plan.dest, fade = plan.fade, "jump predicted");
        self.predicted_jump = Some(plan.index);
    }

    /// Mix `out_frames` frames of this track into the mixer.
    pub fn feed<P: SoundProvider>(
        &mut self,
        track: &mut Track,
        ctx: &mut FeedContext<'_, P>,
        out_frames: u32,
    ) -> Result<Feed, EngineError> {
        self.fade_started = false;
        let mut gain = self.mix_crossfade(track, ctx, out_frames, 0);
        let mut out = 0;
        let mut steps = 0;
        while out < out_frames {
            steps += 1;
            if steps > MAX_STEPS_PER_FEED {
                trace!(sound = track.sound, "feed made no progress");
                break;
            }
            match self.state {
                DispatchState::NeedMap => {
                    if !self.load_map(track, ctx)? {
                        return Ok(Feed::Starved);
                    }
                }
                DispatchState::SeekRegion => {
                    let nav = match self.mode {
                        StreamingMode::CueMap => self.seek_region(track, ctx)?,
                        StreamingMode::VocChunks => self.seek_voc_block(track, ctx)?,
                    };
                    match nav {
                        Nav::Region => {}
                        Nav::Waiting => return Ok(Feed::Starved),
                        Nav::Stop => return Ok(Feed::Ended),
                    }
                    if self.fade_started {
                        self.fade_started = false;
                        gain = self.mix_crossfade(track, ctx, out_frames - out, out);
                    }
                }
                DispatchState::PlayingRegion => {
                    match self.play_chunk(track, ctx, out_frames - out, out, gain)? {
                        Chunk::Played(frames) => out += frames,
                        Chunk::Starved => return Ok(Feed::Starved),
                        Chunk::Ended => return Ok(Feed::Ended),
                    }
                }
            }
        }
        Ok(Feed::Played)
    }

    /// Mix old material over `span` frames at `offset`; returns the gain
    /// for the live material.
    fn mix_crossfade<P>(
        &mut self,
        track: &Track,
        ctx: &mut FeedContext<'_, P>,
        span: u32,
        offset: u32,
    ) -> i32 {
        let Some(cf) = self.crossfade.as_mut() else {
            return track.eff_vol;
        };
        let (old_gain, new_gain) = cf.gains(track.eff_vol);
        let fmt = cf.format;
        let frames = source_frames(fmt.sample_rate, span, track.pitch_shift, ctx.feed_rate);
        let per_call = fmt.frames_to_bytes(frames);
        let material = cf.material(per_call);
        let got = fmt.align_down(material.len() as u32);
        let in_frames = fmt.bytes_to_frames(got);
        let out_span = if in_frames >= frames {
            span
        } else {
            output_frames(fmt.sample_rate, in_frames, track.pitch_shift, ctx.feed_rate).min(span)
        };
        ctx.mixer.mix(&material[..got as usize], in_frames, fmt, out_span, offset, old_gain, track.pan);
        cf.advance(got, per_call);
        if cf.is_done() {
            if let Some(done) = self.crossfade.take() {
                ctx.fade_buffers.release(done.into_buffer());
            }
        }
        new_gain
    }

    /// Move the cursor and the ring past `n` bytes.
    fn skip_bytes(&mut self, streams: &mut StreamBank, zones: &mut ZonePool, n: u32) {
        if let Some(stream) = self.source.stream().and_then(|k| streams.get_mut(k)) {
            stream.advance_read(n);
            self.zones.consume_head(zones, n);
        }
        self.current_offset += n;
    }

    /// Continue reading at logical `offset`, discarding buffered data.
    fn seek_to(&mut self, streams: &mut StreamBank, zones: &mut ZonePool, offset: u32) {
        if let Some(stream) = self.source.stream().and_then(|k| streams.get_mut(k)) {
            stream.flush();
            self.zones.reset(zones, offset, 0);
            stream.set_file_offset(self.data_start + offset);
        }
        self.predicted_jump = None;
        self.current_offset = offset;
    }

    /// Identify the container and load the map. Returns `false` while more
    /// header bytes are needed.
    fn load_map<P: SoundProvider>(
        &mut self,
        track: &mut Track,
        ctx: &mut FeedContext<'_, P>,
    ) -> Result<bool, EngineError> {
        let sound = track.sound;
        let (probe, buffered) = match self.source {
            SoundSource::Stream(key) => {
                let stream = ctx.streams.get_mut(key).ok_or(EngineError::NoStream(sound))?;
                let paused = stream.is_paused();
                let max_read = stream.max_read();
                let buffered = stream.buffered_bytes().min(max_read);
                let prefix = stream.request_contiguous(buffered).unwrap_or(&[]);
                match probe_header(prefix)? {
                    Probe::NeedMore(n) => {
                        if n as u32 > max_read {
                            return Err(dm_formats::FormatError::MapTooLarge(n).into());
                        }
                        if paused {
                            return Err(EngineError::Navigation("sound ends inside its header"));
                        }
                        trace!(sound, need = n, have = buffered, "waiting for header");
                        return Ok(false);
                    }
                    probe => (probe, stream.buffered_bytes()),
                }
            }
            SoundSource::Resource => {
                let data = ctx.provider.sound_data(sound).ok_or(HostError::NotFound(sound))?;
                match probe_header(data)? {
                    Probe::NeedMore(_) => return Err(dm_formats::FormatError::UnexpectedEof.into()),
                    probe => (probe, 0),
                }
            }
            SoundSource::None => return Err(EngineError::Navigation("dispatch has no source")),
        };

        let header_len = match probe {
            Probe::Imus(header) => {
                self.mode = StreamingMode::CueMap;
                self.map = Some(header.map);
                self.data_start = header.data_start;
                self.current_offset = 0;
                header.data_start
            }
            Probe::Voc(header) => {
                self.mode = StreamingMode::VocChunks;
                self.map = None;
                self.data_start = 0;
                self.current_offset = header.data_start;
                header.data_start
            }
            Probe::Unknown => {
                let bytes = ctx
                    .provider
                    .fetch_map(sound)
                    .ok_or(EngineError::Navigation("sound has no cue map"))?;
                self.mode = StreamingMode::CueMap;
                self.map = Some(parse_map(bytes)?);
                self.data_start = 0;
                self.current_offset = 0;
                0
            }
            Probe::NeedMore(_) => return Ok(false),
        };

        if let Some(stream) = self.source.stream().and_then(|k| ctx.streams.get_mut(k)) {
            stream.advance_read(header_len);
            let left = buffered.saturating_sub(header_len);
            if !self.zones.reset(ctx.zones, self.current_offset, left) {
                return Err(EngineError::Navigation("no stream zone for new sound"));
            }
        }
        self.state = DispatchState::SeekRegion;
        debug!(sound, mode = ?self.mode, data_start = self.data_start, "sound header loaded");

        if let Some(target) = self.sync_target.take() {
            self.resume_at(ctx, target);
        }
        self.predict(track, ctx);
        Ok(true)
    }

    /// Position a freshly loaded cue-map sound inside the region holding
    /// `target`, aligned to the region's format.
    fn resume_at<P>(&mut self, ctx: &mut FeedContext<'_, P>, target: u32) {
        let target = target + self.crossfade.as_ref().map_or(0, |cf| cf.sync_delta());
        let Some(map) = self.map.as_ref() else {
            return;
        };
        let Some((index, _)) = map.region_containing(target) else {
            debug!(target, "sync point outside every region, starting from the top");
            return;
        };
        let (Some(format), Some(block)) = (map.format_before(index), map.get(index)) else {
            return;
        };
        let MapEvent::Region { length } = block.event else {
            return;
        };
        let start = block.offset;
        let aligned = start + format.align_down(target - start);
        self.format = format;
        self.audio_remaining = start + length - aligned;
        self.state = DispatchState::PlayingRegion;
        if aligned != self.current_offset {
            self.seek_to(ctx.streams, ctx.zones, aligned);
        }
    }

    /// Walk map events from the cursor until a region is found.
    fn seek_region<P: SoundProvider>(
        &mut self,
        track: &mut Track,
        ctx: &mut FeedContext<'_, P>,
    ) -> Result<Nav, EngineError> {
        let mut walker = MapWalker::at(self.current_offset);
        let mut jumps = 0;
        loop {
            let map = self.map.as_ref().ok_or(EngineError::Navigation("no map loaded"))?;
            let (index, dest, fade_ms) = match walker.step(map, &mut track.jump_hook, self.predicted_jump)? {
                MapStep::Format(format) => {
                    if !format.is_valid() {
                        return Err(dm_formats::FormatError::UnsupportedFormat {
                            word_size: format.word_size as u32,
                            channels: format.channels as u32,
                        }
                        .into());
                    }
                    self.format = format;
                    continue;
                }
                MapStep::Region(length) => {
                    self.audio_remaining = length;
                    self.state = DispatchState::PlayingRegion;
                    return Ok(Nav::Region);
                }
                MapStep::Text(text) => {
                    queue_marker(ctx.markers, track.sound, *text);
                    continue;
                }
                MapStep::Sync(data) => {
                    track.add_sync(data);
                    continue;
                }
                MapStep::Stop => return Ok(Nav::Stop),
                MapStep::Jump { index, dest, fade_ms } => (index, dest, fade_ms),
            };
            jumps += 1;
            if jumps > MAX_JUMPS_PER_SEEK {
                return Err(EngineError::Navigation("jumps loop without a region"));
            }
            self.take_jump(track.sound, ctx, index, dest, fade_ms);
        }
    }

    /// Move the cursor from a jump at the cursor to `dest`, keeping the
    /// old material as a crossfade.
    fn take_jump<P: SoundProvider>(
        &mut self,
        sound: SoundId,
        ctx: &mut FeedContext<'_, P>,
        index: usize,
        dest: u32,
        fade_ms: u32,
    ) {
        let predicted = self.predicted_jump == Some(index);
        let format = self.format;
        let buffer = if predicted {
            self.predicted_jump = None;
            let fading = self.zones.head(ctx.zones).filter(|z| z.fading).map(|z| z.size);
            let mut buffer = None;
            if let (Some(size), Some(stream)) =
                (fading, self.source.stream().and_then(|k| ctx.streams.get_mut(k)))
            {
                if size > 0 {
                    buffer = ctx.fade_buffers.allocate(size).map(|mut b| {
                        let n = stream.peek_into(b.bytes_mut());
                        b.truncate(n as u32);
                        b
                    });
                }
                stream.advance_read(size);
                self.zones.pop_head(ctx.zones);
            }
            self.current_offset = dest;
            buffer
        } else {
            let buffer = self.capture_fade(sound, fade_ms, ctx.provider, ctx.streams, ctx.zones, ctx.fade_buffers);
            self.seek_to(ctx.streams, ctx.zones, dest);
            buffer
        };
        trace!(sound, dest, predicted, "jump taken");
        if let Some(buffer) = buffer {
            self.start_crossfade(buffer, format, ctx.fade_buffers);
        }
    }

    /// Bytes of the next VOC block header, or `None` while not buffered.
    fn voc_header<'b, P: SoundProvider>(
        &self,
        sound: SoundId,
        provider: &'b P,
        streams: &'b mut StreamBank,
    ) -> Result<(&'b [u8], bool), EngineError> {
        match self.source {
            SoundSource::Stream(key) => {
                let stream = streams.get_mut(key).ok_or(EngineError::NoStream(sound))?;
                let paused = stream.is_paused();
                let n = stream.buffered_bytes().min(VOC_BLOCK_HEADER_MAX);
                Ok((stream.request_contiguous(n).unwrap_or(&[]), paused))
            }
            SoundSource::Resource => {
                let data = provider.sound_data(sound).ok_or(HostError::NotFound(sound))?;
                let start = (self.current_offset as usize).min(data.len());
                let end = (start + VOC_BLOCK_HEADER_MAX as usize).min(data.len());
                Ok((&data[start..end], true))
            }
            SoundSource::None => Err(EngineError::Navigation("dispatch has no source")),
        }
    }

    /// Read VOC block headers from the cursor until sound data is found.
    fn seek_voc_block<P: SoundProvider>(
        &mut self,
        track: &mut Track,
        ctx: &mut FeedContext<'_, P>,
    ) -> Result<Nav, EngineError> {
        let sound = track.sound;
        for _ in 0..MAX_STEPS_PER_FEED {
            if self.voc.skip > 0 {
                let available = match self.source.stream().and_then(|k| ctx.streams.get(k)) {
                    Some(stream) => stream.buffered_bytes(),
                    None => self.voc.skip,
                };
                let n = self.voc.skip.min(available);
                self.skip_bytes(ctx.streams, ctx.zones, n);
                self.voc.skip -= n;
                if self.voc.skip > 0 {
                    return Ok(Nav::Waiting);
                }
            }

            let (bytes, exhausted) = self.voc_header(sound, ctx.provider, ctx.streams)?;
            let Some((block, header_len)) = parse_voc_block(bytes)? else {
                if exhausted {
                    return Err(EngineError::Navigation("VOC data ends inside a block header"));
                }
                return Ok(Nav::Waiting);
            };
            let skip_in_header = header_len.min(VOC_BLOCK_HEADER_MAX);
            self.skip_bytes(ctx.streams, ctx.zones, skip_in_header);
            self.voc.skip = header_len - skip_in_header;

            match block {
                VocBlock::Terminator => return Ok(Nav::Stop),
                VocBlock::SoundData { format, length } => {
                    self.format = format;
                    if length > 0 {
                        self.audio_remaining = length;
                        self.state = DispatchState::PlayingRegion;
                        return Ok(Nav::Region);
                    }
                }
                VocBlock::Continuation { length } => {
                    if length > 0 {
                        self.audio_remaining = length;
                        self.state = DispatchState::PlayingRegion;
                        return Ok(Nav::Region);
                    }
                }
                VocBlock::Marker(number) => {
                    let mut text = MarkerText::new();
                    let _ = write!(text, "{number}");
                    queue_marker(ctx.markers, sound, text);
                }
                VocBlock::RepeatStart(count) => {
                    self.voc.loop_start = Some(self.current_offset + self.voc.skip);
                    self.voc.loop_count = count;
                }
                VocBlock::RepeatEnd => {
                    let Some(start) = self.voc.loop_start else {
                        continue;
                    };
                    let again = if self.voc.loop_count == VOC_REPEAT_FOREVER {
                        !check_hook(&mut track.jump_hook, 0)
                    } else if self.voc.loop_count > 0 {
                        self.voc.loop_count -= 1;
                        true
                    } else {
                        false
                    };
                    if again {
                        self.voc.skip = 0;
                        self.seek_to(ctx.streams, ctx.zones, start);
                    } else {
                        self.voc.loop_start = None;
                    }
                }
                VocBlock::Skip { length } => self.voc.skip += length,
            }
        }
        Ok(Nav::Waiting)
    }

    /// Mix one contiguous run of the current region.
    fn play_chunk<P: SoundProvider>(
        &mut self,
        track: &Track,
        ctx: &mut FeedContext<'_, P>,
        out_left: u32,
        out_offset: u32,
        gain: i32,
    ) -> Result<Chunk, EngineError> {
        let fmt = self.format;
        let want_frames = source_frames(fmt.sample_rate, out_left, track.pitch_shift, ctx.feed_rate);
        let want = fmt.frames_to_bytes(want_frames).max(fmt.block().0).min(self.audio_remaining);

        let (available, exhausted) = match self.source {
            SoundSource::Stream(key) => {
                let stream = ctx.streams.get(key).ok_or(EngineError::NoStream(track.sound))?;
                let zone = self.zones.head(ctx.zones).filter(|z| !z.fading).map_or(0, |z| z.size);
                (zone.min(stream.buffered_bytes()).min(stream.max_read()), stream.is_paused())
            }
            SoundSource::Resource => {
                let data = ctx.provider.sound_data(track.sound).ok_or(HostError::NotFound(track.sound))?;
                let start = (self.data_start + self.current_offset) as usize;
                (data.len().saturating_sub(start) as u32, true)
            }
            SoundSource::None => return Err(EngineError::Navigation("dispatch has no source")),
        };

        let bytes = fmt.align_down(want.min(available));
        if bytes == 0 {
            // A partial block at the end of a region cannot be mixed.
            if self.audio_remaining < fmt.block().0 && available >= self.audio_remaining {
                let stray = self.audio_remaining;
                self.skip_bytes(ctx.streams, ctx.zones, stray);
                self.finish_bytes(stray);
                return Ok(Chunk::Played(0));
            }
            if exhausted {
                warn!(sound = track.sound, remaining = self.audio_remaining, "data ended inside a region");
                return Ok(Chunk::Ended);
            }
            trace!(sound = track.sound, "stream starved");
            return Ok(Chunk::Starved);
        }

        let in_frames = fmt.bytes_to_frames(bytes);
        let span = if in_frames >= want_frames {
            out_left
        } else {
            output_frames(fmt.sample_rate, in_frames, track.pitch_shift, ctx.feed_rate).clamp(1, out_left)
        };

        match self.source {
            SoundSource::Stream(key) => {
                let stream = ctx.streams.get_mut(key).ok_or(EngineError::NoStream(track.sound))?;
                let data = stream
                    .request_contiguous(bytes)
                    .ok_or(EngineError::Navigation("buffered bytes vanished"))?;
                ctx.mixer.mix(data, in_frames, fmt, span, out_offset, gain, track.pan);
            }
            _ => {
                let data = ctx.provider.sound_data(track.sound).ok_or(HostError::NotFound(track.sound))?;
                let start = (self.data_start + self.current_offset) as usize;
                ctx.mixer.mix(&data[start..start + bytes as usize], in_frames, fmt, span, out_offset, gain, track.pan);
            }
        }
        self.skip_bytes(ctx.streams, ctx.zones, bytes);
        self.finish_bytes(bytes);
        Ok(Chunk::Played(span))
    }

    fn finish_bytes(&mut self, n: u32) {
        self.audio_remaining -= n.min(self.audio_remaining);
        if self.audio_remaining == 0 {
            self.state = DispatchState::SeekRegion;
        }
    }

    /// Persistent part of this dispatch.
    pub fn record(&self) -> DispatchRecord {
        DispatchRecord {
            state: self.state,
            mode: self.mode,
            format: self.format,
            current_offset: self.current_offset,
            audio_remaining: self.audio_remaining,
            data_start: self.data_start,
            map: self.map.clone(),
            has_stream: matches!(self.source, SoundSource::Stream(_)),
            voc: self.voc,
        }
    }

    /// Rebuild from a record. A streamed sound gets `stream`, positioned at
    /// the saved cursor with one empty zone; in-flight crossfades are gone.
    pub fn from_record(
        record: DispatchRecord,
        stream: Option<StreamKey>,
        streams: &mut StreamBank,
        zones: &mut ZonePool,
    ) -> Self {
        let source = match stream {
            Some(key) => SoundSource::Stream(key),
            None => SoundSource::Resource,
        };
        let mut dispatch = Self {
            state: record.state,
            mode: record.mode,
            source,
            format: record.format,
            current_offset: record.current_offset,
            audio_remaining: record.audio_remaining,
            data_start: record.data_start,
            map: record.map,
            voc: record.voc,
            ..Default::default()
        };
        if let Some(s) = stream.and_then(|k| streams.get_mut(k)) {
            let offset = if dispatch.state == DispatchState::NeedMap {
                0
            } else {
                dispatch.data_start + dispatch.current_offset
            };
            s.set_file_offset(offset);
            if dispatch.state != DispatchState::NeedMap {
                dispatch.zones.reset(zones, dispatch.current_offset, 0);
            }
        }
        dispatch
    }
}

/// Saved form of a [`Dispatch`]. Ring contents are not part of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub state: DispatchState,
    pub mode: StreamingMode,
    pub format: AudioFormat,
    pub current_offset: u32,
    pub audio_remaining: u32,
    pub data_start: u32,
    pub map: Option<CueMap>,
    pub has_stream: bool,
    pub voc: VocCursor,
}
