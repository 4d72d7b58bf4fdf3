//! The sequencer: owns every pool and drives them from two cadences.
//!
//! [`Engine::tick`] is the heartbeat (fades, defers, ducking) and
//! [`Engine::render`] is the audio callback (stream fetches, dispatch
//! feeds, marker triggers, final mix). Both expect exclusive access; see
//! [`SharedEngine`](crate::SharedEngine) for the locked handle.

use alloc::vec::Vec;

use dm_ir::{BufferCategory, Group, MarkerText, ParamId, SoundId};
use heapless::Vec as HVec;
use tracing::{debug, error, trace, warn};

use crate::command::{Command, CommandOutput, TriggerAction, TriggerFilter};
use crate::config::{EngineConfig, MAX_FEED_FRAMES};
use crate::crossfade::FadeBufferPool;
use crate::dispatch::{Dispatch, DispatchState, Feed, FeedContext, MarkerQueue, SoundSource, StreamingMode};
use crate::error::EngineError;
use crate::fades::{FadeEngine, FadePush, FadeStart, MAX_FADES};
use crate::host::SoundProvider;
use crate::mixer::{preferred_feed_size, Mixer};
use crate::music::{MusicAction, MusicScript, MusicTable, MUSIC_PRIORITY};
use crate::ring_stream::{StreamBank, StreamInfo, StreamSource};
use crate::save_state::{SaveState, StreamRecord, TrackRecord, SAVE_MAGIC, SAVE_VERSION};
use crate::tracks::{Allocation, Track, TrackScheduler, MAX_SYNC, MAX_TRACKS};
use crate::triggers::TriggerEngine;
use crate::zones::{ZonePool, MAX_ZONES};

const FULL_VOLUME: i32 = 127;

/// Group that streams through `category`.
fn group_for(category: BufferCategory) -> Group {
    match category {
        BufferCategory::Speech => Group::Speech,
        BufferCategory::Music => Group::Music,
        BufferCategory::Sfx => Group::Sfx,
    }
}

/// Volume a track of `group` at `vol` is mixed with. Music follows the
/// ducked music volume instead of its group volume.
fn effective_volume(vol: i32, group: Group, group_vol: &[i32; 3], music_eff_vol: i32) -> i32 {
    let gain = match group {
        Group::Music => music_eff_vol,
        other => group_vol[other.index()],
    };
    vol * gain / FULL_VOLUME
}

pub struct Engine<P: SoundProvider> {
    config: EngineConfig,
    provider: P,
    paused: bool,
    tracks: TrackScheduler,
    /// Indexed by track slot.
    dispatches: Vec<Dispatch>,
    streams: StreamBank,
    zones: ZonePool,
    fades: FadeEngine,
    triggers: TriggerEngine,
    mixer: Mixer,
    fade_buffers: FadeBufferPool,
    markers: MarkerQueue,
    group_vol: [i32; 3],
    music_eff_vol: i32,
    duck_counter: u32,
    music: MusicScript,
    feed_frames: u32,
    open_speech: Option<SoundId>,
}

impl<P: SoundProvider> Engine<P> {
    pub fn new(config: EngineConfig, provider: P) -> Result<Self, EngineError> {
        config.validate()?;
        let feed_frames = config.output.feed_frames.clamp(1, MAX_FEED_FRAMES);
        Ok(Self {
            provider,
            paused: false,
            tracks: TrackScheduler::new(),
            dispatches: (0..MAX_TRACKS).map(|_| Dispatch::default()).collect(),
            streams: StreamBank::new(config.streams),
            zones: ZonePool::with_capacity(MAX_ZONES),
            fades: FadeEngine::new(),
            triggers: TriggerEngine::new(),
            mixer: Mixer::new(&config.output),
            fade_buffers: FadeBufferPool::new(&config.fade_buffers),
            markers: MarkerQueue::new(),
            group_vol: [FULL_VOLUME; 3],
            music_eff_vol: FULL_VOLUME,
            duck_counter: 0,
            music: MusicScript::new(),
            feed_frames,
            open_speech: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Stop everything and return to the startup state. The music table
    /// stays loaded; its scalars are reset.
    pub fn init(&mut self) {
        self.stop_all_sounds();
        self.provider.close_all_sounds();
        self.fades = FadeEngine::new();
        self.triggers.clear_all();
        self.markers.clear();
        self.group_vol = [FULL_VOLUME; 3];
        self.music_eff_vol = FULL_VOLUME;
        self.duck_counter = 0;
        self.paused = false;
        self.open_speech = None;
        self.music.restore(Default::default());
        debug!("engine initialized");
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // --- volumes ---

    /// Set the volume of `group`, or only read it with `None`. Returns the
    /// previous volume.
    pub fn set_group_vol(&mut self, group: Group, volume: Option<i32>) -> Result<i32, EngineError> {
        let previous = self.group_vol[group.index()];
        let Some(volume) = volume else {
            return Ok(previous);
        };
        if !(0..=FULL_VOLUME).contains(&volume) {
            return Err(EngineError::InvalidValue { param: ParamId::Volume, value: volume });
        }
        self.group_vol[group.index()] = volume;
        if group == Group::Music {
            self.music_eff_vol = if self.speech_active() {
                self.music_eff_vol.min(volume)
            } else {
                volume
            };
        }
        self.refresh_volumes();
        Ok(previous)
    }

    pub fn group_volume(&self, group: Group) -> i32 {
        self.group_vol[group.index()]
    }

    /// Music volume after ducking.
    pub fn music_effective_volume(&self) -> i32 {
        self.music_eff_vol
    }

    fn speech_active(&self) -> bool {
        self.tracks.iter().any(|(_, t)| t.group == Group::Speech)
    }

    fn refresh_volumes(&mut self) {
        let (group_vol, music) = (self.group_vol, self.music_eff_vol);
        for index in self.tracks.indices() {
            if let Some(track) = self.tracks.get_mut(index) {
                track.eff_vol = effective_volume(track.vol, track.group, &group_vol, music);
            }
        }
    }

    /// One ducking step: move the music volume toward its ducked level
    /// while speech plays, back to the music group volume otherwise.
    fn duck(&mut self) {
        let music_vol = self.group_vol[Group::Music.index()];
        let ducking = self.config.ducking;
        let target = if self.speech_active() {
            music_vol * ducking.target_num / 128
        } else {
            music_vol
        };
        let current = self.music_eff_vol;
        let next = if current > target {
            (current - ducking.attack_step).max(target)
        } else {
            (current + ducking.release_step).min(target)
        };
        if next != current {
            trace!(from = current, to = next, "music ducking");
            self.music_eff_vol = next;
            self.refresh_volumes();
        }
    }

    // --- sounds ---

    /// Source for a new sound: its whole resource when the provider has
    /// one, otherwise a stream in `category`. A busy category is taken
    /// from its owner if `priority` is at least the owner's.
    fn open_source(
        &mut self,
        sound: SoundId,
        priority: i32,
        category: BufferCategory,
        kind: StreamSource,
    ) -> Result<SoundSource, EngineError> {
        if kind == StreamSource::File && self.provider.sound_data(sound).is_some() {
            return Ok(SoundSource::Resource);
        }
        if let Some(owner) = self.streams.owner_of(category) {
            match self.tracks.by_sound(owner).map(|t| t.priority) {
                Some(owner_priority) if priority < owner_priority => {
                    warn!(sound, owner, ?category, "stream buffer held by higher priority sound");
                    return Err(EngineError::NoStream(sound));
                }
                Some(_) => {
                    debug!(sound, owner, ?category, "taking stream buffer");
                    self.stop_sound(owner)?;
                }
                None => {
                    if let Some(key) = self.streams.find_sound(owner) {
                        self.streams.release(key);
                    }
                }
            }
        }
        if kind == StreamSource::File {
            self.provider.open_sound(sound)?;
        }
        match self.streams.allocate(sound, category, kind) {
            Ok(key) => Ok(SoundSource::Stream(key)),
            Err(e) => {
                if kind == StreamSource::File {
                    self.provider.close_sound(sound);
                }
                Err(e)
            }
        }
    }

    fn release_source(&mut self, sound: SoundId, source: SoundSource) {
        if let SoundSource::Stream(key) = source {
            let file = self.streams.get(key).is_some_and(|s| s.source == StreamSource::File);
            self.streams.release(key);
            if file {
                self.provider.close_sound(sound);
            }
        }
    }

    fn launch(
        &mut self,
        sound: SoundId,
        priority: i32,
        group: Group,
        kind: StreamSource,
    ) -> Result<(), EngineError> {
        if sound == 0 {
            return Err(EngineError::InvalidSound(sound));
        }
        let priority = priority.clamp(0, 127);
        // Refuse before touching any stream.
        self.tracks.plan_allocation(sound, priority)?;
        let source = self.open_source(sound, priority, BufferCategory::for_group(group), kind)?;
        let placed = match self.tracks.plan_allocation(sound, priority) {
            Ok(Allocation::Free) => Ok(()),
            Ok(Allocation::Evict(victim)) => self.stop_sound(victim),
            Err(e) => Err(e),
        };
        if let Err(e) = placed {
            self.release_source(sound, source);
            return Err(e);
        }

        let mut track = Track::new(sound, priority, group);
        track.eff_vol = effective_volume(track.vol, group, &self.group_vol, self.music_eff_vol);
        let index = match self.tracks.insert(track) {
            Ok(index) => index,
            Err(e) => {
                self.release_source(sound, source);
                return Err(e);
            }
        };
        self.dispatches[index] = Dispatch::new(source);
        if group == Group::Speech && source.stream().is_some() {
            self.open_speech = Some(sound);
        }
        debug!(sound, priority, ?group, ?source, "sound started");
        Ok(())
    }

    pub fn start_sound(&mut self, sound: SoundId, priority: i32, group: Group) -> Result<(), EngineError> {
        self.launch(sound, priority, group, StreamSource::File)
    }

    /// Start a sound whose bytes the caller pushes with
    /// [`feed_stream`](Self::feed_stream).
    pub fn start_stream(
        &mut self,
        sound: SoundId,
        priority: i32,
        category: BufferCategory,
    ) -> Result<(), EngineError> {
        self.launch(sound, priority, group_for(category), StreamSource::Fed)
    }

    pub fn stop_sound(&mut self, sound: SoundId) -> Result<(), EngineError> {
        let index = self.tracks.find(sound).ok_or(EngineError::NotPlaying(sound))?;
        self.clear_track(index);
        Ok(())
    }

    pub fn stop_all_sounds(&mut self) {
        for index in self.tracks.indices() {
            self.clear_track(index);
        }
    }

    /// Unlink a track and release everything it holds.
    fn clear_track(&mut self, index: usize) {
        let Some(track) = self.tracks.remove(index) else {
            return;
        };
        let mut dispatch = core::mem::take(&mut self.dispatches[index]);
        dispatch.release(&mut self.zones, &mut self.fade_buffers);
        self.release_source(track.sound, dispatch.source);
        self.fades.clear(Some(track.sound), None);
        self.triggers.clear_sound(track.sound);
        if self.open_speech == Some(track.sound) {
            self.open_speech = None;
        }
        debug!(sound = track.sound, "track cleared");
    }

    /// Smallest active sound id above `sound`; start from 0 to enumerate.
    pub fn get_next_sound(&self, sound: SoundId) -> Option<SoundId> {
        self.tracks.next_sound(sound)
    }

    pub fn track(&self, sound: SoundId) -> Option<&Track> {
        self.tracks.by_sound(sound)
    }

    pub fn dispatch(&self, sound: SoundId) -> Option<&Dispatch> {
        self.tracks.find(sound).map(|index| &self.dispatches[index])
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    // --- parameters ---

    pub fn set_param(&mut self, sound: SoundId, param: ParamId, value: i32) -> Result<(), EngineError> {
        let index = self.tracks.find(sound).ok_or(EngineError::NotPlaying(sound))?;
        let (group_vol, music) = (self.group_vol, self.music_eff_vol);
        let track = self.tracks.get_mut(index).ok_or(EngineError::NotPlaying(sound))?;
        track.set_param(param, value)?;
        if matches!(param, ParamId::Volume | ParamId::Group) {
            track.eff_vol = effective_volume(track.vol, track.group, &group_vol, music);
        }
        Ok(())
    }

    /// Stored or derived parameter of a sound. An inactive sound reads 0.
    ///
    /// `StreamCategory` is 0 without a stream, else the category index
    /// plus one.
    pub fn get_param(&self, sound: SoundId, param: ParamId) -> Result<i32, EngineError> {
        let Some(index) = self.tracks.find(sound) else {
            return Ok(0);
        };
        let track = self.tracks.get(index).ok_or(EngineError::NotPlaying(sound))?;
        let dispatch = &self.dispatches[index];
        let stream = dispatch.source.stream().and_then(|k| self.streams.get(k));
        Ok(match param {
            ParamId::HasStream => stream.is_some() as i32,
            ParamId::StreamCategory => stream.map_or(0, |s| s.category.index() as i32 + 1),
            ParamId::PositionMs => dispatch.position_ms(),
            other => track.param(other).ok_or(EngineError::InvalidParam(other))?,
        })
    }

    pub fn fade_param(
        &mut self,
        sound: SoundId,
        param: ParamId,
        target: i32,
        ticks: i32,
    ) -> Result<(), EngineError> {
        if sound == 0 {
            return Err(EngineError::InvalidSound(sound));
        }
        let current = self
            .tracks
            .by_sound(sound)
            .ok_or(EngineError::NotPlaying(sound))?
            .param(param)
            .ok_or(EngineError::InvalidParam(param))?;
        if let Some((lo, hi)) = param.range() {
            if !(lo..=hi).contains(&target) {
                return Err(EngineError::InvalidValue { param, value: target });
            }
        }
        match self.fades.start(sound, param, current, target, ticks)? {
            FadeStart::Immediate(value) => self.set_param(sound, param, value),
            FadeStart::Stop => self.stop_sound(sound),
            FadeStart::Started => Ok(()),
        }
    }

    pub fn fades(&self) -> &FadeEngine {
        &self.fades
    }

    pub fn set_hook(&mut self, sound: SoundId, hook: i32) -> Result<(), EngineError> {
        let track = self.tracks.by_sound_mut(sound).ok_or(EngineError::NotPlaying(sound))?;
        track.jump_hook = hook;
        Ok(())
    }

    pub fn get_hook(&self, sound: SoundId) -> Result<i32, EngineError> {
        self.tracks
            .by_sound(sound)
            .map(|t| t.jump_hook)
            .ok_or(EngineError::NotPlaying(sound))
    }

    // --- triggers ---

    /// Run `action` when `sound` reaches marker `marker`; an empty marker
    /// matches any.
    pub fn set_trigger(&mut self, sound: SoundId, marker: &str, action: TriggerAction) -> Result<(), EngineError> {
        let marker = MarkerText::from(marker).map_err(|_| EngineError::MarkerTooLong(marker.len()))?;
        self.triggers.set(sound, marker, action)
    }

    pub fn check_trigger(&self, filter: &TriggerFilter) -> usize {
        self.triggers.check(filter)
    }

    pub fn clear_trigger(&mut self, filter: &TriggerFilter) {
        self.triggers.clear(filter);
    }

    pub fn defer_command(&mut self, ticks: i32, action: TriggerAction) -> Result<(), EngineError> {
        self.triggers.defer(ticks, action)
    }

    pub fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    fn run_action(&mut self, action: TriggerAction) {
        let result = match action {
            TriggerAction::StopSequence => {
                self.music.stop_sequence().and_then(|a| self.apply_music(a))
            }
            TriggerAction::Command(cmd) => self.execute(*cmd).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(error = %e, "trigger action failed");
        }
    }

    /// Fire triggers for the markers queued by the last feed.
    fn process_markers(&mut self) {
        while let Some((sound, text)) = self.markers.pop_front() {
            trace!(sound, marker = text.as_str(), "marker reached");
            self.triggers.begin_processing();
            let mut cursor = 0;
            while let Some(action) = self.triggers.next_match(&mut cursor, sound, text.as_str()) {
                self.run_action(action);
            }
            self.triggers.end_processing();
        }
    }

    // --- streams ---

    /// Run `f` on the track in slot `index` with its dispatch and the
    /// pools it feeds from.
    fn with_track<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut Dispatch, &mut Track, &mut FeedContext<'_, P>) -> R,
    ) -> Option<R> {
        let Self { provider, streams, zones, mixer, fade_buffers, markers, tracks, dispatches, config, .. } =
            self;
        let track = tracks.get_mut(index)?;
        let dispatch = dispatches.get_mut(index)?;
        let mut ctx = FeedContext {
            provider,
            streams,
            zones,
            mixer,
            fade_buffers,
            markers,
            feed_rate: config.output.sample_rate,
        };
        Some(f(dispatch, track, &mut ctx))
    }

    /// Fetch the neediest file streams. A stream that fails to read is
    /// cleared with its track.
    pub fn process_streams(&mut self) {
        for key in self.streams.fetch_order() {
            let Some(stream) = self.streams.get_mut(key) else {
                continue;
            };
            let sound = stream.sound;
            let result = stream.fetch(&mut self.provider);
            let Some(index) = self.tracks.find(sound) else {
                continue;
            };
            match result {
                Ok(n) => {
                    self.with_track(index, |d, t, ctx| d.on_loaded(t, ctx, n));
                }
                Err(e) => {
                    error!(sound, error = %e, "stream fetch failed");
                    self.clear_track(index);
                }
            }
        }
    }

    pub fn query_stream(&self, sound: SoundId) -> Result<StreamInfo, EngineError> {
        let index = self.tracks.find(sound).ok_or(EngineError::NotPlaying(sound))?;
        self.dispatches[index]
            .source
            .stream()
            .and_then(|k| self.streams.get(k))
            .map(|s| s.info())
            .ok_or(EngineError::NoStream(sound))
    }

    /// Push bytes into a stream started with
    /// [`start_stream`](Self::start_stream). `paused` marks the end of the
    /// data. Returns bytes accepted.
    pub fn feed_stream(&mut self, sound: SoundId, data: &[u8], paused: bool) -> Result<u32, EngineError> {
        let index = self.tracks.find(sound).ok_or(EngineError::NotPlaying(sound))?;
        let key = self.dispatches[index].source.stream().ok_or(EngineError::NoStream(sound))?;
        let stream = self.streams.get_mut(key).ok_or(EngineError::NoStream(sound))?;
        if stream.source != StreamSource::Fed {
            return Err(EngineError::Navigation("sound is not a fed stream"));
        }
        let n = stream.feed(data, paused);
        self.with_track(index, |d, t, ctx| d.on_loaded(t, ctx, n));
        Ok(n)
    }

    /// Replace the sound a track plays, crossfading from the current
    /// material over `fade_ms`. With `sync` the new sound resumes at the
    /// old logical offset.
    pub fn switch_stream(
        &mut self,
        old: SoundId,
        new: SoundId,
        fade_ms: u32,
        sync: bool,
    ) -> Result<(), EngineError> {
        if new == 0 {
            return Err(EngineError::InvalidSound(new));
        }
        let index = self.tracks.find(old).ok_or(EngineError::NotPlaying(old))?;
        if self.tracks.find(new).is_some() {
            return Err(EngineError::AlreadyPlaying(new));
        }
        let (group, priority) = self
            .tracks
            .get(index)
            .map(|t| (t.group, t.priority))
            .ok_or(EngineError::NotPlaying(old))?;

        let dispatch = &self.dispatches[index];
        let buffer =
            dispatch.capture_fade(old, fade_ms, &self.provider, &self.streams, &self.zones, &mut self.fade_buffers);
        let format = dispatch.format;
        let sync_offset = (sync
            && dispatch.state != DispatchState::NeedMap
            && dispatch.mode == StreamingMode::CueMap)
            .then_some(dispatch.current_offset);
        let old_source = dispatch.source;
        let (category, kind) = match old_source.stream().and_then(|k| self.streams.get(k)) {
            Some(stream) => (stream.category, stream.source),
            None => (BufferCategory::for_group(group), StreamSource::File),
        };
        self.release_source(old, old_source);
        self.dispatches[index].source = SoundSource::None;

        let source = match self.open_source(new, priority, category, kind) {
            Ok(source) => source,
            Err(e) => {
                if let Some(buffer) = buffer {
                    self.fade_buffers.release(buffer);
                }
                warn!(old, new, error = %e, "switch failed, stopping track");
                self.clear_track(index);
                return Err(e);
            }
        };

        let dispatch = &mut self.dispatches[index];
        dispatch.restart(source, &mut self.zones);
        if let Some(buffer) = buffer {
            dispatch.start_crossfade(buffer, format, &mut self.fade_buffers);
        }
        if let Some(offset) = sync_offset {
            dispatch.sync_to(offset);
        }
        if let Some(track) = self.tracks.get_mut(index) {
            track.sound = new;
            track.sync = Default::default();
        }
        self.fades.rekey(old, new);
        if self.open_speech == Some(old) {
            self.open_speech = Some(new);
        }
        debug!(old, new, fade_ms, sync, "stream switched");
        Ok(())
    }

    /// Lip-sync shape of `sound` at `ms`: the last `(width, height)` entry
    /// of sync buffer `sync_id` at or before that time, `(0, 0)` if none.
    pub fn lip_sync(&self, sound: SoundId, sync_id: usize, ms: i32) -> Result<(i32, i32), EngineError> {
        if sync_id >= MAX_SYNC {
            return Err(EngineError::InvalidSyncId(sync_id));
        }
        let track = self.tracks.by_sound(sound).ok_or(EngineError::NotPlaying(sound))?;
        // Entry times are in 1/60 s.
        let now = ms.max(0) as i64 * 60 / 1000;
        let mut shape = (0, 0);
        for entry in track.sync[sync_id].chunks_exact(4) {
            let time = u16::from_be_bytes([entry[0], entry[1]]) as i64;
            if time > now {
                break;
            }
            shape = (entry[2] as i32, entry[3] as i32);
        }
        Ok(shape)
    }

    // --- cadences ---

    /// One heartbeat: step fades, count down defers, and every few beats
    /// step the speech ducking.
    pub fn tick(&mut self) {
        if self.paused {
            return;
        }
        let mut pushes: HVec<FadePush, MAX_FADES> = HVec::new();
        // One push per slot at most.
        self.fades.tick(|push| {
            let _ = pushes.push(push);
        });
        for push in pushes {
            let result = match push {
                FadePush::Set { sound, param, value } => self.set_param(sound, param, value),
                FadePush::Stop(sound) => self.stop_sound(sound),
            };
            if let Err(e) = result {
                debug!(error = %e, "fade push dropped");
            }
        }

        for action in self.triggers.tick_defers() {
            self.run_action(action);
        }

        self.duck_counter += 1;
        if self.duck_counter >= self.config.ducking_divider() {
            self.duck_counter = 0;
            self.duck();
        }
    }

    /// Feed size in frames for a sink whose optimal buffer is
    /// `optimal_bytes`.
    pub fn preferred_feed_size(&self, optimal_bytes: u32) -> u32 {
        preferred_feed_size(optimal_bytes, &self.config.output)
    }

    pub fn set_feed_frames(&mut self, frames: u32) {
        self.feed_frames = frames.clamp(1, MAX_FEED_FRAMES);
    }

    pub fn feed_frames(&self) -> u32 {
        self.feed_frames
    }

    /// Fill `out` with whole frames of output PCM. Returns bytes written.
    pub fn render(&mut self, out: &mut [u8]) -> usize {
        let frame_bytes = self.mixer.out_frame_bytes();
        let total = out.len() / frame_bytes;
        let silence = if self.config.output.word_size == 8 { 0x80 } else { 0 };
        let mut done = 0;
        while done < total {
            let frames = (total - done).min(self.feed_frames as usize);
            let span = &mut out[done * frame_bytes..(done + frames) * frame_bytes];
            if self.paused {
                span.fill(silence);
            } else {
                self.process_streams();
                self.feed_tracks(frames as u32);
                self.mixer.loop_out(span, frames as u32);
            }
            done += frames;
        }
        done * frame_bytes
    }

    fn feed_tracks(&mut self, frames: u32) {
        for index in self.tracks.indices() {
            let Some(sound) = self.tracks.get(index).map(|t| t.sound) else {
                continue;
            };
            match self.with_track(index, |d, t, ctx| d.feed(t, ctx, frames)) {
                Some(Ok(Feed::Played | Feed::Starved)) | None => {}
                Some(Ok(Feed::Ended)) => {
                    trace!(sound, "sound ended");
                    self.clear_track(index);
                }
                Some(Err(e)) => {
                    error!(sound, error = %e, "sound failed, clearing track");
                    self.clear_track(index);
                }
            }
            self.process_markers();
        }
    }

    // --- music script ---

    pub fn init_music(&mut self, table: MusicTable) -> Result<(), EngineError> {
        self.music.init(table)
    }

    pub fn music(&self) -> &MusicScript {
        &self.music
    }

    pub fn set_music_state(&mut self, state: i32) -> Result<(), EngineError> {
        let action = self.music.set_state(state)?;
        self.apply_music(action)
    }

    pub fn set_music_sequence(&mut self, sequence: i32) -> Result<(), EngineError> {
        let action = self.music.set_sequence(sequence)?;
        self.apply_music(action)
    }

    pub fn set_music_attribute(&mut self, index: usize, value: i32) -> Result<(), EngineError> {
        self.music.set_attribute(index, value)
    }

    fn apply_music(&mut self, action: MusicAction) -> Result<(), EngineError> {
        match action {
            MusicAction::Nothing => Ok(()),
            MusicAction::Start(sound) => {
                if self.tracks.find(sound).is_some() {
                    return Ok(());
                }
                self.start_sound(sound, MUSIC_PRIORITY, Group::Music)
            }
            MusicAction::Switch { from, to, fade_ms } => {
                if self.tracks.find(from).is_some() {
                    self.switch_stream(from, to, fade_ms, false)
                } else {
                    self.apply_music(MusicAction::Start(to))
                }
            }
            MusicAction::Stop(sound) => {
                if self.tracks.find(sound).is_some() {
                    self.stop_sound(sound)?;
                }
                Ok(())
            }
        }
    }

    // --- save data ---

    pub fn snapshot(&self) -> SaveState {
        let tracks = self
            .tracks
            .iter()
            .map(|(index, track)| {
                let dispatch = &self.dispatches[index];
                let stream = dispatch
                    .source
                    .stream()
                    .and_then(|k| self.streams.get(k))
                    .map(|s| StreamRecord { category: s.category, fed: s.source == StreamSource::Fed });
                let mut track = track.clone();
                track.jump_hook = dispatch.unconsumed_hook(track.jump_hook);
                TrackRecord { track, dispatch: dispatch.record(), stream }
            })
            .collect();
        SaveState {
            magic: SAVE_MAGIC,
            version: SAVE_VERSION,
            open_speech: self.open_speech,
            fades: *self.fades.slots(),
            triggers: self.triggers.triggers().clone(),
            defers: self.triggers.defers().clone(),
            tracks,
            group_volumes: self.group_vol,
            music_eff_vol: self.music_eff_vol,
            music: self.music.record().clone(),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, EngineError> {
        self.snapshot().encode()
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let state = SaveState::decode(bytes)?;
        self.restore_state(state);
        Ok(())
    }

    /// Replace all runtime state with `state`. Streams are reopened at
    /// their saved positions; a track whose stream cannot be reopened is
    /// dropped.
    pub fn restore_state(&mut self, state: SaveState) {
        self.stop_all_sounds();
        self.provider.close_all_sounds();
        self.markers.clear();
        self.fades.restore(state.fades);
        self.triggers.restore(state.triggers, state.defers);
        self.group_vol = state.group_volumes;
        self.music_eff_vol = state.music_eff_vol;
        self.music.restore(state.music);
        self.open_speech = state.open_speech;
        self.duck_counter = 0;

        for record in state.tracks {
            let sound = record.track.sound;
            let stream = match record.stream {
                Some(saved) => match self.reopen_stream(sound, saved) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(sound, error = %e, "cannot reopen stream, dropping track");
                        self.forget_sound(sound);
                        continue;
                    }
                },
                None => None,
            };
            let index = match self.tracks.insert(record.track) {
                Ok(index) => index,
                Err(e) => {
                    warn!(sound, error = %e, "no track for saved sound");
                    if let Some(key) = stream {
                        self.release_source(sound, SoundSource::Stream(key));
                    }
                    self.forget_sound(sound);
                    continue;
                }
            };
            self.dispatches[index] =
                Dispatch::from_record(record.dispatch, stream, &mut self.streams, &mut self.zones);
        }
        self.refresh_volumes();
        debug!(tracks = self.tracks.len(), "state restored");
    }

    /// Drop restored fades and triggers of a sound that did not come back.
    fn forget_sound(&mut self, sound: SoundId) {
        self.fades.clear(Some(sound), None);
        self.triggers.clear_sound(sound);
    }

    fn reopen_stream(
        &mut self,
        sound: SoundId,
        saved: StreamRecord,
    ) -> Result<crate::ring_stream::StreamKey, EngineError> {
        let kind = if saved.fed { StreamSource::Fed } else { StreamSource::File };
        if kind == StreamSource::File {
            self.provider.open_sound(sound)?;
        }
        self.streams.allocate(sound, saved.category, kind)
    }

    // --- command surface ---

    pub fn execute(&mut self, command: Command) -> Result<CommandOutput, EngineError> {
        use CommandOutput::{Done, Value};
        Ok(match command {
            Command::Init => {
                self.init();
                Done
            }
            Command::Pause => {
                self.pause();
                Done
            }
            Command::Resume => {
                self.resume();
                Done
            }
            Command::SetGroupVol { group, volume } => Value(self.set_group_vol(group, volume)?),
            Command::StartSound { sound, priority, group } => {
                self.start_sound(sound, priority, group)?;
                Done
            }
            Command::StopSound { sound } => {
                self.stop_sound(sound)?;
                Done
            }
            Command::StopAllSounds => {
                self.stop_all_sounds();
                Done
            }
            Command::GetNextSound { sound } => CommandOutput::Sound(self.get_next_sound(sound)),
            Command::SetParam { sound, param, value } => {
                self.set_param(sound, param, value)?;
                Done
            }
            Command::GetParam { sound, param } => Value(self.get_param(sound, param)?),
            Command::FadeParam { sound, param, target, ticks } => {
                self.fade_param(sound, param, target, ticks)?;
                Done
            }
            Command::SetHook { sound, hook } => {
                self.set_hook(sound, hook)?;
                Done
            }
            Command::GetHook { sound } => Value(self.get_hook(sound)?),
            Command::SetTrigger { sound, marker, action } => {
                self.triggers.set(sound, marker, action)?;
                Done
            }
            Command::CheckTrigger(filter) => Value(self.check_trigger(&filter) as i32),
            Command::ClearTrigger(filter) => {
                self.clear_trigger(&filter);
                Done
            }
            Command::DeferCommand { ticks, action } => {
                self.defer_command(ticks, action)?;
                Done
            }
            Command::StartStream { sound, priority, category } => {
                self.start_stream(sound, priority, category)?;
                Done
            }
            Command::SwitchStream { old, new, fade_ms, sync } => {
                self.switch_stream(old, new, fade_ms, sync)?;
                Done
            }
            Command::ProcessStreams => {
                self.process_streams();
                Done
            }
            Command::QueryStream { sound } => CommandOutput::Stream(self.query_stream(sound)?),
            Command::FeedStream { sound, data, paused } => Value(self.feed_stream(sound, &data, paused)? as i32),
            Command::LipSync { sound, sync_id, ms } => {
                let (width, height) = self.lip_sync(sound, sync_id, ms)?;
                CommandOutput::LipSync { width, height }
            }
        })
    }
}
