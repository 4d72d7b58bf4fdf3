//! Allocation-free render path tests.
//!
//! These tests verify that `Engine::render()` and `Engine::tick()` do not
//! allocate once every sound's header has been parsed. They mix several
//! source formats, streamed and in-memory, with fades and ducking running.
//!
//! Runs under plain `cargo test`; no feature flags needed.

use assert_no_alloc::{assert_no_alloc, AllocDisabler};

#[cfg(debug_assertions)]
#[global_allocator]
static A: AllocDisabler = AllocDisabler;

use dm_engine::{Engine, EngineConfig, MemoryProvider};
use dm_formats::build_imus;
use dm_ir::{AudioFormat, CueMap, Group, ParamId};

const RATE: u32 = 22050;

fn sound(format: AudioFormat, seconds: u32) -> Vec<u8> {
    let len = format.frames_to_bytes(format.sample_rate * seconds);
    let pcm: Vec<u8> = (0..len).map(|i| (i % 97) as u8 + 80).collect();
    build_imus(&CueMap::linear(format, len), &pcm)
}

fn engine() -> Engine<MemoryProvider> {
    let mut provider = MemoryProvider::new();
    provider.insert_resource(1, sound(AudioFormat::new(8, 11025, 1), 8));
    provider.insert_resource(2, sound(AudioFormat::new(12, 22050, 2), 8));
    provider.insert_streamed(3, sound(AudioFormat::new(16, 22050, 2), 8));
    provider.insert_streamed(4, sound(AudioFormat::new(8, 22050, 1), 8));
    Engine::new(EngineConfig::default(), provider).unwrap()
}

/// Render `seconds` of output with a heartbeat every 441 frames, aborting
/// on any heap allocation.
fn assert_render_alloc_free(engine: &mut Engine<MemoryProvider>, seconds: u32) {
    let mut out = vec![0u8; 441 * 4];
    // First blocks parse the cue maps.
    for _ in 0..4 {
        engine.render(&mut out);
    }

    assert_no_alloc(|| {
        for _ in 0..(RATE * seconds / 441) {
            engine.render(&mut out);
            engine.tick();
        }
    });
}

#[test]
fn mixed_sources_alloc_free() {
    let mut engine = engine();
    engine.start_sound(1, 50, Group::Sfx).unwrap();
    engine.start_sound(2, 50, Group::Sfx).unwrap();
    engine.start_sound(3, 50, Group::Music).unwrap();
    engine.start_sound(4, 50, Group::Speech).unwrap();
    assert_render_alloc_free(&mut engine, 5);
    assert_eq!(engine.active_count(), 4);
}

#[test]
fn fades_and_ducking_alloc_free() {
    let mut engine = engine();
    engine.start_sound(3, 50, Group::Music).unwrap();
    engine.start_sound(4, 50, Group::Speech).unwrap();
    engine.start_sound(1, 50, Group::Sfx).unwrap();
    engine.fade_param(1, ParamId::Pan, 0, 100).unwrap();
    engine.fade_param(4, ParamId::Volume, 20, 150).unwrap();
    engine.set_param(1, ParamId::Transpose, -12).unwrap();
    assert_render_alloc_free(&mut engine, 4);
    assert!(engine.music_effective_volume() < 127);
}
