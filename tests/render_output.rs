//! Integration test: load sounds → start → render offline → inspect the WAV.

use dm_formats::{build_imus, pcm_to_wav};
use dm_ir::{AudioFormat, CueMap, MapBlock, MapEvent, MarkerText};
use dm_master::{Command, Controller, EngineConfig, Group, OutputConfig, ParamId, Residency};
use dm_engine::TriggerAction;

const RATE: u32 = 22050;

fn config() -> EngineConfig {
    EngineConfig {
        output: OutputConfig { sample_rate: RATE, channels: 2, word_size: 16, feed_frames: 512 },
        ..Default::default()
    }
}

fn square(seconds: u32) -> Vec<u8> {
    let len = RATE * seconds;
    let pcm: Vec<u8> = (0..len).map(|i| if i % 50 < 25 { 0x30 } else { 0xd0 }).collect();
    build_imus(&CueMap::linear(AudioFormat::new(8, RATE, 1), len), &pcm)
}

fn silence(seconds: u32) -> Vec<u8> {
    pcm_to_wav(&vec![0x80; (RATE * seconds) as usize], 1, RATE, 8)
}

fn samples(wav: &[u8]) -> Vec<i16> {
    wav[44..].chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

fn peak(samples: &[i16]) -> i16 {
    samples.iter().map(|s| s.saturating_abs()).max().unwrap_or(0)
}

fn music_controller() -> Controller {
    let mut ctrl = Controller::new(config()).unwrap();
    ctrl.load_sound(1, square(3), Residency::Streamed).unwrap();
    ctrl.execute(Command::StartSound { sound: 1, priority: 100, group: Group::Music }).unwrap();
    ctrl
}

#[test]
fn render_is_deterministic() {
    let a = music_controller().render_to_wav(10);
    let b = music_controller().render_to_wav(10);
    assert_eq!(a, b);

    let frames = samples(&a).len() / 2;
    assert!((3 * RATE as usize..3 * RATE as usize + 512).contains(&frames), "{frames} frames");
    assert!(peak(&samples(&a)) > 1000);
}

#[test]
fn speech_ducks_music_in_the_mix() {
    let plain = samples(&music_controller().render_to_wav(2));

    let mut ctrl = music_controller();
    ctrl.load_sound(2, silence(2), Residency::Resource).unwrap();
    ctrl.execute(Command::StartSound { sound: 2, priority: 100, group: Group::Speech }).unwrap();
    let ducked = samples(&ctrl.render_to_wav(2));

    // Compare the second half, once ducking has settled.
    let half = RATE as usize * 2;
    assert!(peak(&ducked[half..2 * half]) < peak(&plain[half..2 * half]));
}

#[test]
fn marker_trigger_fades_out_another_sound() {
    let mut ctrl = music_controller();
    let len = RATE / 2;
    let map = CueMap::new(vec![
        MapBlock::new(0, MapEvent::Format(AudioFormat::new(8, RATE, 1))),
        MapBlock::new(0, MapEvent::Region { length: len }),
        MapBlock::new(len, MapEvent::Text(MarkerText::from("cue").unwrap())),
        MapBlock::new(len, MapEvent::Region { length: len }),
        MapBlock::new(2 * len, MapEvent::Stop),
    ]);
    let cue = build_imus(&map, &vec![0x80; 2 * len as usize]);
    ctrl.load_sound(2, cue, Residency::Resource).unwrap();
    ctrl.execute(Command::StartSound { sound: 2, priority: 10, group: Group::Sfx }).unwrap();
    ctrl.execute(Command::SetTrigger {
        sound: 2,
        marker: MarkerText::from("cue").unwrap(),
        action: TriggerAction::command(Command::FadeParam {
            sound: 1,
            param: ParamId::Volume,
            target: 0,
            ticks: 10,
        }),
    })
    .unwrap();

    // Marker at 0.5s, then ten beats of fade: music stops near 0.7s and
    // the silent cue sound runs on to 1s.
    let out = samples(&ctrl.render_to_wav(10));
    let frames = out.len() / 2;
    assert!((RATE as usize..RATE as usize + 512).contains(&frames), "rendered {frames} frames");
    assert!(peak(&out[..RATE as usize / 2]) > 1000);
    assert_eq!(peak(&out[2 * (RATE as usize * 8 / 10)..]), 0);
}
