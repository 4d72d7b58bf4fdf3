//! Feed path benchmarks: raw mixer throughput and full engine renders.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dm_engine::{Engine, EngineConfig, MemoryProvider, Mixer, OutputConfig};
use dm_formats::build_imus;
use dm_ir::{AudioFormat, CueMap, Group, SoundId};

const FEED_SIZES: &[u32] = &[256, 512, 1024];

fn pcm(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7) % 256) as u8).collect()
}

fn bench_mixer(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mixer");
    let output = OutputConfig::default();
    let cases = [
        ("8-bit mono", AudioFormat::new(8, 22050, 1)),
        ("12-bit stereo", AudioFormat::new(12, 22050, 2)),
        ("16-bit stereo", AudioFormat::new(16, 22050, 2)),
        ("8-bit mono 11k", AudioFormat::new(8, 11025, 1)),
    ];
    for (name, format) in cases {
        for &frames in FEED_SIZES {
            group.bench_with_input(BenchmarkId::new(name, frames), &frames, |b, &frames| {
                let mut mixer = Mixer::new(&output);
                let in_frames = (frames as u64 * format.sample_rate as u64 / output.sample_rate as u64) as u32;
                let src = pcm(format.frames_to_bytes(in_frames) as usize);
                let mut out = vec![0u8; frames as usize * output.frame_bytes()];
                b.iter(|| {
                    mixer.mix(black_box(&src), in_frames, format, frames, 0, 100, 40);
                    black_box(mixer.loop_out(&mut out, frames))
                });
            });
        }
    }
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("Engine render");
    let sounds: [(SoundId, Group); 4] =
        [(1, Group::Music), (2, Group::Speech), (3, Group::Sfx), (4, Group::Sfx)];
    for &frames in FEED_SIZES {
        group.bench_with_input(BenchmarkId::new("4 tracks", frames), &frames, |b, &frames| {
            let mut provider = MemoryProvider::new();
            let format = AudioFormat::new(16, 22050, 2);
            let len = format.frames_to_bytes(22050 * 5);
            let file = build_imus(&CueMap::linear(format, len), &pcm(len as usize));
            for (sound, group) in sounds {
                if group == Group::Sfx {
                    provider.insert_resource(sound, file.clone());
                } else {
                    provider.insert_streamed(sound, file.clone());
                }
            }
            let mut engine = Engine::new(EngineConfig::default(), provider).unwrap();
            engine.set_feed_frames(frames);
            let mut out = vec![0u8; frames as usize * 4];
            b.iter(|| {
                for (sound, group) in sounds {
                    if engine.track(sound).is_none() {
                        engine.start_sound(sound, 64, group).unwrap();
                    }
                }
                engine.tick();
                black_box(engine.render(&mut out))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mixer, bench_render);
criterion_main!(benches);
