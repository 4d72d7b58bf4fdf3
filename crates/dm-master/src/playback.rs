//! Heartbeat and audio output threads.

use dm_audio::{decode_pcm, AudioOutput, CpalOutput, StereoFrame};
use dm_engine::{EngineConfig, MemoryProvider, OutputConfig, SharedEngine};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Flags shared between the controller and its threads.
#[derive(Clone, Default)]
pub(crate) struct Signals {
    pub stop: Arc<AtomicBool>,
    pub finished: Arc<AtomicBool>,
    pub frames_played: Arc<AtomicU64>,
}

pub(crate) struct PlaybackHandle {
    pub signals: Signals,
    threads: Vec<JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Output to the default device. The device is opened on the output
    /// thread since CPAL streams are not `Send` everywhere.
    pub fn spawn_device(
        engine: SharedEngine<MemoryProvider>,
        config: &EngineConfig,
        until_idle: bool,
    ) -> Self {
        let signals = Signals::default();
        let layout = config.output;
        let heartbeat = spawn_heartbeat(engine.clone(), config.heartbeat_hz, signals.clone());
        let sig = signals.clone();
        let output = std::thread::spawn(move || {
            let (mut output, consumer) = match CpalOutput::new(layout.sample_rate) {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "cannot open audio device");
                    sig.finished.store(true, Ordering::Relaxed);
                    return;
                }
            };
            if let Err(e) = output.build_stream(consumer) {
                error!(error = %e, "cannot start audio stream");
                sig.finished.store(true, Ordering::Relaxed);
                return;
            }
            output_loop(engine, output, layout, sig, until_idle);
        });
        Self { signals, threads: vec![heartbeat, output] }
    }

    pub fn spawn<O>(
        engine: SharedEngine<MemoryProvider>,
        config: &EngineConfig,
        output: O,
        until_idle: bool,
    ) -> Self
    where
        O: AudioOutput + Send + 'static,
    {
        let signals = Signals::default();
        let layout = config.output;
        let heartbeat = spawn_heartbeat(engine.clone(), config.heartbeat_hz, signals.clone());
        let sig = signals.clone();
        let output = std::thread::spawn(move || output_loop(engine, output, layout, sig, until_idle));
        Self { signals, threads: vec![heartbeat, output] }
    }

    /// Signal both threads and wait for them.
    pub fn join(&mut self) {
        self.signals.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("playback thread panicked");
            }
        }
    }
}

fn spawn_heartbeat(engine: SharedEngine<MemoryProvider>, hz: u32, signals: Signals) -> JoinHandle<()> {
    let period = Duration::from_secs(1) / hz.max(1);
    std::thread::spawn(move || {
        let mut next = Instant::now() + period;
        while !signals.stop.load(Ordering::Relaxed) && !signals.finished.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next {
                std::thread::sleep(next - now);
                continue;
            }
            engine.heartbeat();
            next += period;
            // Don't try to catch up after a long stall.
            if now > next + period * 4 {
                next = now + period;
            }
        }
    })
}

fn output_loop<O: AudioOutput>(
    engine: SharedEngine<MemoryProvider>,
    mut output: O,
    layout: OutputConfig,
    signals: Signals,
    until_idle: bool,
) {
    if let Err(e) = output.start() {
        error!(error = %e, "cannot start output");
        signals.finished.store(true, Ordering::Relaxed);
        return;
    }
    let feed = engine.lock().feed_frames() as usize;
    let mut pcm = vec![0u8; feed * layout.frame_bytes()];
    let mut frames: Vec<StereoFrame> = Vec::with_capacity(feed);

    while !signals.stop.load(Ordering::Relaxed) {
        if output.free_frames() < feed {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let (n, idle) = {
            let mut engine = engine.lock();
            let n = engine.render(&mut pcm);
            (n, engine.active_count() == 0)
        };
        frames.clear();
        match decode_pcm(&pcm[..n], &layout) {
            Ok(decoded) => frames.extend(decoded),
            Err(e) => {
                error!(error = %e, "engine output cannot be played");
                break;
            }
        }
        let written = output.write(&frames);
        signals.frames_played.fetch_add(written as u64, Ordering::Relaxed);
        if until_idle && idle {
            debug!("all sounds ended");
            break;
        }
    }

    // Let queued audio drain before pausing the device.
    while output.queued_frames() > 0 && !signals.stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(5));
    }
    if let Err(e) = output.stop() {
        warn!(error = %e, "cannot stop output");
    }
    signals.finished.store(true, Ordering::Relaxed);
}
