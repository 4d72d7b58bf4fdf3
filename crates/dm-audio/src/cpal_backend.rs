//! CPAL-based audio output backend.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{AudioError, AudioOutput, StereoFrame};

const UNITY: u32 = 1 << 16;

/// Nearest-neighbour conversion from the engine rate to the device rate,
/// in 16.16 fixed point.
#[derive(Clone, Copy, Debug)]
pub struct RateConverter {
    step: u32,
    phase: u32,
    current: StereoFrame,
    primed: bool,
}

impl RateConverter {
    pub fn new(source_rate: u32, device_rate: u32) -> Self {
        let step = ((source_rate as u64) << 16) / device_rate.max(1) as u64;
        Self {
            step: step.clamp(1, u32::MAX as u64 / 2) as u32,
            phase: 0,
            current: StereoFrame::silence(),
            primed: false,
        }
    }

    /// Next device frame, pulling source frames as the phase advances.
    /// An underrun yields silence until the source refills.
    pub fn next(&mut self, mut pull: impl FnMut() -> Option<StereoFrame>) -> StereoFrame {
        if !self.primed {
            match pull() {
                Some(frame) => {
                    self.current = frame;
                    self.primed = true;
                }
                None => return StereoFrame::silence(),
            }
        }
        let out = self.current;
        self.phase += self.step;
        while self.phase >= UNITY {
            self.phase -= UNITY;
            match pull() {
                Some(frame) => self.current = frame,
                None => {
                    self.primed = false;
                    self.phase = 0;
                    break;
                }
            }
        }
        out
    }
}

/// CPAL-based audio output.
pub struct CpalOutput {
    device: Device,
    config: StreamConfig,
    source_rate: u32,
    stream: Option<Stream>,
    producer: HeapProd<StereoFrame>,
    running: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open the default device for engine output at `source_rate`.
    pub fn new(source_rate: u32) -> Result<(Self, HeapCons<StereoFrame>), AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

        let config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceInit(e.to_string()))?;

        let mut config: StreamConfig = config.into();
        // The callback writes stereo pairs
        config.channels = 2;

        // About 200ms of engine output
        let rb = HeapRb::<StereoFrame>::new((source_rate as usize / 5).max(256));
        let (producer, consumer) = rb.split();
        debug!(source_rate, device_rate = config.sample_rate.0, "audio device opened");

        let output = Self {
            device,
            config,
            source_rate,
            stream: None,
            producer,
            running: Arc::new(AtomicBool::new(false)),
        };

        Ok((output, consumer))
    }

    /// Build and start the audio stream.
    pub fn build_stream(&mut self, mut consumer: HeapCons<StereoFrame>) -> Result<(), AudioError> {
        let running = self.running.clone();
        let channels = self.config.channels as usize;
        let mut converter = RateConverter::new(self.source_rate, self.config.sample_rate.0);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    for chunk in data.chunks_mut(channels) {
                        let frame = converter.next(|| consumer.try_pop());
                        let left = frame.left as f32 / 32768.0;
                        let right = frame.right as f32 / 32768.0;
                        for (i, sample) in chunk.iter_mut().enumerate() {
                            *sample = match i {
                                0 => left,
                                1 => right,
                                _ => 0.0,
                            };
                        }
                    }
                },
                |err| warn!(error = %err, "audio stream error"),
                None,
            )
            .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

        stream.play().map_err(|e| AudioError::Playback(e.to_string()))?;
        self.stream = Some(stream);

        Ok(())
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.source_rate
    }

    fn free_frames(&self) -> usize {
        self.producer.vacant_len()
    }

    fn queued_frames(&self) -> usize {
        self.producer.occupied_len()
    }

    fn write(&mut self, frames: &[StereoFrame]) -> usize {
        self.producer.push_slice(frames)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::Relaxed);
        if let Some(ref stream) = self.stream {
            stream.play().map_err(|e| AudioError::Playback(e.to_string()))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(ref stream) = self.stream {
            stream.pause().map_err(|e| AudioError::Playback(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: i16) -> StereoFrame {
        StereoFrame { left: v, right: -v }
    }

    fn convert(source: &[StereoFrame], from: u32, to: u32, n: usize) -> Vec<i16> {
        let mut src = source.iter().copied();
        let mut conv = RateConverter::new(from, to);
        (0..n).map(|_| conv.next(|| src.next()).left).collect()
    }

    #[test]
    fn equal_rates_pass_through() {
        let source: Vec<_> = (1..=4).map(frame).collect();
        assert_eq!(convert(&source, 22050, 22050, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn upsampling_repeats_frames() {
        let source: Vec<_> = (1..=3).map(frame).collect();
        assert_eq!(convert(&source, 11025, 22050, 6), vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn downsampling_skips_frames() {
        let source: Vec<_> = (1..=8).map(frame).collect();
        assert_eq!(convert(&source, 44100, 22050, 4), vec![1, 3, 5, 7]);
    }

    #[test]
    fn underrun_is_silent() {
        let source = [frame(9)];
        assert_eq!(convert(&source, 22050, 22050, 3), vec![9, 0, 0]);
    }
}
