//! In-memory output that records everything written to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::traits::{AudioError, AudioOutput, StereoFrame};

/// Output sink for headless runs and tests. Clones share one recording.
#[derive(Clone, Debug)]
pub struct CaptureOutput {
    sample_rate: u32,
    capacity: usize,
    frames: Arc<Mutex<Vec<StereoFrame>>>,
    running: Arc<AtomicBool>,
}

impl CaptureOutput {
    /// A sink that accepts up to `capacity` frames in total.
    pub fn new(sample_rate: u32, capacity: usize) -> Self {
        Self {
            sample_rate,
            capacity,
            frames: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn frames(&self) -> Vec<StereoFrame> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl AudioOutput for CaptureOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn free_frames(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    fn write(&mut self, frames: &[StereoFrame]) -> usize {
        let mut recorded = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let n = frames.len().min(self.capacity.saturating_sub(recorded.len()));
        recorded.extend_from_slice(&frames[..n]);
        n
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_accepting_at_capacity() {
        let mut sink = CaptureOutput::new(22050, 3);
        let view = sink.clone();
        let frames = [StereoFrame { left: 1, right: 2 }; 2];
        assert_eq!(sink.write(&frames), 2);
        assert_eq!(sink.write(&frames), 1);
        assert_eq!(sink.free_frames(), 0);
        assert_eq!(view.len(), 3);
    }
}
