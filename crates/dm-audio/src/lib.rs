//! Audio output backends for the dimuse engine.

mod capture;
mod cpal_backend;
mod traits;

pub use capture::CaptureOutput;
pub use cpal_backend::{CpalOutput, RateConverter};
pub use traits::{decode_pcm, AudioError, AudioOutput, StereoFrame};
