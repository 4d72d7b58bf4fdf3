//! Core data types for the dimuse sequencer.
//!
//! This crate defines the vocabulary shared by the format parsers and the
//! playback engine: sound and group identifiers, the parameter space, the
//! PCM format descriptor and the structured cue map.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod cue_map;
mod format;
mod ids;
mod param;

pub use cue_map::{CueMap, MapBlock, MapEvent, MarkerText, MAX_MARKER_LEN};
pub use format::AudioFormat;
pub use ids::{BufferCategory, Group, SoundId};
pub use param::ParamId;
