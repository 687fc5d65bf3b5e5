//! cue-audio - audio playback and caching pipeline
//!
//! Turns a decoded audio source into continuous device output through a small
//! pool of queued buffers, with optional disk or memory caches in front of slow
//! sources. [`audio::PlaybackController`] is the entry point.

pub mod audio;
pub mod settings;
