//! Audio module - sources, caches and buffered playback
//!
//! This module provides:
//! - The provider trait and its generated and decoded sources
//! - Disk and memory caches in front of slow sources
//! - Buffer-pool streaming to an output device
//! - The playback controller and clip export

mod buffer;
mod cache;
mod controller;
mod dummy;
mod error;
mod file;
mod output;
mod player;
mod provider;
mod source;
mod wav;

pub use cache::{apply_cache, CacheKind, DiskCacheProvider, RamCacheProvider, CACHE_BLOCK_FRAMES};
pub use controller::{
    PlaybackController, PlaybackEvent, PlaybackMode, TimeRange, TimingSource, VideoAudioSource,
};
pub use dummy::{DummyProvider, Signal};
pub use error::AudioError;
pub use file::FileProvider;
pub use output::{CpalOutput, DeviceFactory, NullOutput, OutputDevice, OutputKind};
pub use player::{StreamingPlayer, DEFAULT_POLL_INTERVAL, NUM_BUFFERS};
pub use provider::{AudioInfo, AudioProvider, LoadProgress, ProgressReporter};
pub use source::{AudioSource, VideoAccess};
pub use wav::export_clip;
