//! Random-access PCM source abstraction
//!
//! Every source in the pipeline (generators, decoded files, caches) implements
//! [`AudioProvider`]. Implementors only supply the in-range read; the provided
//! [`AudioProvider::get_audio`] handles reads that run past the end by padding
//! with zero bytes, so callers never see a short read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::AudioError;

/// Immutable PCM format and length of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub channels: u16,
    pub sample_rate: u32,
    /// 1 (unsigned 8-bit) or 2 (signed 16-bit)
    pub bytes_per_sample: u16,
    /// Length in sample-frames (one sample per channel)
    pub num_samples: u64,
    pub native_endian: bool,
}

impl AudioInfo {
    /// Size of one interleaved frame in bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Size of the whole stream in bytes, `None` on overflow
    pub fn total_bytes(&self) -> Option<u64> {
        self.num_samples.checked_mul(self.bytes_per_frame() as u64)
    }
}

/// Read-only, random-access PCM source
pub trait AudioProvider: Send + Sync {
    fn info(&self) -> &AudioInfo;

    /// Name of the underlying source (path, token, ...)
    fn source_name(&self) -> &str;

    /// Fill `buf` with frames starting at `start`.
    ///
    /// Only called for ranges entirely inside `0..num_samples`; `buf` holds exactly
    /// the requested number of frames.
    fn fill_buffer(&self, buf: &mut [u8], start: u64) -> Result<(), AudioError>;

    /// Read `count` frames starting at `start` into `buf`.
    ///
    /// Frames past the end of the source are zero-filled.
    fn get_audio(&self, buf: &mut [u8], start: u64, count: u64) -> Result<(), AudioError> {
        if count == 0 {
            return Ok(());
        }

        let info = *self.info();
        let bpf = info.bytes_per_frame();
        let wanted = count as usize * bpf;
        if buf.len() < wanted {
            return Err(AudioError::decode(format!(
                "buffer holds {} bytes, {} frames need {}",
                buf.len(),
                count,
                wanted
            )));
        }

        let available = info.num_samples.saturating_sub(start).min(count);
        let (real, silence) = buf[..wanted].split_at_mut(available as usize * bpf);
        silence.fill(0);

        if available > 0 {
            self.fill_buffer(real, start)?;
        }
        Ok(())
    }

    /// Like [`get_audio`](Self::get_audio), scaling the real samples by `volume`
    fn get_audio_with_volume(
        &self,
        buf: &mut [u8],
        start: u64,
        count: u64,
        volume: f32,
    ) -> Result<(), AudioError> {
        self.get_audio(buf, start, count)?;

        let info = self.info();
        let len = count as usize * info.bytes_per_frame();
        apply_volume(&mut buf[..len], info, volume);
        Ok(())
    }

    fn channels(&self) -> u16 {
        self.info().channels
    }

    fn sample_rate(&self) -> u32 {
        self.info().sample_rate
    }

    fn bytes_per_sample(&self) -> u16 {
        self.info().bytes_per_sample
    }

    fn num_samples(&self) -> u64 {
        self.info().num_samples
    }

    fn native_endian(&self) -> bool {
        self.info().native_endian
    }
}

/// Scale PCM samples in place, clamping to the sample range
pub fn apply_volume(buf: &mut [u8], info: &AudioInfo, volume: f32) {
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }

    match info.bytes_per_sample {
        1 => {
            for b in buf.iter_mut() {
                let centered = (*b as f32 - 128.0) * volume;
                *b = (centered.round().clamp(-128.0, 127.0) + 128.0) as u8;
            }
        }
        2 => {
            for chunk in buf.chunks_exact_mut(2) {
                let sample = read_i16(chunk, info.native_endian) as f32 * volume;
                let scaled = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                write_i16(chunk, scaled, info.native_endian);
            }
        }
        other => log::warn!("Volume not applied: unsupported sample width {}", other),
    }
}

/// Decode a 16-bit sample stored in native or swapped byte order
#[inline]
pub fn read_i16(bytes: &[u8], native_endian: bool) -> i16 {
    let raw = i16::from_ne_bytes([bytes[0], bytes[1]]);
    if native_endian {
        raw
    } else {
        raw.swap_bytes()
    }
}

#[inline]
fn write_i16(bytes: &mut [u8], value: i16, native_endian: bool) {
    let value = if native_endian { value } else { value.swap_bytes() };
    bytes.copy_from_slice(&value.to_ne_bytes());
}

/// Progress and cancellation hook for long provider operations (cache population)
pub trait ProgressReporter {
    fn set_progress(&mut self, done: u64, total: u64);

    /// Polled once per copied block
    fn is_cancelled(&self) -> bool;
}

/// Progress reporter backed by a shared cancellation flag
///
/// Logs progress in 10% steps.
#[derive(Debug, Default)]
pub struct LoadProgress {
    cancel: Arc<AtomicBool>,
    last_decile: u64,
}

impl LoadProgress {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            last_decile: 0,
        }
    }

    /// Handle that another thread can use to request cancellation
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

impl ProgressReporter for LoadProgress {
    fn set_progress(&mut self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let decile = done.saturating_mul(10) / total;
        if decile > self.last_decile {
            self.last_decile = decile;
            log::info!("Loading audio: {}%", decile * 10);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
