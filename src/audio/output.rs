//! Buffer-queue output devices
//!
//! The player talks to hardware through [`OutputDevice`]: a queue of fixed-size
//! buffers that the device plays in submission order and reports back only as a
//! count of finished buffers. [`CpalOutput`] drives a real output device through
//! cpal; [`NullOutput`] discards audio but finishes buffers in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::buffer::{pcm_queue, PcmConsumer, PcmProducer};
use super::error::AudioError;
use super::provider::{read_i16, AudioInfo};

/// Device consuming a FIFO of submitted buffers
pub trait OutputDevice {
    /// Submit buffer `slot` holding one buffer's worth of PCM in the provider format
    fn queue(&mut self, slot: usize, data: &[u8]) -> Result<(), AudioError>;

    /// Buffers finished playing and not yet unqueued
    fn processed(&mut self) -> usize;

    /// Hand finished buffers back, oldest first
    fn unqueue(&mut self, slots: &[usize]);

    fn play(&mut self) -> Result<(), AudioError>;

    /// Halt immediately and discard everything queued
    fn stop(&mut self);
}

/// Opens output devices for a given stream format
pub trait DeviceFactory {
    fn open_device(
        &self,
        info: &AudioInfo,
        buffer_frames: usize,
        num_buffers: usize,
    ) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Output backend selectable from settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputKind {
    #[default]
    Cpal,
    Null,
}

impl DeviceFactory for OutputKind {
    fn open_device(
        &self,
        info: &AudioInfo,
        buffer_frames: usize,
        num_buffers: usize,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        match self {
            Self::Cpal => Ok(Box::new(CpalOutput::open(info, buffer_frames, num_buffers)?)),
            Self::Null => Ok(Box::new(NullOutput::new(info.sample_rate, buffer_frames))),
        }
    }
}

/// Lowest rate requested from a hardware device. Many devices refuse
/// telephone-quality rates outright.
pub const MIN_DEVICE_RATE: u32 = 32000;

/// How many times each frame is repeated so `sample_rate` reaches
/// [`MIN_DEVICE_RATE`]. Always a power of two.
pub fn upsample_factor(sample_rate: u32) -> u32 {
    let mut factor = 1;
    while sample_rate > 0 && sample_rate.saturating_mul(factor) < MIN_DEVICE_RATE {
        factor *= 2;
    }
    factor
}

/// Convert one PCM sample to f32 in [-1, 1)
#[inline]
pub fn sample_to_f32(bytes: &[u8], info: &AudioInfo) -> f32 {
    match info.bytes_per_sample {
        1 => (bytes[0] as f32 - 128.0) / 128.0,
        _ => read_i16(bytes, info.native_endian) as f32 / 32768.0,
    }
}

/// Convert interleaved PCM into f32 frames of `out_channels` channels, writing
/// each frame `repeat` times.
///
/// Mono is copied to every output channel; extra source channels are mixed down
/// for a mono device and dropped otherwise.
pub fn convert_frames(data: &[u8], info: &AudioInfo, out_channels: usize, repeat: usize, out: &mut Vec<f32>) {
    let bps = info.bytes_per_sample as usize;
    let src_channels = info.channels as usize;
    out.clear();

    for frame in data.chunks_exact(info.bytes_per_frame()) {
        let sample = |ch: usize| sample_to_f32(&frame[ch * bps..(ch + 1) * bps], info);
        let start = out.len();

        if src_channels == 1 {
            let v = sample(0);
            out.extend(std::iter::repeat(v).take(out_channels));
        } else if out_channels == 1 {
            let sum: f32 = (0..src_channels).map(sample).sum();
            out.push(sum / src_channels as f32);
        } else {
            for ch in 0..out_channels {
                out.push(if ch < src_channels { sample(ch) } else { 0.0 });
            }
        }

        // Sample doubling: duplicate the frame just written
        for _ in 1..repeat {
            out.extend_from_within(start..start + out_channels);
        }
    }
}

/// Hardware output through the default cpal device.
///
/// Buffers become f32 samples in a ring shared with the stream callback. A
/// buffer counts as finished once the callback has pulled all of its samples.
pub struct CpalOutput {
    /// Held for its lifetime: dropping it closes the device
    stream: cpal::Stream,
    producer: PcmProducer,
    /// Shared with the callback so `stop` can flush it
    consumer: Arc<Mutex<PcmConsumer>>,
    /// Samples the callback has pulled since the stream opened
    played: Arc<AtomicU64>,
    /// Format of the submitted buffers
    info: AudioInfo,
    /// Channel count of the device stream
    out_channels: usize,
    /// Each source frame is written this many times
    repeat: usize,
    /// Device samples in one submitted buffer
    samples_per_buffer: u64,
    /// Finished buffers already handed back to the player
    unqueued: u64,
    scratch: Vec<f32>,
}

impl CpalOutput {
    pub fn open(info: &AudioInfo, buffer_frames: usize, num_buffers: usize) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::open("No output device available"))?;

        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::open(format!("Failed to get output config: {}", e)))?;

        // Low rates are doubled up to something the hardware accepts
        let repeat = upsample_factor(info.sample_rate);
        let device_rate = info.sample_rate.saturating_mul(repeat);
        if repeat > 1 {
            log::debug!("Doubling {} Hz audio {}x to {} Hz", info.sample_rate, repeat, device_rate);
        }

        let out_channels = default_config.channels() as usize;
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let samples_per_buffer = buffer_frames * repeat as usize * out_channels;
        let (producer, consumer, played) = pcm_queue(samples_per_buffer * num_buffers);
        let consumer = Arc::new(Mutex::new(consumer));
        let callback_consumer = Arc::clone(&consumer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // Never block the audio thread; a flush in progress just means silence
                    match callback_consumer.try_lock() {
                        Some(mut cons) => {
                            cons.drain_into(data);
                        }
                        None => data.fill(0.0),
                    }
                },
                |err| log::error!("Audio output error: {}", err),
                None,
            )
            .map_err(|e| {
                AudioError::open(format!(
                    "Failed to build {} Hz, {} ch output stream: {}",
                    device_rate, out_channels, e
                ))
            })?;

        if let Err(e) = stream.pause() {
            log::debug!("Output stream cannot start paused: {}", e);
        }

        log::info!(
            "Opened output device {} at {} Hz, {} ch",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            device_rate,
            out_channels
        );

        Ok(Self {
            stream,
            producer,
            consumer,
            played,
            info: *info,
            out_channels,
            repeat: repeat as usize,
            samples_per_buffer: samples_per_buffer.max(1) as u64,
            unqueued: 0,
            scratch: Vec::with_capacity(samples_per_buffer),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn queue(&mut self, _slot: usize, data: &[u8]) -> Result<(), AudioError> {
        convert_frames(data, &self.info, self.out_channels, self.repeat, &mut self.scratch);
        // The ring holds every buffer in the pool, so this only drops on misuse
        let pushed = self.producer.push_slice(&self.scratch);
        if pushed < self.scratch.len() {
            log::warn!(
                "Output queue overflow: dropped {} samples",
                self.scratch.len() - pushed
            );
        }
        Ok(())
    }

    fn processed(&mut self) -> usize {
        // Buffers are all the same size, so whole buffers pulled = buffers finished
        let finished = self.played.load(Ordering::Relaxed) / self.samples_per_buffer;
        finished.saturating_sub(self.unqueued) as usize
    }

    fn unqueue(&mut self, slots: &[usize]) {
        self.unqueued += slots.len() as u64;
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::open(format!("Failed to start output stream: {}", e)))
    }

    fn stop(&mut self) {
        if let Err(e) = self.stream.pause() {
            log::warn!("Failed to pause output stream: {}", e);
        }
        self.consumer.lock().clear();
        // Clearing also zeroes `played`
        self.unqueued = 0;
    }
}

/// Output that plays nothing but finishes buffers at the stream's real-time rate
pub struct NullOutput {
    /// Real-time length of one buffer
    buffer_duration: Duration,
    /// Buffers still "playing", front first
    pending: usize,
    /// Finished and not yet unqueued
    finished: usize,
    /// When the front pending buffer started
    head_started: Option<Instant>,
    playing: bool,
}

impl NullOutput {
    pub fn new(sample_rate: u32, buffer_frames: usize) -> Self {
        let nanos = buffer_frames as u64 * 1_000_000_000 / sample_rate.max(1) as u64;
        Self {
            buffer_duration: Duration::from_nanos(nanos),
            pending: 0,
            finished: 0,
            head_started: None,
            playing: false,
        }
    }
}

impl OutputDevice for NullOutput {
    fn queue(&mut self, _slot: usize, _data: &[u8]) -> Result<(), AudioError> {
        self.pending += 1;
        // Queueing onto a drained device restarts the clock
        if self.playing && self.head_started.is_none() {
            self.head_started = Some(Instant::now());
        }
        Ok(())
    }

    fn processed(&mut self) -> usize {
        if let Some(mut started) = self.head_started {
            let now = Instant::now();
            // Each buffer starts exactly when the one before it ended
            while self.pending > 0 && started + self.buffer_duration <= now {
                started += self.buffer_duration;
                self.pending -= 1;
                self.finished += 1;
            }
            self.head_started = (self.pending > 0).then_some(started);
        }
        self.finished
    }

    fn unqueue(&mut self, slots: &[usize]) {
        self.finished = self.finished.saturating_sub(slots.len());
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.playing = true;
        if self.pending > 0 && self.head_started.is_none() {
            self.head_started = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.playing = false;
        self.pending = 0;
        self.finished = 0;
        self.head_started = None;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Everything a [`RecordingOutput`] saw
    #[derive(Default)]
    pub struct DeviceLog {
        pub submitted: Vec<(usize, Vec<u8>)>,
        pub queued: VecDeque<usize>,
        pub playing: bool,
        pub stops: usize,
        /// Report every queued buffer as finished on the next poll
        pub drain_all: bool,
        /// Finished buffers to report when `drain_all` is off
        pub finished: usize,
        pub out_of_order: bool,
        /// Reject every submission
        pub fail_queue: bool,
    }

    /// Device that records submissions and finishes buffers on demand
    pub struct RecordingOutput {
        log: Rc<RefCell<DeviceLog>>,
    }

    impl OutputDevice for RecordingOutput {
        fn queue(&mut self, slot: usize, data: &[u8]) -> Result<(), AudioError> {
            let mut log = self.log.borrow_mut();
            if log.fail_queue {
                return Err(AudioError::open("device lost"));
            }
            log.submitted.push((slot, data.to_vec()));
            log.queued.push_back(slot);
            Ok(())
        }

        fn processed(&mut self) -> usize {
            let log = self.log.borrow();
            if !log.playing {
                0
            } else if log.drain_all {
                log.queued.len()
            } else {
                log.finished.min(log.queued.len())
            }
        }

        fn unqueue(&mut self, slots: &[usize]) {
            let mut log = self.log.borrow_mut();
            for &slot in slots {
                if log.queued.pop_front() != Some(slot) {
                    log.out_of_order = true;
                }
            }
            log.finished = log.finished.saturating_sub(slots.len());
        }

        fn play(&mut self) -> Result<(), AudioError> {
            self.log.borrow_mut().playing = true;
            Ok(())
        }

        fn stop(&mut self) {
            let mut log = self.log.borrow_mut();
            log.playing = false;
            log.queued.clear();
            log.finished = 0;
            log.stops += 1;
        }
    }

    /// Factory handing out [`RecordingOutput`]s that share one log
    #[derive(Default, Clone)]
    pub struct RecordingFactory {
        pub log: Rc<RefCell<DeviceLog>>,
        pub fail: bool,
    }

    impl RecordingFactory {
        pub fn draining() -> Self {
            let factory = Self::default();
            factory.log.borrow_mut().drain_all = true;
            factory
        }
    }

    impl DeviceFactory for RecordingFactory {
        fn open_device(
            &self,
            _info: &AudioInfo,
            _buffer_frames: usize,
            _num_buffers: usize,
        ) -> Result<Box<dyn OutputDevice>, AudioError> {
            if self.fail {
                return Err(AudioError::open("device busy"));
            }
            Ok(Box::new(RecordingOutput {
                log: Rc::clone(&self.log),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(channels: u16, bytes_per_sample: u16) -> AudioInfo {
        AudioInfo {
            channels,
            sample_rate: 8000,
            bytes_per_sample,
            num_samples: 0,
            native_endian: true,
        }
    }

    #[test]
    fn test_sample_conversion() {
        let unsigned8 = info(1, 1);
        assert_eq!(sample_to_f32(&[128], &unsigned8), 0.0);
        assert_eq!(sample_to_f32(&[0], &unsigned8), -1.0);

        let signed16 = info(1, 2);
        assert_eq!(sample_to_f32(&16384i16.to_ne_bytes(), &signed16), 0.5);
        assert_eq!(sample_to_f32(&i16::MIN.to_ne_bytes(), &signed16), -1.0);
    }

    #[test]
    fn test_mono_fans_out() {
        let mut out = Vec::new();
        convert_frames(&[128, 192], &info(1, 1), 2, 1, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_stereo_to_mono_mixes() {
        let mut data = Vec::new();
        data.extend_from_slice(&16384i16.to_ne_bytes());
        data.extend_from_slice(&0i16.to_ne_bytes());

        let mut out = Vec::new();
        convert_frames(&data, &info(2, 2), 1, 1, &mut out);
        assert_eq!(out, vec![0.25]);
    }

    #[test]
    fn test_stereo_to_surround_pads() {
        let mut out = Vec::new();
        convert_frames(&[192, 64], &info(2, 1), 4, 1, &mut out);
        assert_eq!(out, vec![0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_upsample_factor() {
        assert_eq!(upsample_factor(8000), 4);
        assert_eq!(upsample_factor(11025), 4);
        assert_eq!(upsample_factor(16000), 2);
        assert_eq!(upsample_factor(22050), 2);
        assert_eq!(upsample_factor(32000), 1);
        assert_eq!(upsample_factor(44100), 1);
        assert_eq!(upsample_factor(96000), 1);
        assert_eq!(upsample_factor(0), 1);
    }

    #[test]
    fn test_repeat_doubles_frames() {
        let mut out = Vec::new();
        convert_frames(&[192, 64, 128, 0], &info(2, 1), 2, 2, &mut out);
        assert_eq!(out, vec![0.5, -0.5, 0.5, -0.5, 0.0, -1.0, 0.0, -1.0]);

        convert_frames(&[192], &info(1, 1), 1, 4, &mut out);
        assert_eq!(out, vec![0.5; 4]);
    }

    #[test]
    fn test_null_output_finishes_in_real_time() {
        // 80 frames at 8 kHz = 10 ms per buffer
        let mut device = NullOutput::new(8000, 80);
        device.queue(0, &[]).unwrap();
        device.queue(1, &[]).unwrap();
        assert_eq!(device.processed(), 0);

        device.play().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(device.processed(), 2);

        device.unqueue(&[0, 1]);
        assert_eq!(device.processed(), 0);
    }

    #[test]
    fn test_null_output_stop_discards() {
        let mut device = NullOutput::new(8000, 80);
        device.queue(0, &[]).unwrap();
        device.play().unwrap();
        device.stop();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(device.processed(), 0);
    }
}
