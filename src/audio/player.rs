//! Streaming player
//!
//! Pushes PCM from a provider into an [`OutputDevice`] through a fixed pool of
//! [`NUM_BUFFERS`] buffers. The device consumes buffers on its own clock and only
//! tells us how many have finished, so the player keeps the pool topped up from
//! [`StreamingPlayer::tick`] and reconstructs the playback position from the
//! number of finished buffers plus wall-clock time since the last reclaim.
//!
//! Creating a player opens the device stream; dropping it stops playback and
//! releases the device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::AudioError;
use super::output::{DeviceFactory, OutputDevice};
use super::provider::{AudioInfo, AudioProvider};

/// Buffers in the device pool
pub const NUM_BUFFERS: usize = 8;

/// How often the host should call [`StreamingPlayer::tick`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Frames per buffer so the whole pool holds about half a second
pub fn buffer_frames_for(sample_rate: u32) -> u64 {
    (sample_rate as u64 / NUM_BUFFERS as u64 / 2).max(1)
}

/// Ring of buffer slots split into a queued run followed by a free run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferPool {
    first_free: usize,
    first_queued: usize,
    free_count: usize,
    buffers_played: u64,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            first_free: 0,
            first_queued: 0,
            free_count: NUM_BUFFERS,
            buffers_played: 0,
        }
    }

    fn queued_count(&self) -> usize {
        NUM_BUFFERS - self.free_count
    }

    /// Slot the next submission will use
    fn next_free(&self) -> Option<usize> {
        (self.free_count > 0).then_some(self.first_free)
    }

    /// Mark the slot returned by [`next_free`](Self::next_free) as queued
    fn commit_free(&mut self) {
        if self.free_count == 0 {
            return;
        }
        self.first_free = (self.first_free + 1) % NUM_BUFFERS;
        self.free_count -= 1;
    }

    /// Return the `count` oldest queued slots to the free run
    fn reclaim(&mut self, count: usize) -> Vec<usize> {
        let count = count.min(self.queued_count());
        let slots = (0..count)
            .map(|i| (self.first_queued + i) % NUM_BUFFERS)
            .collect();
        self.first_queued = (self.first_queued + count) % NUM_BUFFERS;
        self.free_count += count;
        self.buffers_played += count as u64;
        slots
    }
}

/// State of the current playback operation
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlaybackSession {
    start_frame: u64,
    /// Next frame to be written into a buffer
    cur_frame: u64,
    end_frame: u64,
    playing: bool,
    volume: f32,
}

/// Plays ranges of a provider on an output device
pub struct StreamingPlayer {
    provider: Arc<dyn AudioProvider>,
    device: Box<dyn OutputDevice>,
    info: AudioInfo,
    buffer_frames: u64,
    pool: BufferPool,
    session: PlaybackSession,
    /// Restarted on every reclaim; fills in the position between reclaims
    segment_timer: Instant,
    poll_interval: Duration,
    scratch: Vec<u8>,
}

impl StreamingPlayer {
    /// Open an output stream for `provider`
    pub fn open(provider: Arc<dyn AudioProvider>, factory: &dyn DeviceFactory) -> Result<Self, AudioError> {
        let info = *provider.info();
        if info.sample_rate == 0 || info.channels == 0 || !matches!(info.bytes_per_sample, 1 | 2) {
            return Err(AudioError::open(format!(
                "Unsupported stream format: {} Hz, {} ch, {}-bit",
                info.sample_rate,
                info.channels,
                info.bytes_per_sample * 8
            )));
        }

        let buffer_frames = buffer_frames_for(info.sample_rate);
        let device = factory.open_device(&info, buffer_frames as usize, NUM_BUFFERS)?;

        log::debug!(
            "Opened stream for {}: {} buffers of {} frames",
            provider.source_name(),
            NUM_BUFFERS,
            buffer_frames
        );

        Ok(Self {
            provider,
            device,
            info,
            buffer_frames,
            pool: BufferPool::new(),
            session: PlaybackSession {
                start_frame: 0,
                cur_frame: 0,
                end_frame: 0,
                playing: false,
                volume: 1.0,
            },
            segment_timer: Instant::now(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            scratch: vec![0u8; buffer_frames as usize * info.bytes_per_frame()],
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start playing `count` frames from `start`, restarting if already playing
    pub fn play(&mut self, start: u64, count: u64) -> Result<(), AudioError> {
        if self.session.playing {
            self.session.playing = false;
            self.device.stop();
        }

        self.session.start_frame = start;
        self.session.cur_frame = start;
        self.session.end_frame = start.saturating_add(count);
        self.session.playing = true;

        self.pool = BufferPool::new();
        let started = self
            .fill_buffers(NUM_BUFFERS)
            .and_then(|_| self.device.play());
        if let Err(e) = started {
            self.stop();
            return Err(e);
        }

        self.segment_timer = Instant::now();
        log::debug!("Playing frames {}..{}", start, self.session.end_frame);
        Ok(())
    }

    /// Halt output immediately and forget the current range
    pub fn stop(&mut self) {
        if !self.session.playing {
            return;
        }

        self.session.playing = false;
        self.session.start_frame = 0;
        self.session.cur_frame = 0;
        self.session.end_frame = 0;
        self.device.stop();
    }

    /// Reclaim finished buffers, refill them, and stop once the range has played
    pub fn tick(&mut self) -> Result<(), AudioError> {
        if !self.session.playing {
            return Ok(());
        }

        let newplayed = self.device.processed().min(self.pool.queued_count());
        let mut result = Ok(());

        if newplayed > 0 {
            let slots = self.pool.reclaim(newplayed);
            self.device.unqueue(&slots);
            self.segment_timer = Instant::now();
            result = self.fill_buffers(newplayed);
        }

        // Everything requested plus a full pool of trailing silence has been played
        let range = self.session.end_frame.saturating_sub(self.session.start_frame);
        let played = self.pool.buffers_played;
        if played > NUM_BUFFERS as u64 && (played - NUM_BUFFERS as u64) * self.buffer_frames > range {
            log::debug!("Playback finished after {} buffers", played);
            self.stop();
        }

        result
    }

    /// Fill and submit up to `count` free buffers.
    ///
    /// Past the end of the range buffers are padded with silence, so queued audio
    /// never runs dry before the device reaches the end.
    fn fill_buffers(&mut self, count: usize) -> Result<(), AudioError> {
        if self.pool.free_count == 0 {
            return Ok(());
        }
        let count = count.clamp(1, self.pool.free_count);
        let bpf = self.info.bytes_per_frame();
        let mut result = Ok(());

        for _ in 0..count {
            let Some(slot) = self.pool.next_free() else {
                break;
            };

            let remaining = self.session.end_frame.saturating_sub(self.session.cur_frame);
            let fill_len = remaining.min(self.buffer_frames);
            let real = fill_len as usize * bpf;

            if fill_len > 0 {
                if let Err(e) = self.provider.get_audio_with_volume(
                    &mut self.scratch[..real],
                    self.session.cur_frame,
                    fill_len,
                    self.session.volume,
                ) {
                    log::error!("Audio read failed at frame {}: {}", self.session.cur_frame, e);
                    self.scratch[..real].fill(0);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            self.scratch[real..].fill(0);

            // The slot only leaves the free run once the device holds it
            self.device.queue(slot, &self.scratch)?;
            self.pool.commit_free();
            self.session.cur_frame += fill_len;
        }

        log::trace!(
            "Filled {} buffers, cur_frame={}, free={}",
            count,
            self.session.cur_frame,
            self.pool.free_count
        );
        result
    }

    /// Estimated frame being heard right now.
    ///
    /// Only finished-buffer counts are observable, so the time since the last
    /// reclaim is extrapolated from the wall clock. The estimate can be off by up to
    /// one poll interval and should not be used for sub-buffer synchronization.
    pub fn current_position(&self) -> u64 {
        let extra_ms = self.segment_timer.elapsed().as_millis() as u64;
        self.pool.buffers_played * self.buffer_frames
            + self.session.start_frame
            + extra_ms * self.info.sample_rate as u64 / 1000
    }

    pub fn is_playing(&self) -> bool {
        self.session.playing
    }

    pub fn start_position(&self) -> u64 {
        self.session.start_frame
    }

    pub fn end_position(&self) -> u64 {
        self.session.end_frame
    }

    /// Move the end of the range while playing
    pub fn set_end_position(&mut self, pos: u64) {
        self.session.end_frame = pos;
    }

    /// Continue filling from `pos`; already queued buffers still play out first
    pub fn set_current_position(&mut self, pos: u64) {
        self.session.cur_frame = pos;
    }

    pub fn volume(&self) -> f32 {
        self.session.volume
    }

    /// Takes effect from the next filled buffer
    pub fn set_volume(&mut self, volume: f32) {
        self.session.volume = volume.max(0.0);
    }

    pub fn buffer_frames(&self) -> u64 {
        self.buffer_frames
    }

    pub fn buffers_played(&self) -> u64 {
        self.pool.buffers_played
    }

    pub fn free_buffers(&self) -> usize {
        self.pool.free_count
    }

    pub fn queued_buffers(&self) -> usize {
        self.pool.queued_count()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn provider(&self) -> &Arc<dyn AudioProvider> {
        &self.provider
    }
}

impl Drop for StreamingPlayer {
    fn drop(&mut self) {
        self.stop();
        log::debug!("Closed stream for {}", self.provider.source_name());
    }
}
