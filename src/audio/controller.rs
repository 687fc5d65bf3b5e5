//! Playback controller
//!
//! Owns the open provider and its player, translates millisecond requests into
//! frames, and tracks which kind of playback is running so the host's timer can
//! decide when to stop. Everything runs on the caller's thread; the host drives
//! [`PlaybackController::tick`] every [`PlaybackController::tick_interval`].

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cache::{apply_cache, CacheKind};
use super::dummy::DummyProvider;
use super::error::AudioError;
use super::file::FileProvider;
use super::output::DeviceFactory;
use super::player::StreamingPlayer;
use super::provider::{AudioProvider, ProgressReporter};
use super::source::{AudioSource, VideoAccess};
use super::wav;
use crate::settings::PlaybackSettings;

/// Millisecond range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    begin: u64,
    end: u64,
}

impl TimeRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn length(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }
}

/// Supplies the range the user is currently editing
pub trait TimingSource {
    fn primary_playback_range(&self) -> TimeRange;
}

/// Loaded video whose audio track can be opened
pub trait VideoAudioSource {
    fn open_audio(&self) -> Result<Box<dyn AudioProvider>, AudioError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    NotPlaying,
    /// A fixed range
    Range,
    /// The timing source's primary range, following its end as it changes
    PrimaryRange,
    /// From a point to the end of the audio
    ToEnd,
}

/// Notifications published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    AudioOpened { source: String },
    AudioClosed,
    /// Playback position in milliseconds
    Position(u64),
    Stopped,
    Error(String),
}

pub struct PlaybackController {
    settings: PlaybackSettings,
    device_factory: Box<dyn DeviceFactory>,
    provider: Option<Arc<dyn AudioProvider>>,
    player: Option<StreamingPlayer>,
    source: Option<AudioSource>,
    /// Token the open audio came from, for reloading
    token: Option<String>,
    /// Survives the player being reopened
    volume: f32,
    mode: PlaybackMode,
    timing: Option<Box<dyn TimingSource>>,
    video: Option<Box<dyn VideoAudioSource>>,
    listeners: Vec<Sender<PlaybackEvent>>,
    last_player_tick: Instant,
}

impl PlaybackController {
    /// Controller using the output backend named in `settings`
    pub fn new(settings: PlaybackSettings) -> Self {
        let factory = Box::new(settings.output);
        Self::with_device_factory(settings, factory)
    }

    pub fn with_device_factory(settings: PlaybackSettings, device_factory: Box<dyn DeviceFactory>) -> Self {
        Self {
            volume: settings.volume,
            settings,
            device_factory,
            provider: None,
            player: None,
            source: None,
            token: None,
            mode: PlaybackMode::NotPlaying,
            timing: None,
            video: None,
            listeners: Vec::new(),
            last_player_tick: Instant::now(),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&mut self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.push(tx);
        rx
    }

    fn publish(&mut self, event: PlaybackEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    /// Changes apply to the next [`open_audio`](Self::open_audio) or
    /// [`reload_audio`](Self::reload_audio)
    pub fn settings_mut(&mut self) -> &mut PlaybackSettings {
        &mut self.settings
    }

    /// Open the source named by `token`, replacing any open audio.
    ///
    /// On failure nothing is left open.
    pub fn open_audio(&mut self, token: &str, progress: &mut dyn ProgressReporter) -> Result<(), AudioError> {
        self.close_audio();

        let result = self.open_pair(token, progress);
        match result {
            Ok((source, provider, player)) => {
                log::info!(
                    "Opened audio {}: {} Hz, {} ch, {}-bit, {} frames",
                    source,
                    provider.sample_rate(),
                    provider.channels(),
                    provider.bytes_per_sample() * 8,
                    provider.num_samples()
                );
                self.provider = Some(provider);
                self.player = Some(player);
                self.source = Some(source);
                self.token = Some(token.to_string());
                self.publish(PlaybackEvent::AudioOpened {
                    source: token.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                if e.is_cancelled() {
                    log::info!("Opening {} cancelled", token);
                } else {
                    log::error!("Failed to open audio {}: {}", token, e);
                }
                Err(e)
            }
        }
    }

    /// Open the current source again, picking up changed cache settings.
    ///
    /// Does nothing when no audio is open.
    pub fn reload_audio(&mut self, progress: &mut dyn ProgressReporter) -> Result<(), AudioError> {
        let Some(token) = self.token.clone() else {
            return Ok(());
        };
        log::info!("Reloading audio {}", token);
        self.open_audio(&token, progress)
    }

    fn open_pair(
        &self,
        token: &str,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(AudioSource, Arc<dyn AudioProvider>, StreamingPlayer), AudioError> {
        let source = AudioSource::parse(token)?;
        let provider: Arc<dyn AudioProvider> = Arc::from(self.open_provider(&source, progress)?);
        let player = self.open_player(&provider)?;
        Ok((source, provider, player))
    }

    fn open_provider(
        &self,
        source: &AudioSource,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Box<dyn AudioProvider>, AudioError> {
        let cache_dir = self.settings.cache_dir();
        let pattern = &self.settings.cache_name_pattern;

        match source {
            AudioSource::Dummy {
                signal,
                sample_rate,
                bytes_per_sample,
                channels,
                num_samples,
            } => Ok(Box::new(DummyProvider::new(
                *signal,
                *sample_rate,
                *bytes_per_sample,
                *channels,
                *num_samples,
            )?)),
            AudioSource::Video(access) => {
                let video = self
                    .video
                    .as_ref()
                    .ok_or_else(|| AudioError::open("No video is loaded"))?;
                let provider = video.open_audio()?;
                match access {
                    VideoAccess::Stream => Ok(provider),
                    VideoAccess::Cache => {
                        // Seeking through the video decoder is unreliable, so always cache
                        let kind = match self.settings.cache_kind {
                            CacheKind::None => CacheKind::Ram,
                            kind => kind,
                        };
                        apply_cache(provider, kind, &cache_dir, pattern, progress)
                    }
                }
            }
            AudioSource::File(path) => {
                let provider = Box::new(FileProvider::open(path)?);
                apply_cache(provider, self.settings.cache_kind, &cache_dir, pattern, progress)
            }
        }
    }

    fn open_player(&self, provider: &Arc<dyn AudioProvider>) -> Result<StreamingPlayer, AudioError> {
        let mut player = StreamingPlayer::open(Arc::clone(provider), self.device_factory.as_ref())?
            .with_poll_interval(self.settings.player_poll_interval());
        player.set_volume(self.volume);
        Ok(player)
    }

    /// Install a new player for the open provider, closing the audio if the
    /// device can't be opened
    fn reopen_player(&mut self) -> Result<(), AudioError> {
        let Some(provider) = self.provider.clone() else {
            return Ok(());
        };

        match self.open_player(&provider) {
            Ok(player) => {
                self.player = Some(player);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to reopen output: {}", e);
                self.close_audio();
                Err(e)
            }
        }
    }

    /// Switch the output backend.
    ///
    /// An open player is closed and reopened on the new backend. If that
    /// fails the audio is closed and the error returned. A suspended
    /// controller stays suspended and picks up the backend on
    /// [`resume`](Self::resume).
    pub fn set_device_factory(&mut self, factory: Box<dyn DeviceFactory>) -> Result<(), AudioError> {
        self.stop();
        // Release the old device before opening the new one
        let had_player = self.player.take().is_some();
        self.device_factory = factory;

        if !had_player {
            return Ok(());
        }
        self.reopen_player()?;
        log::info!("Switched output device");
        Ok(())
    }

    /// Stop playback and release the player and provider
    pub fn close_audio(&mut self) {
        if !self.is_audio_open() {
            return;
        }

        self.stop();
        self.player = None;
        self.provider = None;
        self.token = None;
        if let Some(source) = self.source.take() {
            log::info!("Closed audio {}", source);
        }
        self.publish(PlaybackEvent::AudioClosed);
    }

    pub fn is_audio_open(&self) -> bool {
        self.provider.is_some()
    }

    pub fn audio_source(&self) -> Option<&AudioSource> {
        self.source.as_ref()
    }

    pub fn provider(&self) -> Option<&Arc<dyn AudioProvider>> {
        self.provider.as_ref()
    }

    pub fn player(&self) -> Option<&StreamingPlayer> {
        self.player.as_ref()
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn set_timing_source(&mut self, timing: Option<Box<dyn TimingSource>>) {
        self.timing = timing;
    }

    pub fn set_video_source(&mut self, video: Option<Box<dyn VideoAudioSource>>) {
        self.video = video;
    }

    /// Range to play for the primary selection, empty without a timing source
    pub fn primary_playback_range(&self) -> TimeRange {
        self.timing
            .as_ref()
            .map(|t| t.primary_playback_range())
            .unwrap_or_default()
    }

    /// Frames in `ms` milliseconds, rounded up
    pub fn samples_from_ms(&self, ms: u64) -> u64 {
        match &self.provider {
            Some(p) => (ms.saturating_mul(p.sample_rate() as u64)).saturating_add(999) / 1000,
            None => 0,
        }
    }

    /// Milliseconds covered by `samples` frames, rounded down
    pub fn ms_from_samples(&self, samples: u64) -> u64 {
        match &self.provider {
            Some(p) => samples.saturating_mul(1000) / p.sample_rate() as u64,
            None => 0,
        }
    }

    /// Length of the open audio in milliseconds, rounded up
    pub fn duration_ms(&self) -> u64 {
        match &self.provider {
            Some(p) => {
                let sr = p.sample_rate() as u128;
                ((p.num_samples() as u128 * 1000 + sr - 1) / sr) as u64
            }
            None => 0,
        }
    }

    /// Start the player and record the mode, publishing the start position
    fn start_playback(&mut self, start: u64, count: u64, mode: PlaybackMode, start_ms: u64) -> Result<(), AudioError> {
        let Some(player) = self.player.as_mut() else {
            return Ok(());
        };

        if let Err(e) = player.play(start, count) {
            log::error!("Playback failed to start: {}", e);
            self.mode = PlaybackMode::NotPlaying;
            self.publish(PlaybackEvent::Error(e.to_string()));
            return Err(e);
        }

        self.mode = mode;
        self.last_player_tick = Instant::now();
        self.publish(PlaybackEvent::Position(start_ms));
        Ok(())
    }

    pub fn play_range(&mut self, range: TimeRange) -> Result<(), AudioError> {
        if !self.is_audio_open() {
            return Ok(());
        }

        let start = self.samples_from_ms(range.begin());
        let count = self.samples_from_ms(range.length());
        self.start_playback(start, count, PlaybackMode::Range, range.begin())
    }

    pub fn play_primary_range(&mut self) -> Result<(), AudioError> {
        let range = self.primary_playback_range();
        self.play_range(range)?;
        if self.mode == PlaybackMode::Range {
            self.mode = PlaybackMode::PrimaryRange;
        }
        Ok(())
    }

    /// Play from `start_ms` to the end of the primary range
    pub fn play_to_end_of_primary(&mut self, start_ms: u64) -> Result<(), AudioError> {
        if !self.is_audio_open() {
            return Ok(());
        }

        let end = self.primary_playback_range().end();
        self.play_range(TimeRange::new(start_ms, end))?;
        if self.mode == PlaybackMode::Range {
            self.mode = PlaybackMode::PrimaryRange;
        }
        Ok(())
    }

    pub fn play_to_end(&mut self, start_ms: u64) -> Result<(), AudioError> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };

        let num_samples = provider.num_samples();
        let start = self.samples_from_ms(start_ms);
        self.start_playback(start, num_samples.saturating_sub(start), PlaybackMode::ToEnd, start_ms)
    }

    pub fn stop(&mut self) {
        if let Some(player) = self.player.as_mut() {
            player.stop();
        }
        if self.mode != PlaybackMode::NotPlaying {
            self.mode = PlaybackMode::NotPlaying;
            self.publish(PlaybackEvent::Stopped);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_audio_open() && self.mode != PlaybackMode::NotPlaying
    }

    /// Estimated position in milliseconds, 0 when not playing
    pub fn playback_position_ms(&self) -> u64 {
        match &self.player {
            Some(player) if self.is_playing() => self.ms_from_samples(player.current_position()),
            _ => 0,
        }
    }

    /// Continue playback from `ms` after the already queued audio
    pub fn resync_playback_position(&mut self, ms: u64) {
        if !self.is_playing() {
            return;
        }
        let pos = self.samples_from_ms(ms);
        if let Some(player) = self.player.as_mut() {
            player.set_current_position(pos);
        }
    }

    /// Follow a change of the primary range while it is playing
    pub fn on_primary_range_updated(&mut self) {
        if self.mode != PlaybackMode::PrimaryRange {
            return;
        }
        let end = self.samples_from_ms(self.primary_playback_range().end());
        if let Some(player) = self.player.as_mut() {
            player.set_end_position(end);
        }
    }

    /// Playback volume, 1.0 when no audio is open
    pub fn volume(&self) -> f32 {
        if self.is_audio_open() {
            self.volume
        } else {
            1.0
        }
    }

    /// Ignored while no audio is open
    pub fn set_volume(&mut self, volume: f32) {
        if !self.is_audio_open() {
            return;
        }
        self.volume = volume;
        if let Some(player) = self.player.as_mut() {
            player.set_volume(volume);
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.settings.position_poll_interval()
    }

    /// Timer callback: keeps the player fed, stops finished playback and
    /// publishes the position.
    pub fn tick(&mut self) {
        if self.mode == PlaybackMode::NotPlaying {
            return;
        }

        let poll = {
            let Some(player) = self.player.as_mut() else {
                return;
            };
            if self.last_player_tick.elapsed() >= player.poll_interval() {
                self.last_player_tick = Instant::now();
                player.tick()
            } else {
                Ok(())
            }
        };

        if let Err(e) = poll {
            log::error!("Playback stopped: {}", e);
            self.stop();
            self.publish(PlaybackEvent::Error(e.to_string()));
            return;
        }

        let Some((pos, end, playing)) = self
            .player
            .as_ref()
            .map(|p| (p.current_position(), p.end_position(), p.is_playing()))
        else {
            return;
        };

        let slack = self.samples_from_ms(self.settings.stop_slack_ms);
        if !playing || (self.mode != PlaybackMode::ToEnd && pos >= end.saturating_add(slack)) {
            self.stop();
        } else {
            let ms = self.ms_from_samples(pos);
            self.publish(PlaybackEvent::Position(ms));
        }
    }

    /// Write `range` of the open audio to a WAV file.
    ///
    /// An empty range, or one starting past the end of the audio, writes nothing.
    pub fn save_clip(&self, path: &Path, range: TimeRange) -> Result<(), AudioError> {
        let Some(provider) = &self.provider else {
            return Err(AudioError::open("No audio is open"));
        };

        let start = self.samples_from_ms(range.begin());
        let end = self.samples_from_ms(range.end());
        if range.length() == 0 || start > provider.num_samples() {
            return Ok(());
        }

        let file = File::create(path).map_err(|e| AudioError::open(format!("{}: {}", path.display(), e)))?;
        let mut out = BufWriter::new(file);
        let bytes = wav::export_clip(provider.as_ref(), start, end, &mut out)?;

        log::info!("Saved {} ms clip to {} ({} bytes)", range.length(), path.display(), bytes);
        Ok(())
    }

    /// Release the output device while keeping the audio open
    pub fn suspend(&mut self) {
        self.stop();
        if self.player.take().is_some() {
            log::info!("Output suspended");
        }
    }

    /// Reacquire the output device after [`suspend`](Self::suspend)
    pub fn resume(&mut self) -> Result<(), AudioError> {
        if self.player.is_some() || !self.is_audio_open() {
            return Ok(());
        }
        self.reopen_player()?;
        log::info!("Output resumed");
        Ok(())
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.close_audio();
    }
}
