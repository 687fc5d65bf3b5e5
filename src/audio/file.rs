//! Audio file source
//!
//! Decodes audio files with symphonia into interleaved 16-bit PCM. Reads are
//! sequential-friendly: a read that continues where the previous one stopped keeps
//! decoding forward, anything else seeks first.

use std::fs::File;
use std::path::Path;

use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use super::error::AudioError;
use super::provider::{AudioInfo, AudioProvider};

/// Convert a track timestamp into a frame index
fn ts_to_frame(ts: u64, time_base: TimeBase, sample_rate: u32) -> u64 {
    (ts as u128 * time_base.numer as u128 * sample_rate as u128 / time_base.denom as u128) as u64
}

/// Convert a frame index into a track timestamp, rounding down
fn frame_to_ts(frame: u64, time_base: TimeBase, sample_rate: u32) -> u64 {
    (frame as u128 * time_base.denom as u128 / (time_base.numer as u128 * sample_rate as u128)) as u64
}

/// Decoder state, advanced by every read
struct DecodeState {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    /// Units of packet and seek timestamps; not always 1/sample_rate (e.g. MP4)
    time_base: TimeBase,
    /// Interleaved samples of the last decoded packet
    pending: Vec<i16>,
    /// Frame index of `pending[0]`
    pending_frame: u64,
    /// Frames of `pending` already handed out
    offset: usize,
    eof: bool,
}

impl DecodeState {
    fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    /// Frame index of the next frame a read would get
    fn cursor(&self) -> u64 {
        self.pending_frame + self.offset as u64
    }

    fn seek(&mut self, frame: u64) -> Result<(), AudioError> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame_to_ts(frame, self.time_base, self.sample_rate),
                    track_id: self.track_id,
                },
            )
            .map_err(|e| AudioError::decode(format!("seek to frame {} failed: {}", frame, e)))?;

        // The reader may land before the target; `read` skips the lead-in
        let landed = ts_to_frame(seeked.actual_ts, self.time_base, self.sample_rate);
        log::debug!("Seek to {} landed on {}", frame, landed);
        self.decoder.reset();
        self.pending.clear();
        self.pending_frame = landed;
        self.offset = 0;
        self.eof = false;
        Ok(())
    }

    /// Decode the next packet of our track into `pending`
    fn decode_next(&mut self) -> Result<(), AudioError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                // End of stream is reported as an unexpected EOF
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(AudioError::decode(e.to_string())),
            };

            // Skip packets belonging to other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if spec.channels.count() != self.channels {
                        return Err(AudioError::decode(format!(
                            "channel count changed mid-stream ({} -> {})",
                            self.channels,
                            spec.channels.count()
                        )));
                    }
                    let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);

                    self.pending.clear();
                    self.pending.extend_from_slice(samples.samples());
                    self.pending_frame = ts_to_frame(packet.ts(), self.time_base, self.sample_rate);
                    self.offset = 0;
                    return Ok(());
                }
                // A corrupt packet costs a short gap, not the whole read
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(AudioError::decode(e.to_string())),
            }
        }
    }

    /// Fill `out` with frames starting at `start`
    fn read(&mut self, out: &mut [u8], start: u64) -> Result<(), AudioError> {
        if start != self.cursor() {
            self.seek(start)?;
        }

        let bpf = self.channels * 2;
        let wanted = out.len() / bpf;
        let mut written = 0usize;

        while written < wanted {
            let avail = self.pending_frames() - self.offset;
            if avail == 0 {
                if self.eof {
                    out[written * bpf..].fill(0);
                    break;
                }
                self.decode_next()?;
                continue;
            }

            let target = start + written as u64;
            let cursor = self.cursor();
            if cursor < target {
                // Seek landed before the target; drop the lead-in
                self.offset += avail.min((target - cursor) as usize);
                continue;
            }
            if cursor > target {
                // Gap in the stream timestamps; pad with silence
                let gap = ((cursor - target) as usize).min(wanted - written);
                out[written * bpf..(written + gap) * bpf].fill(0);
                written += gap;
                continue;
            }

            // Cursor and target agree: copy straight out of the packet
            let n = avail.min(wanted - written);
            let from = self.offset * self.channels;
            let to = (self.offset + n) * self.channels;
            let dest = &mut out[written * bpf..(written + n) * bpf];
            for (bytes, sample) in dest.chunks_exact_mut(2).zip(&self.pending[from..to]) {
                bytes.copy_from_slice(&sample.to_ne_bytes());
            }
            written += n;
            self.offset += n;
        }

        Ok(())
    }
}

/// Provider decoding an audio file on demand
pub struct FileProvider {
    /// Always 16-bit native-endian, whatever the file holds
    info: AudioInfo,
    /// Path, for logs and errors
    name: String,
    /// One decoder serves every reader in turn
    state: Mutex<DecodeState>,
}

impl FileProvider {
    /// Open an audio file and detect its format
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| AudioError::open(format!("{}: {}", path.display(), e)))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let detected = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::open(format!("Unrecognised audio format: {}", e)))?;

        let format = detected.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::open("No audio tracks found"))?;

        let codec_params = &track.codec_params;
        let track_id = track.id;

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| AudioError::open("Unknown sample rate"))?;
        let channels = codec_params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| AudioError::open("Unknown channel layout"))?;
        if sample_rate == 0 {
            return Err(AudioError::open("Invalid sample rate 0"));
        }
        let time_base = codec_params
            .time_base
            .unwrap_or_else(|| TimeBase::new(1, sample_rate));
        let num_samples = codec_params
            .n_frames
            .map(|n| ts_to_frame(n, time_base, sample_rate))
            .ok_or_else(|| AudioError::open("Unknown stream length"))?;

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::open(format!("Unsupported codec: {}", e)))?;

        let channels = u16::try_from(channels)
            .map_err(|_| AudioError::open(format!("Too many channels: {}", channels)))?;

        log::info!(
            "Opened audio file {:?}: {} Hz, {} ch, {} frames",
            path,
            sample_rate,
            channels,
            num_samples
        );

        Ok(Self {
            info: AudioInfo {
                channels,
                sample_rate,
                bytes_per_sample: 2,
                num_samples,
                native_endian: true,
            },
            name: path.display().to_string(),
            state: Mutex::new(DecodeState {
                format,
                decoder,
                track_id,
                channels: channels as usize,
                sample_rate,
                time_base,
                pending: Vec::new(),
                pending_frame: 0,
                offset: 0,
                eof: false,
            }),
        })
    }
}

impl AudioProvider for FileProvider {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn fill_buffer(&self, buf: &mut [u8], start: u64) -> Result<(), AudioError> {
        self.state.lock().read(buf, start)
    }
}
