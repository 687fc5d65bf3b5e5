//! Audio source tokens
//!
//! The controller is opened with a short scheme-tagged string:
//!
//! - `dummy-audio:silence` or `dummy-audio:noise`, optionally followed by
//!   `?sr=<rate>&bd=<bits>&ch=<channels>&ln=<samples>`
//! - `video-audio:stream` or `video-audio:cache` for the audio track of the loaded video
//! - `file://<path>` or a plain filesystem path

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::dummy::Signal;
use super::error::AudioError;

const DUMMY_SCHEME: &str = "dummy-audio:";
const VIDEO_SCHEME: &str = "video-audio:";
const FILE_SCHEME: &str = "file://";

/// Default dummy length: 150 minutes
const DUMMY_DEFAULT_MS: u64 = 5 * 30 * 60 * 1000;

/// How audio taken from the loaded video is accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoAccess {
    /// Read through the video's own decoder
    Stream,
    /// Copy into a cache first
    Cache,
}

/// Parsed source token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Dummy {
        signal: Signal,
        sample_rate: u32,
        bytes_per_sample: u16,
        channels: u16,
        num_samples: u64,
    },
    Video(VideoAccess),
    File(PathBuf),
}

impl AudioSource {
    pub fn parse(token: &str) -> Result<Self, AudioError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AudioError::open("Empty audio source"));
        }

        if let Some(rest) = token.strip_prefix(DUMMY_SCHEME) {
            return parse_dummy(rest);
        }

        if let Some(rest) = token.strip_prefix(VIDEO_SCHEME) {
            return match rest {
                "stream" => Ok(Self::Video(VideoAccess::Stream)),
                "cache" => Ok(Self::Video(VideoAccess::Cache)),
                other => Err(AudioError::open(format!("Unknown video audio mode '{}'", other))),
            };
        }

        let path = token.strip_prefix(FILE_SCHEME).unwrap_or(token);
        if path.is_empty() {
            return Err(AudioError::open("Empty audio file path"));
        }
        Ok(Self::File(PathBuf::from(path)))
    }
}

impl FromStr for AudioSource {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dummy {
                signal,
                sample_rate,
                bytes_per_sample,
                channels,
                num_samples,
            } => {
                let kind = match signal {
                    Signal::Silence => "silence",
                    Signal::Noise => "noise",
                };
                write!(
                    f,
                    "{}{}?sr={}&bd={}&ch={}&ln={}",
                    DUMMY_SCHEME,
                    kind,
                    sample_rate,
                    bytes_per_sample * 8,
                    channels,
                    num_samples
                )
            }
            Self::Video(VideoAccess::Stream) => write!(f, "{}stream", VIDEO_SCHEME),
            Self::Video(VideoAccess::Cache) => write!(f, "{}cache", VIDEO_SCHEME),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn parse_dummy(rest: &str) -> Result<AudioSource, AudioError> {
    let (kind, query) = rest.split_once('?').unwrap_or((rest, ""));
    let signal = match kind {
        "silence" => Signal::Silence,
        "noise" => Signal::Noise,
        other => return Err(AudioError::open(format!("Unknown dummy audio type '{}'", other))),
    };

    let mut sample_rate: u32 = 44100;
    let mut bits: u16 = 16;
    let mut channels: u16 = 1;
    let mut num_samples: Option<u64> = None;

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AudioError::open(format!("Malformed dummy audio parameter '{}'", pair)))?;
        match key {
            "sr" => sample_rate = parse_number(key, value)?,
            "bd" => bits = parse_number(key, value)?,
            "ch" => channels = parse_number(key, value)?,
            "ln" => num_samples = Some(parse_number(key, value)?),
            _ => log::warn!("Ignoring unknown dummy audio parameter '{}'", key),
        }
    }

    if bits % 8 != 0 {
        return Err(AudioError::open(format!("Unsupported dummy bit depth {}", bits)));
    }

    Ok(AudioSource::Dummy {
        signal,
        sample_rate,
        bytes_per_sample: bits / 8,
        channels,
        num_samples: num_samples.unwrap_or(DUMMY_DEFAULT_MS * sample_rate as u64 / 1000),
    })
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, AudioError> {
    value
        .parse()
        .map_err(|_| AudioError::open(format!("Invalid value '{}' for dummy audio parameter '{}'", value, key)))
}
