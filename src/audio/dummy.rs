//! Generated silence and white-noise sources

use rand::Rng;

use super::error::AudioError;
use super::provider::{AudioInfo, AudioProvider};

/// Signal produced by a [`DummyProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Silence,
    Noise,
}

/// Provider that synthesizes its samples instead of decoding them
pub struct DummyProvider {
    info: AudioInfo,
    signal: Signal,
    name: String,
}

impl DummyProvider {
    pub fn new(
        signal: Signal,
        sample_rate: u32,
        bytes_per_sample: u16,
        channels: u16,
        num_samples: u64,
    ) -> Result<Self, AudioError> {
        if !matches!(bytes_per_sample, 1 | 2) {
            return Err(AudioError::open(format!(
                "Dummy audio: unsupported bit depth {}",
                bytes_per_sample * 8
            )));
        }
        if channels == 0 || sample_rate == 0 {
            return Err(AudioError::open(
                "Dummy audio: sample rate and channel count must be non-zero",
            ));
        }

        let name = match signal {
            Signal::Silence => "dummy-audio:silence",
            Signal::Noise => "dummy-audio:noise",
        };

        Ok(Self {
            info: AudioInfo {
                channels,
                sample_rate,
                bytes_per_sample,
                num_samples,
                native_endian: true,
            },
            signal,
            name: name.to_string(),
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl AudioProvider for DummyProvider {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn fill_buffer(&self, buf: &mut [u8], _start: u64) -> Result<(), AudioError> {
        match self.signal {
            Signal::Silence => buf.fill(0),
            Signal::Noise => {
                // Same value in every channel of a frame
                let mut rng = rand::thread_rng();
                let bpf = self.info.bytes_per_frame();
                for frame in buf.chunks_exact_mut(bpf) {
                    match self.info.bytes_per_sample {
                        1 => {
                            let v: u8 = rng.gen_range(88..=168);
                            frame.fill(v);
                        }
                        _ => {
                            let v: i16 = rng.gen_range(-5000..=5000);
                            for sample in frame.chunks_exact_mut(2) {
                                sample.copy_from_slice(&v.to_ne_bytes());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let provider = DummyProvider::new(Signal::Silence, 8000, 1, 1, 1000).unwrap();
        let mut buf = vec![0x7Fu8; 100];

        provider.get_audio(&mut buf, 0, 100).unwrap();

        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_noise_channels_match() {
        let provider = DummyProvider::new(Signal::Noise, 44100, 2, 2, 44100).unwrap();
        let mut buf = vec![0u8; 400];

        provider.get_audio(&mut buf, 0, 100).unwrap();

        for frame in buf.chunks(4) {
            assert_eq!(frame[0..2], frame[2..4]);
            let v = i16::from_ne_bytes([frame[0], frame[1]]);
            assert!((-5000..=5000).contains(&v));
        }
    }

    #[test]
    fn test_rejects_bad_format() {
        assert!(DummyProvider::new(Signal::Silence, 44100, 3, 1, 10).is_err());
        assert!(DummyProvider::new(Signal::Silence, 0, 2, 1, 10).is_err());
        assert!(DummyProvider::new(Signal::Silence, 44100, 2, 0, 10).is_err());
    }

    #[test]
    fn test_metadata() {
        let provider = DummyProvider::new(Signal::Noise, 22050, 2, 2, 500).unwrap();
        assert_eq!(provider.channels(), 2);
        assert_eq!(provider.sample_rate(), 22050);
        assert_eq!(provider.num_samples(), 500);
        assert_eq!(provider.source_name(), "dummy-audio:noise");
        assert_eq!(provider.signal(), Signal::Noise);
    }
}
