//! Caching providers
//!
//! Both caches fully materialize a source before they exist: population copies the
//! source block by block, reports progress, and polls for cancellation after every
//! block. A cancelled or failed population never yields a provider.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::AudioError;
use super::provider::{AudioInfo, AudioProvider, ProgressReporter};

/// Frames copied per population step
pub const CACHE_BLOCK_FRAMES: u64 = 4096;

/// Placeholder replaced by the two-digit slot number in cache file names
const SLOT_PLACEHOLDER: &str = "%02i";
const DEFAULT_NAME_PATTERN: &str = "audio%02i.tmp";
const MAX_SLOTS: u32 = 100;

/// Copy `source` block by block into `sink`
fn populate(
    source: &dyn AudioProvider,
    progress: &mut dyn ProgressReporter,
    mut sink: impl FnMut(&[u8]) -> Result<(), AudioError>,
) -> Result<(), AudioError> {
    let info = *source.info();
    let bpf = info.bytes_per_frame();
    let total = info.num_samples;
    let mut block = vec![0u8; CACHE_BLOCK_FRAMES as usize * bpf];

    let mut pos = 0u64;
    while pos < total {
        let count = CACHE_BLOCK_FRAMES.min(total - pos);
        let bytes = &mut block[..count as usize * bpf];
        source.get_audio(bytes, pos, count)?;
        sink(bytes)?;
        pos += count;

        progress.set_progress(pos, total);
        if progress.is_cancelled() {
            return Err(AudioError::UserCancelled(
                "Audio loading cancelled by user".to_string(),
            ));
        }
    }
    Ok(())
}

/// Scratch file that closes and deletes itself when dropped
struct ScratchFile {
    path: PathBuf,
    file: Option<File>,
}

impl ScratchFile {
    /// Claim the first free slot of `pattern` inside `dir`
    fn create(dir: &Path, pattern: &str) -> Result<Self, AudioError> {
        let pattern = if pattern.contains(SLOT_PLACEHOLDER) {
            pattern
        } else {
            DEFAULT_NAME_PATTERN
        };

        for slot in 0..MAX_SLOTS {
            let path = dir.join(pattern.replacen(SLOT_PLACEHOLDER, &format!("{:02}", slot), 1));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        file: Some(file),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(AudioError::open(format!(
                        "Unable to write to audio disk cache {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(AudioError::open(format!(
            "No free audio cache slot in {}",
            dir.display()
        )))
    }

    fn file(&mut self) -> std::io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::Other, "audio cache closed"))
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        // Close before deleting; some platforms refuse to remove open files
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove audio cache {}: {}", self.path.display(), e);
        }
    }
}

/// Provider serving reads from a raw PCM dump of its source on local disk
pub struct DiskCacheProvider {
    info: AudioInfo,
    name: String,
    /// Seek and read must happen as one step
    store: Mutex<ScratchFile>,
}

impl DiskCacheProvider {
    /// Copy `source` into a new scratch file in `dir`.
    ///
    /// `pattern` names the file; `%02i` is replaced by the first free slot number.
    pub fn new(
        source: Box<dyn AudioProvider>,
        dir: &Path,
        pattern: &str,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Self, AudioError> {
        let info = *source.info();
        let required = info
            .total_bytes()
            .ok_or_else(|| AudioError::open("Audio too large to cache"))?;

        match fs2::available_space(dir) {
            Ok(free) if required > free => {
                return Err(AudioError::open(format!(
                    "Not enough free disk space in {} to cache the audio ({} bytes needed, {} free)",
                    dir.display(),
                    required,
                    free
                )));
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not query free space in {}: {}", dir.display(), e),
        }

        let mut scratch = ScratchFile::create(dir, pattern)?;
        log::info!(
            "Caching {} to {} ({} bytes)",
            source.source_name(),
            scratch.path.display(),
            required
        );

        // Any early return from here drops `scratch`, which deletes the file
        let path = scratch.path.clone();
        populate(source.as_ref(), progress, |bytes| {
            scratch
                .file()
                .and_then(|f| f.write_all(bytes))
                .map_err(|e| AudioError::open(format!("Writing {}: {}", path.display(), e)))
        })?;

        scratch
            .file()
            .and_then(|f| {
                f.flush()?;
                f.seek(SeekFrom::Start(0))
            })
            .map_err(|e| AudioError::open(format!("Finishing {}: {}", path.display(), e)))?;

        Ok(Self {
            info,
            name: source.source_name().to_string(),
            store: Mutex::new(scratch),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> PathBuf {
        self.store.lock().path.clone()
    }
}

impl AudioProvider for DiskCacheProvider {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn fill_buffer(&self, buf: &mut [u8], start: u64) -> Result<(), AudioError> {
        let offset = start * self.info.bytes_per_frame() as u64;
        let mut store = self.store.lock();
        store
            .file()
            .and_then(|f| {
                f.seek(SeekFrom::Start(offset))?;
                f.read_exact(buf)
            })
            .map_err(|e| AudioError::decode(format!("Reading audio cache: {}", e)))
    }
}

/// Provider serving reads from a copy of its source held in memory
pub struct RamCacheProvider {
    info: AudioInfo,
    name: String,
    data: Vec<u8>,
}

impl RamCacheProvider {
    pub fn new(
        source: Box<dyn AudioProvider>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Self, AudioError> {
        let info = *source.info();
        let required = info
            .total_bytes()
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| AudioError::open("Audio too large to cache in memory"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(required)
            .map_err(|e| AudioError::open(format!("Not enough memory to cache audio: {}", e)))?;

        log::info!("Caching {} in memory ({} bytes)", source.source_name(), required);
        populate(source.as_ref(), progress, |bytes| {
            data.extend_from_slice(bytes);
            Ok(())
        })?;

        Ok(Self {
            info,
            name: source.source_name().to_string(),
            data,
        })
    }
}

impl AudioProvider for RamCacheProvider {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn fill_buffer(&self, buf: &mut [u8], start: u64) -> Result<(), AudioError> {
        let offset = start as usize * self.info.bytes_per_frame();
        let src = self
            .data
            .get(offset..offset + buf.len())
            .ok_or_else(|| AudioError::decode("read outside cached audio"))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Cache placed in front of a source when audio is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheKind {
    /// Read the source directly
    None,
    Ram,
    #[default]
    Disk,
}

/// Wrap `source` in the cache selected by `kind`
pub fn apply_cache(
    source: Box<dyn AudioProvider>,
    kind: CacheKind,
    dir: &Path,
    pattern: &str,
    progress: &mut dyn ProgressReporter,
) -> Result<Box<dyn AudioProvider>, AudioError> {
    match kind {
        CacheKind::None => Ok(source),
        CacheKind::Ram => Ok(Box::new(RamCacheProvider::new(source, progress)?)),
        CacheKind::Disk => Ok(Box::new(DiskCacheProvider::new(source, dir, pattern, progress)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::provider::testing::{BrokenProvider, RampProvider};

    /// Progress sink that cancels after a fixed number of blocks
    struct CancelAfter {
        blocks: u64,
        seen: u64,
        last: (u64, u64),
    }

    impl CancelAfter {
        fn never() -> Self {
            Self {
                blocks: u64::MAX,
                seen: 0,
                last: (0, 0),
            }
        }
    }

    impl ProgressReporter for CancelAfter {
        fn set_progress(&mut self, done: u64, total: u64) {
            self.seen += 1;
            self.last = (done, total);
        }

        fn is_cancelled(&self) -> bool {
            self.seen >= self.blocks
        }
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_disk_cache_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let reference = RampProvider::new(2, 8000, 2, 10_000);
        let source = Box::new(RampProvider::new(2, 8000, 2, 10_000));
        let mut progress = CancelAfter::never();

        let cache = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut progress).unwrap();
        assert_eq!(progress.last, (10_000, 10_000));
        assert_eq!(progress.seen, 3);
        assert_eq!(
            std::fs::metadata(cache.path()).unwrap().len(),
            10_000 * 4
        );

        for (start, count) in [(0u64, 1u64), (4095, 2), (1234, 5000), (9990, 10)] {
            let mut a = vec![0u8; count as usize * 4];
            let mut b = vec![0u8; count as usize * 4];
            cache.get_audio(&mut a, start, count).unwrap();
            reference.get_audio(&mut b, start, count).unwrap();
            assert_eq!(a, b, "start={} count={}", start, count);
        }
    }

    #[test]
    fn test_disk_cache_zero_fills_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let source = Box::new(RampProvider::new(1, 8000, 1, 100));
        let cache = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut CancelAfter::never()).unwrap();

        let mut buf = vec![0xEEu8; 20];
        cache.get_audio(&mut buf, 90, 20).unwrap();

        assert!(buf[..10].iter().all(|&b| b != 0));
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_cache_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let source = Box::new(RampProvider::new(1, 8000, 2, 500));
        let cache = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut CancelAfter::never()).unwrap();
        let path = cache.path();
        assert!(path.exists());

        drop(cache);

        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_disk_cache_cancel_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = Box::new(RampProvider::new(1, 8000, 2, 50_000));
        let mut progress = CancelAfter {
            blocks: 2,
            seen: 0,
            last: (0, 0),
        };

        let err = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut progress)
            .err()
            .unwrap();

        assert!(err.is_cancelled());
        assert_eq!(progress.seen, 2);
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_disk_cache_insufficient_space() {
        let dir = tempfile::tempdir().unwrap();
        // Far more bytes than any disk reports free
        let source = Box::new(RampProvider::new(2, 48000, 2, u64::MAX / 8));

        let err = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut CancelAfter::never())
            .err()
            .unwrap();

        assert!(matches!(err, AudioError::Open(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_disk_cache_source_error_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let source = Box::new(BrokenProvider {
            info: AudioInfo {
                channels: 1,
                sample_rate: 8000,
                bytes_per_sample: 2,
                num_samples: 100,
                native_endian: true,
            },
        });

        let err = DiskCacheProvider::new(source, dir.path(), "audio%02i.tmp", &mut CancelAfter::never())
            .err()
            .unwrap();

        assert!(matches!(err, AudioError::Decode(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_disk_cache_picks_next_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("audio00.tmp"), b"taken").unwrap();

        let first = DiskCacheProvider::new(
            Box::new(RampProvider::new(1, 8000, 1, 10)),
            dir.path(),
            "audio%02i.tmp",
            &mut CancelAfter::never(),
        )
        .unwrap();
        let second = DiskCacheProvider::new(
            Box::new(RampProvider::new(1, 8000, 1, 10)),
            dir.path(),
            "no-placeholder",
            &mut CancelAfter::never(),
        )
        .unwrap();

        assert_eq!(first.path(), dir.path().join("audio01.tmp"));
        assert_eq!(second.path(), dir.path().join("audio02.tmp"));
    }

    #[test]
    fn test_ram_cache_matches_source() {
        let reference = RampProvider::new(2, 8000, 1, 9000);
        let cache = RamCacheProvider::new(
            Box::new(RampProvider::new(2, 8000, 1, 9000)),
            &mut CancelAfter::never(),
        )
        .unwrap();

        let mut a = vec![0u8; 3000 * 2];
        let mut b = vec![0u8; 3000 * 2];
        cache.get_audio(&mut a, 7000, 3000).unwrap();
        reference.get_audio(&mut b, 7000, 3000).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.source_name(), "ramp");
    }

    #[test]
    fn test_ram_cache_cancel() {
        let mut progress = CancelAfter {
            blocks: 1,
            seen: 0,
            last: (0, 0),
        };
        let result = RamCacheProvider::new(Box::new(RampProvider::new(1, 8000, 2, 20_000)), &mut progress);
        assert!(result.err().unwrap().is_cancelled());
    }

    #[test]
    fn test_apply_cache_kinds() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [CacheKind::None, CacheKind::Ram, CacheKind::Disk] {
            let provider = apply_cache(
                Box::new(RampProvider::new(1, 8000, 2, 100)),
                kind,
                dir.path(),
                "audio%02i.tmp",
                &mut CancelAfter::never(),
            )
            .unwrap();
            assert_eq!(provider.num_samples(), 100);
            assert_eq!(entries(dir.path()), usize::from(kind == CacheKind::Disk));
        }
        assert_eq!(entries(dir.path()), 0);
    }
}
