//! RIFF/WAVE clip export
//!
//! Clips are streamed from the provider in 64 KiB blocks, so exporting a long
//! range never holds more than one block in memory.

use std::io::{self, Write};

use super::error::AudioError;
use super::provider::{read_i16, AudioInfo, AudioProvider};

/// Bytes read from the provider per block
pub const EXPORT_BLOCK_BYTES: usize = 65536;

/// `(block_align, byte_rate)`, or `None` when either overflows its header field
fn format_fields(info: &AudioInfo) -> Option<(u16, u32)> {
    let block_align = info.channels.checked_mul(info.bytes_per_sample)?;
    let byte_rate = info.sample_rate.checked_mul(block_align as u32)?;
    Some((block_align, byte_rate))
}

/// Write the canonical 44-byte PCM header for `data_size` bytes of samples
pub fn write_header<W: Write>(out: &mut W, info: &AudioInfo, data_size: u32) -> Result<(), AudioError> {
    let (block_align, byte_rate) = format_fields(info).ok_or_else(|| {
        AudioError::open(format!(
            "{} Hz, {} ch, {}-bit does not fit a WAV header",
            info.sample_rate,
            info.channels,
            info.bytes_per_sample as u32 * 8
        ))
    })?;
    write_header_fields(out, info, data_size, block_align, byte_rate)
        .map_err(|e| AudioError::open(format!("Writing clip: {}", e)))
}

fn write_header_fields<W: Write>(
    out: &mut W,
    info: &AudioInfo,
    data_size: u32,
    block_align: u16,
    byte_rate: u32,
) -> io::Result<()> {
    out.write_all(b"RIFF")?;
    out.write_all(&data_size.wrapping_add(36).to_le_bytes())?;
    out.write_all(b"WAVEfmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&info.channels.to_le_bytes())?;
    out.write_all(&info.sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&(info.bytes_per_sample * 8).to_le_bytes())?;
    out.write_all(b"data")?;
    out.write_all(&data_size.to_le_bytes())?;
    Ok(())
}

/// Write frames `start..end` of `provider` as a complete WAV file.
///
/// Returns the number of PCM bytes written.
pub fn export_clip<W: Write>(
    provider: &dyn AudioProvider,
    start: u64,
    end: u64,
    out: &mut W,
) -> Result<u64, AudioError> {
    let info = *provider.info();
    let bpf = info.bytes_per_frame();
    let frames = end.saturating_sub(start);
    let data_size = frames
        .checked_mul(bpf as u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| n.checked_add(36).is_some())
        .ok_or_else(|| AudioError::open(format!("Clip of {} frames is too large for WAV", frames)))?;

    let io_err = |e: io::Error| AudioError::open(format!("Writing clip: {}", e));
    write_header(out, &info, data_size)?;

    let block_frames = (EXPORT_BLOCK_BYTES / bpf).max(1) as u64;
    let mut buf = vec![0u8; block_frames as usize * bpf];
    let mut pos = start;
    while pos < end {
        let len = block_frames.min(end - pos);
        let bytes = &mut buf[..len as usize * bpf];
        provider.get_audio(bytes, pos, len)?;
        to_little_endian(bytes, &info);
        out.write_all(bytes).map_err(io_err)?;
        pos += len;
    }
    out.flush().map_err(io_err)?;

    log::debug!(
        "Exported frames {}..{} of {} ({} bytes)",
        start,
        end,
        provider.source_name(),
        data_size
    );
    Ok(data_size as u64)
}

fn to_little_endian(bytes: &mut [u8], info: &AudioInfo) {
    if info.bytes_per_sample != 2 {
        return;
    }
    for chunk in bytes.chunks_exact_mut(2) {
        let sample = read_i16(chunk, info.native_endian);
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}
