//! # WAV Sinks
//!
//! Streaming WAV writers for the server's persisted audio: one raw file per
//! connection and one file per detected turn. Samples are appended as they
//! arrive; the header is patched on [`WavSink::finalize`] (or on drop).

use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::SinkError;

/// Format of the PCM arriving on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bits: u16,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bits: 16,
            channels: 1,
        }
    }
}

impl StreamFormat {
    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits,
            sample_format: SampleFormat::Int,
        }
    }
}

pub struct WavSink {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    bytes_written: u64,
}

impl WavSink {
    pub fn create(path: &Path, format: StreamFormat) -> Result<Self, SinkError> {
        let writer = WavWriter::create(path, format.wav_spec()).map_err(|source| SinkError::Create {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append little-endian 16-bit PCM. A dangling odd byte is dropped.
    pub fn write_pcm_le(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        for pair in pcm.chunks_exact(2) {
            self.writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        self.bytes_written += (pcm.len() - pcm.len() % 2) as u64;
        Ok(())
    }

    /// Patch the header and close the file, returning its path.
    pub fn finalize(self) -> Result<PathBuf, SinkError> {
        self.writer.finalize()?;
        Ok(self.path)
    }
}

impl std::fmt::Debug for WavSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSink")
            .field("path", &self.path)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// Replace everything except ASCII alphanumerics, `-` and `_` with `_`.
pub fn sanitize_device(device: &str) -> String {
    device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `<out_dir>/<device>_<prefix><YYYYmmdd_HHMMSS_mmm>.wav`, creating `out_dir`
/// if needed. A numeric suffix is appended if the name is already taken.
pub fn build_output_path(out_dir: &Path, device: &str, prefix: &str) -> Result<PathBuf, SinkError> {
    std::fs::create_dir_all(out_dir)?;

    let stem = format!(
        "{}_{}{}",
        sanitize_device(device),
        prefix,
        Local::now().format("%Y%m%d_%H%M%S_%3f")
    );

    let mut path = out_dir.join(format!("{stem}.wav"));
    let mut n = 1;
    while path.exists() {
        path = out_dir.join(format!("{stem}_{n}.wav"));
        n += 1;
    }
    Ok(path)
}
