//! # Capture Sources
//!
//! Where raw capture words come from. The supervisor only sees the
//! [`CaptureBackend`] / [`CaptureSource`] traits, so a microphone driver, a
//! file replay or a test double are interchangeable.
//!
//! ## Provided implementations:
//! - **RawFileBackend**: replays a recorded raw capture dump at real-time
//!   pace, standing in for the I2S peripheral on a development host
//! - **AlwaysUp**: link monitor for hosts where network association is
//!   managed outside the process

use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

use crate::audio::extract::CaptureFormat;

/// An opened capture device.
pub trait CaptureSource: Send {
    /// Copy available capture bytes into `buf` without waiting for more.
    ///
    /// `Ok(0)` means nothing is ready yet; the caller should yield briefly.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the device. Called exactly once on every teardown path.
    fn release(&mut self);
}

/// Opens a fresh [`CaptureSource`] for each streaming session.
pub trait CaptureBackend: Send {
    fn open(&mut self, format: &CaptureFormat) -> io::Result<Box<dyn CaptureSource>>;
}

/// Reports whether the network association is up. Checked before every read.
pub trait LinkMonitor: Send {
    fn is_up(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUp;

impl LinkMonitor for AlwaysUp {
    fn is_up(&self) -> bool {
        true
    }
}

/// Replays a raw capture file (bytes exactly as the peripheral delivers them).
#[derive(Debug, Clone)]
pub struct RawFileBackend {
    path: PathBuf,
    looped: bool,
}

impl RawFileBackend {
    pub fn new(path: impl Into<PathBuf>, looped: bool) -> Self {
        Self {
            path: path.into(),
            looped,
        }
    }
}

impl CaptureBackend for RawFileBackend {
    fn open(&mut self, format: &CaptureFormat) -> io::Result<Box<dyn CaptureSource>> {
        let data = std::fs::read(&self.path)?;
        debug!(path = %self.path.display(), bytes = data.len(), "raw capture file opened");
        Ok(Box::new(RawFileSource::new(data, format, self.looped)))
    }
}

/// In-memory replay paced by the wall clock.
///
/// Hands out whole chunks only once their duration has elapsed since the
/// source was opened. The end of a non-looping file is reported as
/// `UnexpectedEof`, which ends the stream like a failed device would.
pub struct RawFileSource {
    data: Vec<u8>,
    pos: usize,
    delivered: u64,
    chunk_bytes: usize,
    bytes_per_sec: u64,
    opened_at: Instant,
    looped: bool,
}

impl RawFileSource {
    pub fn new(data: Vec<u8>, format: &CaptureFormat, looped: bool) -> Self {
        let word = (format.container_bits as usize / 8).max(1);
        // keep whole capture words when the dump has a torn tail
        let usable = data.len() - data.len() % word;
        let mut data = data;
        data.truncate(usable);

        Self {
            data,
            pos: 0,
            delivered: 0,
            chunk_bytes: format.raw_chunk_bytes().max(word),
            bytes_per_sec: format.sample_rate as u64 * word as u64,
            opened_at: Instant::now(),
            looped,
        }
    }

    fn allowed_bytes(&self) -> u64 {
        let elapsed = self.opened_at.elapsed();
        (elapsed.as_micros() as u64).saturating_mul(self.bytes_per_sec) / 1_000_000
    }
}

impl CaptureSource for RawFileSource {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            if self.looped && !self.data.is_empty() {
                self.pos = 0;
            } else {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of capture file"));
            }
        }

        if self.delivered + self.chunk_bytes as u64 > self.allowed_bytes() {
            return Ok(0);
        }

        let n = self.chunk_bytes.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        self.delivered += n as u64;
        Ok(n)
    }

    fn release(&mut self) {
        debug!(delivered = self.delivered, "raw capture source released");
        self.data = Vec::new();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_file_source_paces_and_ends() {
        let format = CaptureFormat::default();
        let chunk = format.raw_chunk_bytes();
        let mut data = vec![0u8; chunk * 2];
        data.push(0xFF); // torn trailing word
        let mut source = RawFileSource::new(data, &format, false);
        let mut buf = vec![0u8; chunk];

        // the first chunk is only due after 20 ms
        assert_eq!(source.read_into(&mut buf).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(45));
        assert_eq!(source.read_into(&mut buf).unwrap(), chunk);
        assert_eq!(source.read_into(&mut buf).unwrap(), chunk);

        let err = source.read_into(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_looped_source_wraps() {
        let format = CaptureFormat::default();
        let chunk = format.raw_chunk_bytes();
        let mut source = RawFileSource::new(vec![1u8; chunk], &format, true);
        let mut buf = vec![0u8; chunk];

        std::thread::sleep(Duration::from_millis(65));
        assert_eq!(source.read_into(&mut buf).unwrap(), chunk);
        assert_eq!(source.read_into(&mut buf).unwrap(), chunk);
        assert_eq!(source.read_into(&mut buf).unwrap(), chunk);
    }

    #[test]
    fn test_backend_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 1280]).unwrap();

        let mut backend = RawFileBackend::new(file.path(), false);
        let mut source = backend.open(&CaptureFormat::default()).unwrap();
        source.release();

        let mut missing = RawFileBackend::new("/nonexistent/capture.raw", false);
        assert!(missing.open(&CaptureFormat::default()).is_err());
    }
}
