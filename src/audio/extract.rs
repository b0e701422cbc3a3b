//! # Sample Extraction
//!
//! Decodes raw capture words (as delivered by an I2S-style peripheral) into
//! signed integer samples according to a [`CaptureFormat`].
//!
//! ## Supported layouts:
//! - **le32_left24**: 32-bit little-endian words carrying a 24-bit sample in
//!   the upper three bytes (the common MEMS microphone layout)
//! - **be32_left24**: the same, big-endian
//! - **s16le**: native 16-bit little-endian samples, passed through
//!
//! Extraction is a pure function of the input bytes and the format.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

/// Where the significant bits sit inside the capture container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Justification {
    /// 24 significant bits in the top of a 32-bit word, low byte padding
    #[serde(rename = "left24in32")]
    Left24In32,
    None,
}

/// The two documented 32-bit layouts plus 16-bit pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    Le32Left24,
    Be32Left24,
    S16Le,
}

impl ExtractMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractMode::Le32Left24 => "le32_left24",
            ExtractMode::Be32Left24 => "be32_left24",
            ExtractMode::S16Le => "s16le",
        }
    }

    /// Bytes consumed per extracted sample.
    pub fn word_bytes(&self) -> usize {
        match self {
            ExtractMode::Le32Left24 | ExtractMode::Be32Left24 => 4,
            ExtractMode::S16Le => 2,
        }
    }
}

/// Capture-side stream format, fixed for the lifetime of a session.
///
/// ## Invariants:
/// - `output_bits` is always 16 and `channel_count` always 1
/// - `samples_per_chunk() == sample_rate * chunk_ms / 1000`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    /// Sample rate in Hz (16000 for speech)
    pub sample_rate: u32,

    /// Width of one capture word: 16 or 32
    pub container_bits: u8,

    /// Width of the transmitted PCM samples
    pub output_bits: u8,

    pub channel_count: u8,

    pub byte_order: ByteOrder,

    pub justification: Justification,

    /// Duration of one transmitted chunk in milliseconds
    pub chunk_ms: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            container_bits: 32,
            output_bits: 16,
            channel_count: 1,
            byte_order: ByteOrder::Little,
            justification: Justification::Left24In32,
            chunk_ms: 20,
        }
    }
}

impl CaptureFormat {
    /// Resolve the extraction mode, rejecting undocumented layouts.
    pub fn extract_mode(&self) -> Result<ExtractMode, LayoutError> {
        match (self.container_bits, self.byte_order, self.justification) {
            (32, ByteOrder::Little, Justification::Left24In32) => Ok(ExtractMode::Le32Left24),
            (32, ByteOrder::Big, Justification::Left24In32) => Ok(ExtractMode::Be32Left24),
            (16, ByteOrder::Little, Justification::None) => Ok(ExtractMode::S16Le),
            _ => Err(LayoutError::UnsupportedLayout {
                container_bits: self.container_bits,
                byte_order: self.byte_order,
                justification: self.justification,
            }),
        }
    }

    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }

    /// Raw capture bytes needed for one chunk.
    pub fn raw_chunk_bytes(&self) -> usize {
        self.samples_per_chunk() * (self.container_bits as usize / 8)
    }

    /// Transmitted PCM bytes for one chunk.
    pub fn pcm_chunk_bytes(&self) -> usize {
        self.samples_per_chunk() * (self.output_bits as usize / 8)
    }
}

/// Decode `raw` into `out`, returning how many samples were written.
///
/// Trailing bytes that do not form a whole capture word are ignored.
/// 32-bit words are sign-extended from bit 31 and shifted right by 8, which
/// recovers the signed 24-bit value of a left-justified sample.
pub fn extract_samples(
    raw: &[u8],
    format: &CaptureFormat,
    out: &mut [i32],
) -> Result<usize, LayoutError> {
    let mode = format.extract_mode()?;
    let count = raw.len() / mode.word_bytes();
    if count > out.len() {
        return Err(LayoutError::OutputTooSmall {
            capacity: out.len(),
            needed: count,
        });
    }

    match mode {
        ExtractMode::Le32Left24 => {
            for (slot, word) in out.iter_mut().zip(raw.chunks_exact(4)) {
                *slot = LittleEndian::read_i32(word) >> 8;
            }
        }
        ExtractMode::Be32Left24 => {
            for (slot, word) in out.iter_mut().zip(raw.chunks_exact(4)) {
                *slot = BigEndian::read_i32(word) >> 8;
            }
        }
        ExtractMode::S16Le => {
            for (slot, word) in out.iter_mut().zip(raw.chunks_exact(2)) {
                *slot = LittleEndian::read_i16(word) as i32;
            }
        }
    }

    Ok(count)
}
