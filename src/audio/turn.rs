//! # Turn Detection
//!
//! Hysteresis state machine that splits a stream of 16-bit PCM chunks into
//! conversational turns based on per-chunk RMS loudness.
//!
//! ## States:
//! - **Idle**: counts consecutive voiced chunks, any unvoiced chunk resets the
//!   count. Reaching `speech_frames` emits [`TurnEvent::Start`].
//! - **Speaking**: counts consecutive unvoiced chunks, any voiced chunk resets
//!   the count. Reaching `silence_frames` emits [`TurnEvent::End`].
//!
//! The onset and release counts differ so short clicks do not open a turn and
//! short pauses do not close one.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDetectorConfig {
    /// Minimum RMS (16-bit units) for a chunk to count as voiced
    pub threshold: u32,

    /// Consecutive voiced chunks needed to open a turn
    pub speech_frames: u32,

    /// Consecutive unvoiced chunks needed to close a turn
    pub silence_frames: u32,
}

impl Default for TurnDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 900,
            speech_frames: 6,
            silence_frames: 18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    Start,
    End,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAnalysis {
    pub rms: u32,
    pub voiced: bool,
    pub event: Option<TurnEvent>,
}

#[derive(Debug, Clone)]
pub struct TurnDetector {
    config: TurnDetectorConfig,
    phase: TurnPhase,
    consecutive_voiced: u32,
    consecutive_silent: u32,
}

impl TurnDetector {
    pub fn new(config: TurnDetectorConfig) -> Self {
        Self {
            config,
            phase: TurnPhase::Idle,
            consecutive_voiced: 0,
            consecutive_silent: 0,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn config(&self) -> &TurnDetectorConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.phase = TurnPhase::Idle;
        self.consecutive_voiced = 0;
        self.consecutive_silent = 0;
    }

    pub fn feed(&mut self, samples: &[i16]) -> FrameAnalysis {
        self.feed_rms(frame_rms(samples))
    }

    /// Feed a chunk given as little-endian PCM bytes (as received on the wire).
    pub fn feed_le_bytes(&mut self, pcm: &[u8]) -> FrameAnalysis {
        self.feed_rms(frame_rms_le_bytes(pcm))
    }

    /// Advance the state machine with a precomputed chunk loudness.
    pub fn feed_rms(&mut self, rms: u32) -> FrameAnalysis {
        let voiced = rms >= self.config.threshold;
        let mut event = None;

        match self.phase {
            TurnPhase::Idle => {
                if voiced {
                    self.consecutive_voiced += 1;
                    if self.consecutive_voiced >= self.config.speech_frames {
                        self.phase = TurnPhase::Speaking;
                        self.consecutive_silent = 0;
                        event = Some(TurnEvent::Start);
                    }
                } else {
                    self.consecutive_voiced = 0;
                }
            }
            TurnPhase::Speaking => {
                if voiced {
                    self.consecutive_silent = 0;
                } else {
                    self.consecutive_silent += 1;
                    if self.consecutive_silent >= self.config.silence_frames {
                        self.phase = TurnPhase::Idle;
                        self.consecutive_voiced = 0;
                        event = Some(TurnEvent::End);
                    }
                }
            }
        }

        FrameAnalysis { rms, voiced, event }
    }
}

/// Integer RMS of a chunk: `floor(sqrt(floor(sum(x^2) / n)))`, 0 for empty input.
pub fn frame_rms(samples: &[i16]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let acc: u64 = samples.iter().map(|s| (*s as i64 * *s as i64) as u64).sum();
    isqrt(acc / samples.len() as u64)
}

pub fn frame_rms_le_bytes(pcm: &[u8]) -> u32 {
    let n = pcm.len() / 2;
    if n == 0 {
        return 0;
    }
    let acc: u64 = pcm
        .chunks_exact(2)
        .map(|b| {
            let v = LittleEndian::read_i16(b) as i64;
            (v * v) as u64
        })
        .sum();
    isqrt(acc / n as u64)
}

fn isqrt(value: u64) -> u32 {
    // mean of squared i16 values fits in 31 bits, so the float estimate is
    // within one of the exact root
    let mut root = (value as f64).sqrt() as u64;
    while root * root > value {
        root -= 1;
    }
    while (root + 1) * (root + 1) <= value {
        root += 1;
    }
    root as u32
}
