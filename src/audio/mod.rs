//! # Audio Module
//!
//! Everything that touches samples, on both sides of the link.
//!
//! ## Capture side:
//! - **extract**: raw capture words → signed samples
//! - **processor**: DC-block, downshift, gain, clip and meter
//! - **agc**: automatic gain feedback loop
//!
//! ## Server side:
//! - **turn**: hysteresis turn detector over chunk RMS
//! - **gate**: post-hoc turn quality gate
//! - **sink**: streaming WAV files
//! - **session**: per-connection ingestion state machine
//!
//! ## Audio Format on the Wire:
//! - **Sample Rate**: 16kHz by default, negotiated by `start`
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: mono
//! - **Chunk**: 20 ms (320 samples, 640 bytes)

pub mod agc;
pub mod extract;
pub mod gate;
pub mod processor;
pub mod session;
pub mod sink;
pub mod turn;
