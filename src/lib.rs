//! # turnstream
//!
//! Live audio from constrained capture devices, segmented into
//! conversational turns on a server.
//!
//! ## Application Architecture:
//! - **audio**: extraction, fixed-point conditioning, turn detection, quality
//!   gate, WAV sinks and the per-connection ingestion session
//! - **wire**: the minimal WebSocket client transport and control messages
//! - **capture**: capture sources and the reconnecting capture supervisor
//! - **transcription**: pluggable speech-to-text and reply policy
//! - **config** / **error** / **telemetry**: ambient plumbing for both binaries
//! - **state** / **health** / **server** / **websocket**: the ingestion server

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod health;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod transcription;
pub mod websocket;
pub mod wire;
