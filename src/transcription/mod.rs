//! # Transcription Module
//!
//! Collaborators the ingestion session hands finished turns to.
//!
//! ## Key Components:
//! - **engine**: the `Transcriber` capability and its backends
//! - **worker**: bounded pool running transcriptions off the connection task
//! - **responder**: the `ResponderPolicy` that turns a transcript into a reply

pub mod engine;
pub mod responder;
pub mod worker;

pub use engine::{build_transcriber, Transcriber, TranscriptionConfig};
pub use responder::{ResponderPolicy, RuleResponder};
pub use worker::{TranscriptOutcome, TranscriptionPool};
