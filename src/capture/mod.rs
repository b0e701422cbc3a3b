//! # Capture Module
//!
//! The device side: where raw capture words come from, and the supervisor
//! that turns them into a conditioned PCM stream over the wire.

pub mod source;
pub mod supervisor;

pub use source::{AlwaysUp, CaptureBackend, CaptureSource, LinkMonitor, RawFileBackend};
pub use supervisor::{Backoff, CaptureSupervisor, SupervisorConfig, SupervisorState};
