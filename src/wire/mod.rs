//! # Wire Protocol
//!
//! The minimal WebSocket subset spoken by the capture client, and the JSON
//! control messages both sides exchange over it. The server side uses
//! `actix-web-actors` for its framing; only the control messages are shared.

pub mod client;
pub mod control;
pub mod frame;
pub mod handshake;

pub use client::{Inbound, WsClient};
pub use control::{ControlMessage, StartParams};
