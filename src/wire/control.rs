//! # Control Messages
//!
//! JSON messages carried in WebSocket text frames between the capture device
//! and the ingestion server.
//!
//! ## Client → server:
//! - `{"type":"start","sample_rate":16000,"bits":16,"channels":1,"format":"pcm_s16le", ...}`
//! - `{"type":"stop"}`
//!
//! ## Server → client:
//! - `{"type":"asr_status","status":"processing"}`
//! - `{"type":"asr_result","text":"..."}`
//! - `{"type":"assistant_reply","text":"..."}`
//! - `{"type":"barge_in","reason":"user_speaking"}`
//! - `{"type":"asr_skipped","reason":"noise","meta":{...}}`

use serde::{Deserialize, Serialize};

use crate::audio::gate::GateReport;
use crate::audio::sink::StreamFormat;
use crate::error::ControlError;

pub const PCM_S16LE: &str = "pcm_s16le";

/// Stream format plus the capture side's active DSP parameters.
///
/// The DSP fields are informational for the server; they are optional so a
/// bare `{sample_rate, bits, channels, format}` start is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub sample_rate: u32,
    pub bits: u16,
    pub channels: u16,
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i2s_bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_shift: Option<u32>,
    /// Fixed gain as `[num, den]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<[i32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_gain: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc_block: Option<bool>,
}

fn default_format() -> String {
    PCM_S16LE.to_string()
}

impl StartParams {
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            bits: self.bits,
            channels: self.channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Start(StartParams),
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_ms: Option<u64>,
    },
    AsrStatus {
        status: String,
    },
    AsrResult {
        text: String,
    },
    AssistantReply {
        text: String,
    },
    BargeIn {
        reason: String,
    },
    AsrSkipped {
        reason: String,
        meta: GateReport,
    },
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn processing() -> Self {
        ControlMessage::AsrStatus {
            status: "processing".to_string(),
        }
    }

    pub fn barge_in() -> Self {
        ControlMessage::BargeIn {
            reason: "user_speaking".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Start(_) => "start",
            ControlMessage::Stop { .. } => "stop",
            ControlMessage::AsrStatus { .. } => "asr_status",
            ControlMessage::AsrResult { .. } => "asr_result",
            ControlMessage::AssistantReply { .. } => "assistant_reply",
            ControlMessage::BargeIn { .. } => "barge_in",
            ControlMessage::AsrSkipped { .. } => "asr_skipped",
        }
    }
}
