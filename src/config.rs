//! # Configuration Management
//!
//! Loads the settings shared by both binaries from several layered sources:
//! - Default values (built into the code)
//! - `config.toml` / `turnstream.toml` in the working directory (optional)
//! - Environment variables with the `APP_` prefix, `__` between levels
//! - The platform variables `HOST` and `PORT`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_CAPTURE__SERVER_URL`, ...)
//! 3. Configuration files
//! 4. Default values
//!
//! ## Sections:
//! - **server**: bind address, audio endpoint, output directory, mode
//! - **turn** / **gate**: turn detector and quality gate tuning
//! - **transcription**: external speech-to-text command
//! - **performance**: session and transcription limits, heartbeat
//! - **capture**: the capture binary's layout, DSP and reconnect settings

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::agc::AgcParams;
use crate::audio::extract::{ByteOrder, CaptureFormat, Justification};
use crate::audio::gate::QualityGateConfig;
use crate::audio::processor::{ConditionParams, GainMode, DEFAULT_DC_BLOCK_A_Q15};
use crate::audio::session::{SessionConfig, SessionMode, DEFAULT_PLACEHOLDER};
use crate::audio::turn::TurnDetectorConfig;
use crate::capture::supervisor::SupervisorConfig;
use crate::transcription::engine::TranscriptionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub turn: TurnDetectorConfig,
    pub gate: QualityGateConfig,
    pub transcription: TranscriptionSettings,
    pub performance: PerformanceConfig,
    pub capture: CaptureSettings,
}

/// Ingestion server settings.
///
/// ## Common values:
/// - `host = "0.0.0.0"`: accept devices on the local network
/// - `mode = "record"`: only persist raw audio, no turn handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// The only path accepted for audio connections
    pub audio_path: String,
    pub output_dir: String,
    pub mode: SessionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    /// Program that prints the transcript of the WAV path given as last argument
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Transcript shown to the client when nothing was recognised
    pub placeholder: String,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - More concurrent transcriptions lower reply latency under load, at the
///   cost of CPU for whatever the external command runs
/// - `client_timeout_secs` must exceed `heartbeat_interval_secs`, otherwise
///   idle but healthy devices get dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub max_concurrent_transcriptions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Capture binary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub server_url: String,
    pub connect_timeout_secs: u64,

    /// Raw capture dump replayed in place of a microphone
    pub source_path: String,
    pub loop_source: bool,

    pub sample_rate: u32,
    pub container_bits: u8,
    pub byte_order: ByteOrder,
    pub justification: Justification,
    pub chunk_ms: u32,

    pub dc_block: bool,
    pub dc_block_a_q15: i32,
    pub down_shift: u32,

    pub auto_gain: bool,
    pub gain_num: i32,
    pub gain_den: i32,
    pub target_peak: u32,
    pub gain_min_q8: u16,
    pub gain_max_q8: u16,
    pub attack_step_q8: u16,
    pub release_step_q8: u16,

    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub meter_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let format = CaptureFormat::default();
        let agc = AgcParams::default();

        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                audio_path: "/ws/audio".to_string(),
                output_dir: "./recordings".to_string(),
                mode: SessionMode::Assistant,
            },
            turn: TurnDetectorConfig::default(),
            gate: QualityGateConfig::default(),
            transcription: TranscriptionSettings {
                command: None,
                args: Vec::new(),
                placeholder: DEFAULT_PLACEHOLDER.to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                max_concurrent_transcriptions: 2,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            capture: CaptureSettings {
                server_url: "ws://127.0.0.1:8000/ws/audio?device=turnstream-capture".to_string(),
                connect_timeout_secs: 8,
                source_path: "capture.raw".to_string(),
                loop_source: true,
                sample_rate: format.sample_rate,
                container_bits: format.container_bits,
                byte_order: format.byte_order,
                justification: format.justification,
                chunk_ms: format.chunk_ms,
                dc_block: true,
                dc_block_a_q15: DEFAULT_DC_BLOCK_A_Q15,
                down_shift: 8,
                auto_gain: true,
                gain_num: 1,
                gain_den: 1,
                target_peak: agc.target_peak,
                gain_min_q8: agc.gain_min_q8,
                gain_max_q8: agc.gain_max_q8,
                attack_step_q8: agc.attack_step_q8,
                release_step_q8: agc.release_step_q8,
                reconnect_min_secs: 2,
                reconnect_max_secs: 20,
                meter_interval_ms: 2000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every layer in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__MODE=record`
    /// - `APP_TURN__THRESHOLD=1200`
    /// - `APP_CAPTURE__SERVER_URL=ws://192.168.1.46:8000/ws/audio?device=kitchen`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name("turnstream").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the server or the capture loop misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.audio_path.starts_with('/') {
            return Err(anyhow::anyhow!("Audio path must start with '/'"));
        }

        if self.turn.speech_frames == 0 || self.turn.silence_frames == 0 {
            return Err(anyhow::anyhow!("Turn speech and silence frame counts must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.gate.min_voiced_ratio) {
            return Err(anyhow::anyhow!("Gate min_voiced_ratio must be within [0, 1]"));
        }

        if self.gate.chunk_ms == 0 {
            return Err(anyhow::anyhow!("Gate chunk_ms must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_concurrent_transcriptions == 0 {
            return Err(anyhow::anyhow!("Max concurrent transcriptions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        self.validate_capture()
    }

    fn validate_capture(&self) -> Result<()> {
        let c = &self.capture;

        self.capture_format().extract_mode()?;

        if c.sample_rate == 0 || c.chunk_ms == 0 {
            return Err(anyhow::anyhow!("Capture sample rate and chunk duration must be greater than 0"));
        }

        if c.down_shift >= 32 {
            return Err(anyhow::anyhow!("Capture down_shift must be below 32"));
        }

        if !(1..32768).contains(&c.dc_block_a_q15) {
            return Err(anyhow::anyhow!("DC-block coefficient must be within (0, 32768)"));
        }

        if c.gain_den == 0 {
            return Err(anyhow::anyhow!("Fixed gain denominator cannot be 0"));
        }

        if c.gain_min_q8 == 0 || c.gain_min_q8 > c.gain_max_q8 {
            return Err(anyhow::anyhow!("AGC bounds must satisfy 0 < gain_min_q8 <= gain_max_q8"));
        }

        if c.reconnect_min_secs == 0 || c.reconnect_min_secs > c.reconnect_max_secs {
            return Err(anyhow::anyhow!(
                "Reconnect backoff must satisfy 0 < reconnect_min_secs <= reconnect_max_secs"
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.server.host.clone(), self.server.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.server.mode,
            output_dir: PathBuf::from(&self.server.output_dir),
            turn: self.turn.clone(),
            gate: self.gate.clone(),
            placeholder: self.transcription.placeholder.clone(),
        }
    }

    pub fn transcription_config(&self) -> TranscriptionConfig {
        TranscriptionConfig {
            command: self.transcription.command.clone(),
            args: self.transcription.args.clone(),
        }
    }

    pub fn capture_format(&self) -> CaptureFormat {
        let c = &self.capture;
        CaptureFormat {
            sample_rate: c.sample_rate,
            container_bits: c.container_bits,
            output_bits: 16,
            channel_count: 1,
            byte_order: c.byte_order,
            justification: c.justification,
            chunk_ms: c.chunk_ms,
        }
    }

    pub fn condition_params(&self) -> ConditionParams {
        let c = &self.capture;
        let gain = if c.auto_gain {
            GainMode::Auto(AgcParams {
                target_peak: c.target_peak,
                gain_min_q8: c.gain_min_q8,
                gain_max_q8: c.gain_max_q8,
                attack_step_q8: c.attack_step_q8,
                release_step_q8: c.release_step_q8,
            })
        } else {
            GainMode::Fixed {
                num: c.gain_num,
                den: c.gain_den,
            }
        };

        ConditionParams {
            dc_block: c.dc_block,
            dc_block_a_q15: c.dc_block_a_q15,
            down_shift: c.down_shift,
            gain,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let c = &self.capture;
        SupervisorConfig {
            server_url: c.server_url.clone(),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            format: self.capture_format(),
            condition: self.condition_params(),
            reconnect_min: Duration::from_secs(c.reconnect_min_secs),
            reconnect_max: Duration::from_secs(c.reconnect_max_secs),
            meter_interval: Duration::from_millis(c.meter_interval_ms),
            ..SupervisorConfig::default()
        }
    }
}
