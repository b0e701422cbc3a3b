//! # Capture Session Supervisor
//!
//! Drives the capture device: connect, announce the stream, condition and
//! send chunks until something fails, tear down, wait, and try again.
//!
//! ## State machine:
//! `Connecting → Streaming → Closing → Backoff → Connecting → ...`
//!
//! ## Failure policy:
//! - Transport, link and device failures end the current stream only. The
//!   teardown (best-effort `stop`, transport close, device release) runs on
//!   every exit path, then the supervisor backs off and reconnects. It never
//!   gives up.
//! - An unsupported capture layout is rejected when the supervisor is built
//!   and is never retried.
//! - The backoff starts at `reconnect_min`, doubles per attempt up to
//!   `reconnect_max`, and is not reset after a successful stream.
//!
//! ## Scheduling:
//! One cooperative loop. Each chunk is read, conditioned, sent and metered
//! before the next one, with an explicit yield in between so inbound frames
//! (pings, barge-in) are serviced.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::extract::{extract_samples, CaptureFormat, ExtractMode};
use crate::audio::processor::{encode_pcm16le, ChunkReport, ConditionParams, ConditioningChain, GainMode};
use crate::capture::source::{CaptureBackend, CaptureSource, LinkMonitor};
use crate::error::{CaptureError, LayoutError, TransportError};
use crate::wire::control::{ControlMessage, StartParams, PCM_S16LE};
use crate::wire::{Inbound, WsClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Connecting,
    Streaming,
    Closing,
    Backoff,
}

/// Reconnect delay: doubles on every attempt, capped, never reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            max: max.max(min),
            current: min,
        }
    }

    /// The delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub format: CaptureFormat,
    pub condition: ConditionParams,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub meter_interval: Duration,
    /// Sleep when the capture source has nothing ready
    pub idle_sleep: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws/audio?device=turnstream-capture".to_string(),
            connect_timeout: Duration::from_secs(8),
            format: CaptureFormat::default(),
            condition: ConditionParams::default(),
            reconnect_min: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(20),
            meter_interval: Duration::from_secs(2),
            idle_sleep: Duration::from_millis(5),
        }
    }
}

/// Why a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Shutdown,
}

/// Accumulates chunk reports between meter log lines.
#[derive(Debug)]
struct Meter {
    peak: u32,
    clips: u64,
    samples: u64,
    since: Instant,
}

impl Meter {
    fn new() -> Self {
        Self {
            peak: 0,
            clips: 0,
            samples: 0,
            since: Instant::now(),
        }
    }

    fn add(&mut self, report: &ChunkReport) {
        self.peak = self.peak.max(report.peak);
        self.clips += report.clip_count as u64;
        self.samples += report.samples as u64;
    }

    fn clip_permille(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.clips * 1000 / self.samples
        }
    }
}

pub struct CaptureSupervisor<B, L> {
    config: SupervisorConfig,
    mode: ExtractMode,
    backend: B,
    link: L,
    backoff: Backoff,
    state: SupervisorState,
    attempts: u64,
    started_at: Instant,
}

impl<B, L> CaptureSupervisor<B, L>
where
    B: CaptureBackend,
    L: LinkMonitor,
{
    pub fn new(config: SupervisorConfig, backend: B, link: L) -> Result<Self, LayoutError> {
        let mode = config.format.extract_mode()?;
        Ok(Self {
            backoff: Backoff::new(config.reconnect_min, config.reconnect_max),
            config,
            mode,
            backend,
            link,
            state: SupervisorState::Connecting,
            attempts: 0,
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Stream, reconnecting forever, until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.stream_once(&mut shutdown).await {
                Ok(StreamEnd::Shutdown) => break,
                Err(e) => warn!(error = %e, attempt = self.attempts, "stream ended"),
            }

            self.state = SupervisorState::Backoff;
            let delay = self.backoff.next_delay();
            info!(delay_secs = delay.as_secs_f32(), "reconnect in");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(attempts = self.attempts, "capture supervisor stopped");
    }

    /// One capture-transmit cycle: connect, stream until failure or shutdown,
    /// then tear down.
    pub async fn stream_once(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd, CaptureError> {
        self.state = SupervisorState::Connecting;
        self.attempts += 1;

        if !self.link.is_up() {
            return Err(TransportError::LinkDown("network association lost".into()).into());
        }

        info!(url = %self.config.server_url, "connecting");
        let mut client = WsClient::connect(&self.config.server_url, self.config.connect_timeout).await?;
        info!("connected");
        self.state = SupervisorState::Streaming;

        let mut source: Option<Box<dyn CaptureSource>> = None;
        let result = self.stream(&mut client, &mut source, shutdown).await;

        self.state = SupervisorState::Closing;
        let stop = ControlMessage::Stop {
            ts_ms: Some(self.ticks_ms()),
        };
        if let Ok(json) = stop.to_json() {
            let _ = client.send_text(&json).await;
        }
        client.close().await;
        if let Some(mut source) = source {
            source.release();
        }

        result
    }

    async fn stream<S>(
        &mut self,
        client: &mut WsClient<S>,
        source_slot: &mut Option<Box<dyn CaptureSource>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd, CaptureError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let format = self.config.format.clone();
        client.send_text(&self.start_message().to_json()?).await?;

        let source = source_slot.insert(self.backend.open(&format).map_err(CaptureError::Device)?);
        let mut chain = ConditioningChain::new(self.config.condition.clone());

        let samples_per_chunk = format.samples_per_chunk();
        let mut raw = vec![0u8; format.raw_chunk_bytes()];
        let mut samples = vec![0i32; samples_per_chunk];
        let mut pcm = vec![0i16; samples_per_chunk];
        let mut bytes = vec![0u8; format.pcm_chunk_bytes()];
        let mut meter = Meter::new();

        loop {
            if *shutdown.borrow() {
                return Ok(StreamEnd::Shutdown);
            }
            if !self.link.is_up() {
                return Err(TransportError::LinkDown("network association lost".into()).into());
            }

            let n = source.read_into(&mut raw).map_err(CaptureError::Device)?;
            if n == 0 {
                self.service_inbound(client).await?;
                tokio::time::sleep(self.config.idle_sleep).await;
                continue;
            }

            let count = extract_samples(&raw[..n], &format, &mut samples)?;
            let report = chain.process(&samples[..count], &mut pcm[..count]);
            let len = encode_pcm16le(&pcm[..count], &mut bytes);
            if len > 0 {
                client.send_binary(&bytes[..len]).await?;
            }

            meter.add(&report);
            if meter.since.elapsed() >= self.config.meter_interval {
                info!(
                    peak16 = meter.peak,
                    clip_permille = meter.clip_permille(),
                    mode = self.mode.as_str(),
                    shift = self.config.condition.down_shift,
                    agc = matches!(self.config.condition.gain, GainMode::Auto(_)),
                    agc_q8 = chain.state().gain_q8,
                    "audio meter"
                );
                meter = Meter::new();
            }

            self.service_inbound(client).await?;
            tokio::task::yield_now().await;
        }
    }

    async fn service_inbound<S>(&self, client: &mut WsClient<S>) -> Result<(), CaptureError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        while let Some(inbound) = client.poll_inbound().await? {
            match inbound {
                Inbound::Text(text) => match ControlMessage::parse(&text) {
                    Ok(ControlMessage::BargeIn { reason }) => info!(%reason, "barge-in"),
                    Ok(ControlMessage::AsrResult { text }) => info!(%text, "asr result"),
                    Ok(ControlMessage::AssistantReply { text }) => info!(%text, "assistant reply"),
                    Ok(other) => debug!(kind = other.kind(), "control message"),
                    Err(e) => warn!(error = %e, "ignoring malformed server message"),
                },
                Inbound::Binary(data) => debug!(len = data.len(), "ignoring binary frame from server"),
                Inbound::Close(code) => {
                    return Err(TransportError::LinkDown(format!("server closed the stream (code {code:?})")).into());
                }
            }
        }
        Ok(())
    }

    fn start_message(&self) -> ControlMessage {
        let format = &self.config.format;
        let condition = &self.config.condition;
        let (gain, auto_gain) = match &condition.gain {
            GainMode::Fixed { num, den } => (Some([*num, *den]), false),
            GainMode::Auto(_) => (None, true),
        };

        ControlMessage::Start(StartParams {
            sample_rate: format.sample_rate,
            bits: format.output_bits as u16,
            channels: format.channel_count as u16,
            format: PCM_S16LE.to_string(),
            ts_ms: Some(self.ticks_ms()),
            i2s_bits: Some(format.container_bits),
            extract_mode: Some(self.mode.as_str().to_string()),
            down_shift: Some(condition.down_shift),
            gain,
            auto_gain: Some(auto_gain),
            dc_block: Some(condition.dc_block),
        })
    }

    fn ticks_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
