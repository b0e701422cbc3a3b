//! # Ingestion Session
//!
//! Per-connection state of the audio server, kept free of socket I/O: every
//! input (text frame, binary frame, finished transcription) returns the
//! ordered list of [`SessionAction`]s the connection must perform.
//!
//! ## Modes:
//! - **Assistant**: a raw file for the whole connection, turn segmentation,
//!   quality gating, transcription and replies with barge-in
//! - **Record**: raw capture only, the file is opened by `start` or implicitly
//!   by the first audio frame
//!
//! ## Turn Lifecycle (assistant mode):
//! 1. **Start**: barge-in if a reply is playing, then open the turn file
//! 2. **Speaking**: every chunk is appended to the turn file and its stats
//! 3. **End**: close the turn file and gate it
//! 4. **Skipped** → `asr_skipped`; **Accepted** → `asr_status` + transcription
//! 5. **Transcribed** → `asr_result` + `assistant_reply`, playback marked active

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::gate::{QualityGate, QualityGateConfig, TurnStats};
use crate::audio::sink::{build_output_path, StreamFormat, WavSink};
use crate::audio::turn::{TurnDetector, TurnDetectorConfig, TurnEvent};
use crate::error::SinkError;
use crate::transcription::responder::ResponderPolicy;
use crate::wire::control::{ControlMessage, StartParams};

pub const DEFAULT_DEVICE: &str = "unknown-device";

pub const DEFAULT_PLACEHOLDER: &str = "(transcription unavailable)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Record,
    Assistant,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Record => "record",
            SessionMode::Assistant => "assistant",
        }
    }
}

/// Settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub output_dir: PathBuf,
    pub turn: TurnDetectorConfig,
    pub gate: QualityGateConfig,
    /// Shown as the transcript when transcription returned nothing
    pub placeholder: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Assistant,
            output_dir: PathBuf::from("./recordings"),
            turn: TurnDetectorConfig::default(),
            gate: QualityGateConfig::default(),
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Send a control message to the client
    Send(ControlMessage),
    /// Transcribe a finished, closed turn file off the connection task
    Transcribe { turn_id: u64, path: PathBuf },
    /// End the connection
    Close,
}

/// Totals reported when the session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub device: String,
    pub bytes_ingested: u64,
    pub turns_detected: u32,
    pub turns_accepted: u32,
    pub turns_skipped: u32,
    pub barge_ins: u32,
    pub raw_files: Vec<PathBuf>,
}

struct ActiveTurn {
    id: u64,
    stats: TurnStats,
    sink: Option<WavSink>,
}

pub struct IngestionSession {
    device: String,
    config: SessionConfig,
    format: StreamFormat,
    raw_sink: Option<WavSink>,
    turn: Option<ActiveTurn>,
    detector: TurnDetector,
    gate: QualityGate,
    responder: Arc<dyn ResponderPolicy>,
    playback_active: bool,
    pending: HashSet<u64>,
    next_turn_id: u64,
    closed: bool,
    summary: SessionSummary,
}

impl IngestionSession {
    /// Create the session for a newly accepted connection.
    ///
    /// In assistant mode the raw file is opened immediately with the default
    /// format; a later `start` replaces it.
    pub fn open(
        device: &str,
        config: SessionConfig,
        responder: Arc<dyn ResponderPolicy>,
    ) -> Result<Self, SinkError> {
        let mut session = Self {
            device: device.to_string(),
            detector: TurnDetector::new(config.turn.clone()),
            gate: QualityGate::new(config.gate.clone()),
            config,
            format: StreamFormat::default(),
            raw_sink: None,
            turn: None,
            responder,
            playback_active: false,
            pending: HashSet::new(),
            next_turn_id: 1,
            closed: false,
            summary: SessionSummary {
                device: device.to_string(),
                ..SessionSummary::default()
            },
        };

        if session.config.mode == SessionMode::Assistant {
            session.open_raw_sink()?;
        }

        Ok(session)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn playback_active(&self) -> bool {
        self.playback_active
    }

    pub fn in_turn(&self) -> bool {
        self.turn.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn raw_path(&self) -> Option<&Path> {
        self.raw_sink.as_ref().map(|s| s.path())
    }

    /// Handle a text frame. Malformed messages are logged and ignored.
    pub fn handle_text(&mut self, text: &str) -> Vec<SessionAction> {
        if self.closed {
            return Vec::new();
        }

        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(device = %self.device, error = %e, "ignoring malformed control message");
                return Vec::new();
            }
        };

        match message {
            ControlMessage::Start(params) => {
                self.restart(&params);
                Vec::new()
            }
            ControlMessage::Stop { .. } => {
                info!(device = %self.device, bytes = self.summary.bytes_ingested, "stop requested");
                self.finish();
                vec![SessionAction::Close]
            }
            other => {
                debug!(device = %self.device, kind = other.kind(), "ignoring server-side message from client");
                Vec::new()
            }
        }
    }

    /// Handle one binary frame of little-endian PCM.
    pub fn handle_audio(&mut self, pcm: &[u8]) -> Vec<SessionAction> {
        if self.closed {
            return Vec::new();
        }
        self.summary.bytes_ingested += pcm.len() as u64;

        match self.config.mode {
            SessionMode::Record => {
                if self.raw_sink.is_none() {
                    info!(device = %self.device, "audio before start, opening file with default format");
                    if let Err(e) = self.open_raw_sink() {
                        warn!(device = %self.device, error = %e, "cannot open raw file");
                    }
                }
                self.write_raw(pcm);
                Vec::new()
            }
            SessionMode::Assistant => {
                self.write_raw(pcm);
                self.segment(pcm)
            }
        }
    }

    /// Deliver a finished transcription. Results for unknown turns, or arriving
    /// after the session ended, are dropped.
    pub fn complete_transcription(&mut self, turn_id: u64, text: &str) -> Vec<SessionAction> {
        if self.closed || !self.pending.remove(&turn_id) {
            debug!(device = %self.device, turn_id, "dropping transcription for inactive turn");
            return Vec::new();
        }
        self.reply_actions(text)
    }

    /// Flush and close every open file. Safe to call more than once.
    pub fn finish(&mut self) -> SessionSummary {
        if !self.closed {
            self.closed = true;
            if let Some(turn) = self.turn.take() {
                close_sink(&self.device, turn.sink);
            }
            if let Some(path) = close_sink(&self.device, self.raw_sink.take()) {
                self.summary.raw_files.push(path);
            }
            self.pending.clear();
            info!(
                device = %self.device,
                bytes = self.summary.bytes_ingested,
                turns = self.summary.turns_detected,
                "session finished"
            );
        }
        self.summary.clone()
    }

    fn segment(&mut self, pcm: &[u8]) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let analysis = self.detector.feed_le_bytes(pcm);

        if analysis.event == Some(TurnEvent::Start) {
            if self.playback_active {
                self.playback_active = false;
                self.summary.barge_ins += 1;
                actions.push(SessionAction::Send(ControlMessage::barge_in()));
            }
            self.begin_turn(analysis.rms);
        }

        if let Some(turn) = self.turn.as_mut() {
            turn.stats.add(analysis.rms, analysis.voiced);
            if let Some(sink) = turn.sink.as_mut() {
                if let Err(e) = sink.write_pcm_le(pcm) {
                    warn!(device = %self.device, error = %e, "turn file write failed");
                    turn.sink = None;
                }
            }
        }

        if analysis.event == Some(TurnEvent::End) {
            if let Some(turn) = self.turn.take() {
                actions.extend(self.end_turn(turn));
            }
        }

        actions
    }

    fn begin_turn(&mut self, rms: u32) {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        self.summary.turns_detected += 1;

        let sink = build_output_path(&self.config.output_dir, &self.device, "turn_")
            .and_then(|path| WavSink::create(&path, self.format));
        let sink = match sink {
            Ok(sink) => {
                info!(device = %self.device, turn_id = id, rms, path = %sink.path().display(), "turn start");
                Some(sink)
            }
            Err(e) => {
                warn!(device = %self.device, turn_id = id, error = %e, "turn start without file");
                None
            }
        };

        self.turn = Some(ActiveTurn {
            id,
            stats: TurnStats::default(),
            sink,
        });
    }

    fn end_turn(&mut self, turn: ActiveTurn) -> Vec<SessionAction> {
        let path = close_sink(&self.device, turn.sink);
        let report = self.gate.evaluate(&turn.stats);

        if report.rejected() {
            self.summary.turns_skipped += 1;
            info!(device = %self.device, turn_id = turn.id, ?report, "turn drop");
            return vec![SessionAction::Send(ControlMessage::AsrSkipped {
                reason: "noise".to_string(),
                meta: report,
            })];
        }

        self.summary.turns_accepted += 1;
        info!(device = %self.device, turn_id = turn.id, turn_ms = report.turn_ms, "turn accepted");

        let mut actions = vec![SessionAction::Send(ControlMessage::processing())];
        match path {
            Some(path) => {
                self.pending.insert(turn.id);
                actions.push(SessionAction::Transcribe {
                    turn_id: turn.id,
                    path,
                });
            }
            // nothing to transcribe, answer right away
            None => actions.extend(self.reply_actions("")),
        }
        actions
    }

    fn reply_actions(&mut self, transcript: &str) -> Vec<SessionAction> {
        let transcript = transcript.trim();
        let reply = self.responder.reply(transcript);
        let shown = if transcript.is_empty() {
            self.config.placeholder.clone()
        } else {
            transcript.to_string()
        };

        info!(device = %self.device, text = %shown, "asr");
        info!(device = %self.device, text = %reply, "assistant");
        self.playback_active = true;

        vec![
            SessionAction::Send(ControlMessage::AsrResult { text: shown }),
            SessionAction::Send(ControlMessage::AssistantReply { text: reply }),
        ]
    }

    fn restart(&mut self, params: &StartParams) {
        let requested = params.stream_format();
        if requested.bits != 16 || requested.channels != 1 || requested.sample_rate == 0 {
            warn!(
                device = %self.device,
                bits = requested.bits,
                channels = requested.channels,
                sample_rate = requested.sample_rate,
                "unsupported start format, keeping current format"
            );
        } else {
            self.format = requested;
        }

        if let Some(turn) = self.turn.take() {
            close_sink(&self.device, turn.sink);
        }
        self.detector.reset();

        if let Some(path) = close_sink(&self.device, self.raw_sink.take()) {
            self.summary.raw_files.push(path);
        }
        match self.open_raw_sink() {
            Ok(()) => info!(
                device = %self.device,
                mode = self.config.mode.as_str(),
                sample_rate = self.format.sample_rate,
                extract_mode = params.extract_mode.as_deref().unwrap_or("-"),
                "start"
            ),
            Err(e) => warn!(device = %self.device, error = %e, "cannot open raw file"),
        }
    }

    fn open_raw_sink(&mut self) -> Result<(), SinkError> {
        let prefix = match self.config.mode {
            SessionMode::Assistant => "raw_",
            SessionMode::Record => "",
        };
        let path = build_output_path(&self.config.output_dir, &self.device, prefix)?;
        let sink = WavSink::create(&path, self.format)?;
        debug!(device = %self.device, path = %path.display(), "raw file opened");
        self.raw_sink = Some(sink);
        Ok(())
    }

    fn write_raw(&mut self, pcm: &[u8]) {
        if let Some(sink) = self.raw_sink.as_mut() {
            if let Err(e) = sink.write_pcm_le(pcm) {
                warn!(device = %self.device, error = %e, "raw file write failed, closing it");
                self.raw_sink = None;
            }
        }
    }
}

impl Drop for IngestionSession {
    fn drop(&mut self) {
        self.finish();
    }
}

fn close_sink(device: &str, sink: Option<WavSink>) -> Option<PathBuf> {
    let sink = sink?;
    match sink.finalize() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(device = %device, error = %e, "failed to finalize audio file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::responder::RuleResponder;

    fn chunk(value: i16) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(640);
        for _ in 0..320 {
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        pcm
    }

    fn config(dir: &Path, mode: SessionMode) -> SessionConfig {
        SessionConfig {
            mode,
            output_dir: dir.to_path_buf(),
            ..SessionConfig::default()
        }
    }

    fn session(config: SessionConfig) -> IngestionSession {
        IngestionSession::open("esp32-test", config, Arc::new(RuleResponder)).unwrap()
    }

    const START: &str = r#"{"type":"start","sample_rate":16000,"bits":16,"channels":1,"format":"pcm_s16le"}"#;

    /// 6 voiced chunks at RMS 1500 then 18 silent ones.
    fn speak(session: &mut IngestionSession) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.extend(session.handle_audio(&chunk(1500)));
        }
        for _ in 0..18 {
            actions.extend(session.handle_audio(&chunk(0)));
        }
        actions
    }

    fn sent(actions: &[SessionAction]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send(m) => Some(m.kind()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_default_gate_skips_short_burst() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path(), SessionMode::Assistant));
        assert!(s.handle_text(START).is_empty());

        let actions = speak(&mut s);
        assert_eq!(sent(&actions), vec!["asr_skipped"]);
        match &actions[0] {
            SessionAction::Send(ControlMessage::AsrSkipped { reason, meta }) => {
                assert_eq!(reason, "noise");
                // stats run from the start chunk: 1 voiced + 18 silent
                assert_eq!(meta.turn_ms, 380);
                assert!(meta.too_unvoiced);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!s.playback_active());
    }

    #[test]
    fn test_accepted_turn_yields_one_result_and_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), SessionMode::Assistant);
        cfg.gate.min_voiced_ratio = 0.05;
        let mut s = session(cfg);
        s.handle_text(START);

        let actions = speak(&mut s);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], SessionAction::Send(ControlMessage::processing()));
        let (turn_id, path) = match &actions[1] {
            SessionAction::Transcribe { turn_id, path } => (*turn_id, path.clone()),
            other => panic!("unexpected {other:?}"),
        };

        // the turn file is complete before transcription is requested
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 19 * 320);

        let actions = s.complete_transcription(turn_id, "hello there");
        assert_eq!(
            actions,
            vec![
                SessionAction::Send(ControlMessage::AsrResult {
                    text: "hello there".into()
                }),
                SessionAction::Send(ControlMessage::AssistantReply {
                    text: "Got it: hello there".into()
                }),
            ]
        );
        assert!(s.playback_active());

        // a second delivery for the same turn is ignored
        assert!(s.complete_transcription(turn_id, "again").is_empty());
    }

    #[test]
    fn test_empty_transcript_uses_placeholder_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), SessionMode::Assistant);
        cfg.gate.min_voiced_ratio = 0.0;
        let mut s = session(cfg);

        let actions = speak(&mut s);
        let turn_id = match &actions[1] {
            SessionAction::Transcribe { turn_id, .. } => *turn_id,
            other => panic!("unexpected {other:?}"),
        };
        let actions = s.complete_transcription(turn_id, "  ");
        assert_eq!(
            actions[0],
            SessionAction::Send(ControlMessage::AsrResult {
                text: DEFAULT_PLACEHOLDER.into()
            })
        );
        assert_eq!(
            actions[1],
            SessionAction::Send(ControlMessage::AssistantReply {
                text: RuleResponder::FALLBACK.into()
            })
        );
    }

    #[test]
    fn test_barge_in_precedes_new_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), SessionMode::Assistant);
        cfg.gate.min_voiced_ratio = 0.0;
        let mut s = session(cfg);

        let actions = speak(&mut s);
        if let SessionAction::Transcribe { turn_id, .. } = &actions[1] {
            s.complete_transcription(*turn_id, "hi");
        }
        assert!(s.playback_active());

        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.extend(s.handle_audio(&chunk(1500)));
        }
        assert_eq!(actions, vec![SessionAction::Send(ControlMessage::barge_in())]);
        assert!(!s.playback_active());
        assert!(s.in_turn());

        // only one barge-in per reply
        for _ in 0..18 {
            s.handle_audio(&chunk(0));
        }
        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.extend(s.handle_audio(&chunk(1500)));
        }
        assert!(actions.is_empty());
    }

    #[test]
    fn test_malformed_text_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path(), SessionMode::Assistant));
        assert!(s.handle_text("{not json").is_empty());
        assert!(s.handle_text(r#"{"type":"unknown"}"#).is_empty());
        assert!(!s.is_closed());
    }

    #[test]
    fn test_stop_closes_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path(), SessionMode::Assistant));
        s.handle_audio(&chunk(100));
        s.handle_audio(&chunk(100));

        let actions = s.handle_text(r#"{"type":"stop","ts_ms":5}"#);
        assert_eq!(actions, vec![SessionAction::Close]);
        assert!(s.is_closed());
        assert!(s.handle_audio(&chunk(100)).is_empty());

        let summary = s.finish();
        assert_eq!(summary.bytes_ingested, 1280);
        assert_eq!(summary.raw_files.len(), 1);
        let reader = hound::WavReader::open(&summary.raw_files[0]).unwrap();
        assert_eq!(reader.len(), 640);
    }

    #[test]
    fn test_start_reopens_raw_file_and_rejects_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path(), SessionMode::Assistant));
        let first = s.raw_path().unwrap().to_path_buf();

        s.handle_text(r#"{"type":"start","sample_rate":16000,"bits":24,"channels":2}"#);
        assert_eq!(s.format(), StreamFormat::default());
        let second = s.raw_path().unwrap().to_path_buf();
        assert_ne!(first, second);

        s.handle_text(r#"{"type":"start","sample_rate":8000,"bits":16,"channels":1}"#);
        assert_eq!(s.format().sample_rate, 8000);

        let summary = s.finish();
        assert_eq!(summary.raw_files.len(), 3);
        let reader = hound::WavReader::open(&summary.raw_files[2]).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
    }

    #[test]
    fn test_transcription_after_close_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), SessionMode::Assistant);
        cfg.gate.min_voiced_ratio = 0.0;
        let mut s = session(cfg);
        let actions = speak(&mut s);
        let turn_id = match &actions[1] {
            SessionAction::Transcribe { turn_id, .. } => *turn_id,
            other => panic!("unexpected {other:?}"),
        };
        s.finish();
        assert!(s.complete_transcription(turn_id, "late").is_empty());
    }

    #[test]
    fn test_record_mode_opens_file_implicitly() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path(), SessionMode::Record));
        assert!(s.raw_path().is_none());

        // no turn segmentation in record mode
        let actions = speak(&mut s);
        assert!(actions.is_empty());
        let name = s.raw_path().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("esp32-test_2"), "{name}");

        let summary = s.finish();
        assert_eq!(summary.turns_detected, 0);
        let reader = hound::WavReader::open(&summary.raw_files[0]).unwrap();
        assert_eq!(reader.len(), 24 * 320);
    }
}
