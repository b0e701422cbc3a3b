//! # Application State Management
//!
//! State shared by every HTTP handler and every audio connection actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread and connection actor holds a handle
//! - **RwLock**: `/metrics` readers run concurrently, connection actors take
//!   the write lock briefly to bump a counter
//!
//! Lock poisoning is recovered from rather than propagated: a counter that was
//! mid-update when some thread panicked is still a usable counter.

use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::audio::session::SessionConfig;
use crate::config::AppConfig;
use crate::transcription::engine::{build_transcriber, Transcriber};
use crate::transcription::responder::{ResponderPolicy, RuleResponder};
use crate::transcription::worker::TranscriptionPool;

#[derive(Clone)]
pub struct AppState {
    /// Validated at startup, fixed for the life of the server
    pub config: Arc<AppConfig>,

    pub metrics: Arc<RwLock<IngestMetrics>>,

    pub start_time: Instant,

    /// Shared by all connections, bounds concurrent transcriptions server-wide
    pub pool: TranscriptionPool,

    pub responder: Arc<dyn ResponderPolicy>,
}

/// Counters collected across all audio connections.
///
/// `turns_detected` always equals `turns_accepted + turns_skipped`; a turn
/// still open when its connection drops is counted nowhere.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestMetrics {
    pub active_sessions: u32,
    pub total_sessions: u64,
    /// Upgrades refused because the session limit was reached
    pub rejected_sessions: u64,
    pub bytes_ingested: u64,
    pub turns_detected: u64,
    pub turns_accepted: u64,
    pub turns_skipped: u64,
    pub barge_ins: u64,
    pub transcriptions_completed: u64,
    pub transcription_failures: u64,
}

impl IngestMetrics {
    /// Fraction of detected turns that passed the quality gate.
    pub fn acceptance_rate(&self) -> f64 {
        if self.turns_detected > 0 {
            self.turns_accepted as f64 / self.turns_detected as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    /// Build the state with the backends named in the configuration.
    pub fn new(config: AppConfig) -> Self {
        let transcriber = build_transcriber(&config.transcription_config());
        Self::with_backends(config, transcriber, Arc::new(RuleResponder))
    }

    /// Build the state around explicit collaborators.
    pub fn with_backends(
        config: AppConfig,
        transcriber: Arc<dyn Transcriber>,
        responder: Arc<dyn ResponderPolicy>,
    ) -> Self {
        let pool = TranscriptionPool::new(transcriber, config.performance.max_concurrent_transcriptions);
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(IngestMetrics::default())),
            start_time: Instant::now(),
            pool,
            responder,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        self.config.session_config()
    }

    /// Claim a session slot. Returns `false`, and counts the rejection, when
    /// `max_concurrent_sessions` connections are already active.
    pub fn try_open_session(&self) -> bool {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= limit {
            metrics.rejected_sessions += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Give back a slot claimed by [`try_open_session`](Self::try_open_session).
    pub fn close_session(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.write_metrics().bytes_ingested += bytes as u64;
    }

    pub fn record_turn(&self, accepted: bool) {
        let mut metrics = self.write_metrics();
        metrics.turns_detected += 1;
        if accepted {
            metrics.turns_accepted += 1;
        } else {
            metrics.turns_skipped += 1;
        }
    }

    pub fn record_barge_in(&self) {
        self.write_metrics().barge_ins += 1;
    }

    pub fn record_transcription(&self, failed: bool) {
        let mut metrics = self.write_metrics();
        metrics.transcriptions_completed += 1;
        if failed {
            metrics.transcription_failures += 1;
        }
    }

    /// Copy of the counters, taken under the read lock.
    pub fn metrics_snapshot(&self) -> IngestMetrics {
        self.read_metrics().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, IngestMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, IngestMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::engine::NullTranscriber;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::with_backends(config, Arc::new(NullTranscriber), Arc::new(RuleResponder))
    }

    #[test]
    fn test_session_limit() {
        let state = state_with_limit(2);
        assert!(state.try_open_session());
        assert!(state.try_open_session());
        assert!(!state.try_open_session());

        state.close_session();
        assert!(state.try_open_session());

        let m = state.metrics_snapshot();
        assert_eq!(m.active_sessions, 2);
        assert_eq!(m.total_sessions, 3);
        assert_eq!(m.rejected_sessions, 1);
    }

    #[test]
    fn test_close_session_never_underflows() {
        let state = state_with_limit(1);
        state.close_session();
        assert_eq!(state.metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_turn_counters() {
        let state = state_with_limit(1);
        state.record_turn(true);
        state.record_turn(false);
        state.record_turn(false);
        state.record_barge_in();
        state.record_transcription(true);
        state.record_bytes(640);

        let m = state.metrics_snapshot();
        assert_eq!(m.turns_detected, 3);
        assert_eq!(m.turns_accepted + m.turns_skipped, m.turns_detected);
        assert_eq!(m.barge_ins, 1);
        assert_eq!(m.transcription_failures, 1);
        assert_eq!(m.bytes_ingested, 640);
        assert!((m.acceptance_rate() - 1.0 / 3.0).abs() < 1e-9);
    }
}
