//! # Turn Quality Gate
//!
//! Post-hoc acceptance test over the statistics of a finished turn. A turn is
//! rejected when it is too short, too sparsely voiced or too quiet; the
//! resulting [`GateReport`] is sent back to the client as the `meta` of an
//! `asr_skipped` message.

use serde::{Deserialize, Serialize};

/// Per-turn loudness accumulator, created at turn start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    pub frame_count: u32,
    pub voiced_count: u32,
    pub rms_sum: u64,
    pub rms_max: u32,
}

impl TurnStats {
    pub fn add(&mut self, rms: u32, voiced: bool) {
        self.frame_count += 1;
        self.rms_sum += rms as u64;
        if voiced {
            self.voiced_count += 1;
        }
        self.rms_max = self.rms_max.max(rms);
    }

    pub fn mean_rms(&self) -> u32 {
        if self.frame_count == 0 {
            return 0;
        }
        (self.rms_sum / self.frame_count as u64) as u32
    }

    pub fn voiced_ratio(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        self.voiced_count as f64 / self.frame_count as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateConfig {
    pub min_turn_ms: u32,
    pub min_voiced_ratio: f64,
    pub min_peak_rms: u32,
    /// Duration of one chunk, used to turn frame counts into milliseconds
    pub chunk_ms: u32,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            min_turn_ms: 350,
            min_voiced_ratio: 0.35,
            min_peak_rms: 1200,
            chunk_ms: 20,
        }
    }
}

/// Measured values plus which conditions tripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub turn_ms: u32,
    /// Rounded to three decimals
    pub voiced_ratio: f64,
    pub max_rms: u32,
    pub mean_rms: u32,
    pub too_short: bool,
    pub too_unvoiced: bool,
    pub too_quiet: bool,
}

impl GateReport {
    pub fn rejected(&self) -> bool {
        self.too_short || self.too_unvoiced || self.too_quiet
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityGateConfig,
}

impl QualityGate {
    pub fn new(config: QualityGateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityGateConfig {
        &self.config
    }

    pub fn evaluate(&self, stats: &TurnStats) -> GateReport {
        let turn_ms = stats.frame_count * self.config.chunk_ms;
        let ratio = stats.voiced_ratio();

        GateReport {
            turn_ms,
            voiced_ratio: (ratio * 1000.0).round() / 1000.0,
            max_rms: stats.rms_max,
            mean_rms: stats.mean_rms(),
            too_short: turn_ms < self.config.min_turn_ms,
            // thresholds compare against the unrounded ratio
            too_unvoiced: ratio < self.config.min_voiced_ratio,
            too_quiet: stats.rms_max < self.config.min_peak_rms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(frames: u32, voiced: u32, rms: u32) -> TurnStats {
        let mut s = TurnStats::default();
        for i in 0..frames {
            if i < voiced {
                s.add(rms, true);
            } else {
                s.add(0, false);
            }
        }
        s
    }

    #[test]
    fn test_short_turn_rejected_regardless_of_loudness() {
        let gate = QualityGate::new(QualityGateConfig::default());
        // 17 frames * 20 ms = 340 ms, all voiced and very loud
        let report = gate.evaluate(&stats(17, 17, 30000));
        assert!(report.rejected());
        assert!(report.too_short);
        assert!(!report.too_unvoiced);
        assert!(!report.too_quiet);
        assert_eq!(report.turn_ms, 340);
    }

    #[test]
    fn test_turn_meeting_all_thresholds_accepted() {
        let gate = QualityGate::new(QualityGateConfig::default());
        let report = gate.evaluate(&stats(30, 20, 1500));
        assert!(!report.rejected());
        assert_eq!(report.turn_ms, 600);
        assert_eq!(report.voiced_ratio, 0.667);
        assert_eq!(report.max_rms, 1500);
        assert_eq!(report.mean_rms, 1000);
    }

    #[test]
    fn test_each_condition_reported() {
        let gate = QualityGate::new(QualityGateConfig::default());

        let report = gate.evaluate(&stats(40, 10, 5000));
        assert!(report.too_unvoiced && !report.too_short && !report.too_quiet);

        let report = gate.evaluate(&stats(40, 40, 1000));
        assert!(report.too_quiet && !report.too_short && !report.too_unvoiced);

        let report = gate.evaluate(&TurnStats::default());
        assert!(report.too_short && report.too_unvoiced && report.too_quiet);
        assert_eq!(report.mean_rms, 0);
    }

    #[test]
    fn test_report_json_shape() {
        let gate = QualityGate::new(QualityGateConfig::default());
        let report = gate.evaluate(&stats(19, 1, 1500));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["turn_ms"], 380);
        assert_eq!(value["voiced_ratio"], 0.053);
        assert_eq!(value["too_unvoiced"], true);
        assert_eq!(value["too_short"], false);
    }
}
