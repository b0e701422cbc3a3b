//! # Automatic Gain Control
//!
//! Feedback loop that nudges the Q8 gain applied by the conditioning chain
//! toward the value that would bring the chunk peak to `target_peak`.
//!
//! Rises are limited to `attack_step_q8` per chunk and falls to
//! `release_step_q8`, so a loud burst pulls the gain down faster than quiet
//! speech can push it up. The gain itself lives in
//! [`ConditionState`](crate::audio::processor::ConditionState); the controller
//! only holds its tuning.

use serde::{Deserialize, Serialize};

/// 1.0x in Q8.
pub const UNITY_GAIN_Q8: u16 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgcParams {
    /// Peak magnitude the loop steers toward
    pub target_peak: u32,

    pub gain_min_q8: u16,

    pub gain_max_q8: u16,

    /// Largest per-chunk increase
    pub attack_step_q8: u16,

    /// Largest per-chunk decrease
    pub release_step_q8: u16,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            target_peak: 12000,
            gain_min_q8: 64,   // 0.25x
            gain_max_q8: 1024, // 4.0x
            attack_step_q8: 8,
            release_step_q8: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoGainController {
    params: AgcParams,
}

impl AutoGainController {
    pub fn new(params: AgcParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AgcParams {
        &self.params
    }

    /// Unity gain, pulled into the configured bounds.
    pub fn initial_gain(&self) -> u16 {
        UNITY_GAIN_Q8.clamp(self.params.gain_min_q8, self.params.gain_max_q8.max(self.params.gain_min_q8))
    }

    /// Compute the gain for the next chunk from the current one and the peak
    /// observed in the chunk just conditioned. A zero peak leaves the gain as is.
    pub fn next_gain(&self, current_q8: u16, peak: u32) -> u16 {
        if peak == 0 {
            return current_q8;
        }

        let p = &self.params;
        let current = current_q8 as i64;
        let desired = ((p.target_peak as i64) << 8) / peak as i64;

        let stepped = if desired > current {
            (current + p.attack_step_q8 as i64).min(desired)
        } else {
            (current - p.release_step_q8 as i64).max(desired)
        };

        stepped.clamp(p.gain_min_q8 as i64, p.gain_max_q8 as i64) as u16
    }
}
