//! Variable difficulty.
//!
//! Each connection on a vardiff-enabled port keeps a short history of the
//! intervals between its share submissions. Once per retarget window the
//! average interval is compared to the target share time; when it falls
//! outside the allowed variance, a new difficulty is proposed that would
//! bring the interval back to target. The connection queues the proposal
//! and applies it with the next job.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::types::Difficulty;

/// Per-port vardiff settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VarDiffConfig {
    pub min_diff: f64,
    pub max_diff: f64,
    /// Desired seconds between shares.
    pub target_time: f64,
    /// Seconds between retarget evaluations.
    pub retarget_time: f64,
    /// Allowed deviation from `target_time`, in percent.
    pub variance_percent: f64,
    /// Only ever halve or double the difficulty.
    pub x2_mode: bool,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min_diff: 8.0,
            max_diff: 512.0,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            x2_mode: false,
        }
    }
}

/// Retarget logic shared by every connection on a port.
#[derive(Debug, Clone)]
pub struct VarDiffController {
    config: VarDiffConfig,
    buffer_size: usize,
    t_min: f64,
    t_max: f64,
}

/// Per-connection history, owned by the connection task.
#[derive(Debug, Clone, Default)]
pub struct VarDiffState {
    last_ts: Option<f64>,
    last_retarget: f64,
    intervals: VecDeque<f64>,
}

impl VarDiffController {
    pub fn new(config: VarDiffConfig) -> Self {
        let variance = config.target_time * config.variance_percent / 100.0;
        let buffer_size = ((config.retarget_time / config.target_time) * 4.0).max(1.0) as usize;
        Self {
            buffer_size,
            t_min: config.target_time - variance,
            t_max: config.target_time + variance,
            config,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Record a submission at `ts` (seconds) and return the difficulty the
    /// connection should move to, if a retarget is due and warranted.
    pub fn on_submit(
        &self,
        state: &mut VarDiffState,
        ts: f64,
        current: Difficulty,
    ) -> Option<Difficulty> {
        let Some(last_ts) = state.last_ts else {
            state.last_retarget = ts - self.config.retarget_time / 2.0;
            state.last_ts = Some(ts);
            return None;
        };

        if state.intervals.len() == self.buffer_size {
            state.intervals.pop_front();
        }
        state.intervals.push_back(ts - last_ts);
        state.last_ts = Some(ts);

        if ts - state.last_retarget < self.config.retarget_time {
            return None;
        }

        state.last_retarget = ts;
        let avg = state.intervals.iter().sum::<f64>() / state.intervals.len() as f64;
        let current = current.as_f64();
        let mut ddiff = self.config.target_time / avg;

        if avg > self.t_max && current > self.config.min_diff {
            if self.config.x2_mode {
                ddiff = 0.5;
            }
            if ddiff * current < self.config.min_diff {
                ddiff = self.config.min_diff / current;
            }
        } else if avg < self.t_min {
            if self.config.x2_mode {
                ddiff = 2.0;
            }
            if ddiff * current > self.config.max_diff {
                ddiff = self.config.max_diff / current;
            }
        } else {
            return None;
        }

        state.intervals.clear();

        let proposed = Difficulty::new(current * ddiff)?.rounded(8);
        (proposed.as_f64() != current).then_some(proposed)
    }
}
