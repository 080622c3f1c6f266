//! Step snapshots and the sampling policy that filters them.
//!
//! The core hands every sampled snapshot to a user callback and otherwise
//! keeps no output state; serialization to JSON or NetCDF lives with the
//! embedder. Snapshots are serde-serializable so that layer can persist them
//! directly, and a snapshot stream is sufficient to reconstruct run state.

use serde_derive::{Deserialize, Serialize};

use crate::settings::SamplingSettings;
use crate::simulation::profiles::CoreProfiles;
use crate::Float;

/// State of one committed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub step: usize,
    /// Simulation time after the step [s].
    pub time: f64,
    /// Committed step size [s].
    pub dt: f64,
    /// Solver iterations of the successful attempt.
    pub iterations: usize,
    /// Residual norm reported by the solver.
    pub residual: Float,
    pub converged: bool,
    /// Retry attempts the step needed before it succeeded.
    pub retries: usize,
    pub profiles: CoreProfiles,
}

/// Decision returned by the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Reached the end of the time range.
    Completed,
    /// Stopped by the cancellation token or the callback; the summary holds
    /// the partial result.
    Cancelled,
}

/// Final result of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub steps: usize,
    pub retries: usize,
    pub sawtooth_crashes: usize,
    /// Simulation time at the end of the run [s].
    pub time: f64,
    pub profiles: CoreProfiles,
}

/// Stateful filter applying a [`SamplingSettings`] policy.
#[derive(Debug, Clone)]
pub struct Sampler {
    policy: SamplingSettings,
    last_emitted: Option<f64>,
}

impl Sampler {
    pub fn new(policy: SamplingSettings) -> Sampler {
        Sampler {
            policy,
            last_emitted: None,
        }
    }

    /// Whether the snapshot of (`step`, `time`) should be handed out.
    pub fn should_emit(&mut self, step: usize, time: f64) -> bool {
        match self.policy {
            SamplingSettings::EveryStep => true,
            SamplingSettings::EveryNthStep { n } => step % n == 0,
            SamplingSettings::EverySeconds { interval } => match self.last_emitted {
                Some(last) if time - last < interval => false,
                _ => {
                    self.last_emitted = Some(time);
                    true
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_step_always_emits() {
        let mut s = Sampler::new(SamplingSettings::EveryStep);
        for step in 0..10 {
            assert!(s.should_emit(step, step as f64 * 0.1));
        }
    }

    #[test]
    fn stride_sampling_filters_steps() {
        let mut s = Sampler::new(SamplingSettings::EveryNthStep { n: 3 });
        let emitted: Vec<usize> = (1..=9).filter(|&k| s.should_emit(k, 0.)).collect();
        assert_eq!(emitted, vec![3, 6, 9]);
    }

    #[test]
    fn time_sampling_respects_the_interval() {
        let mut s = Sampler::new(SamplingSettings::EverySeconds { interval: 0.5 });
        let mut emitted = Vec::new();
        for k in 0..20 {
            let t = k as f64 * 0.1;
            if s.should_emit(k, t) {
                emitted.push(k);
            }
        }
        assert_eq!(emitted, vec![0, 5, 10, 15]);
    }
}
