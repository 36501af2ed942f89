//! Per-edge metric baselines
//!
//! Keeps the last N samples of a metric and their mean and sample standard
//! deviation. A baseline is only trusted once it holds a minimum number of
//! samples; until then it is warming up and suppresses detection.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Minimum samples before a baseline is trusted
pub const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Default number of samples in the rolling window
pub const DEFAULT_BASELINE_WINDOW: usize = 60;

/// Metric a baseline tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    BytesPerSec,
    ErrorRate,
}

/// Baseline lifecycle; there is no terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineState {
    WarmingUp,
    Baselined,
}

/// Rolling mean and standard deviation over the most recent samples
#[derive(Debug, Clone)]
pub struct Baseline {
    /// Current mean value
    pub mean: f64,
    /// Sample standard deviation (Bessel's correction)
    pub std_dev: f64,
    samples: VecDeque<f64>,
    window: usize,
}

impl Baseline {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            mean: 0.0,
            std_dev: 0.0,
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        while self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.recalculate();
    }

    /// Two-pass mean/variance over the window
    fn recalculate(&mut self) {
        let count = self.samples.len();
        if count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        self.mean = self.samples.iter().sum::<f64>() / count as f64;

        self.std_dev = if count > 1 {
            let variance = self
                .samples
                .iter()
                .map(|v| (v - self.mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn state(&self, min_samples: usize) -> BaselineState {
        if self.samples.len() >= min_samples {
            BaselineState::Baselined
        } else {
            BaselineState::WarmingUp
        }
    }

    pub fn is_baselined(&self, min_samples: usize) -> bool {
        self.state(min_samples) == BaselineState::Baselined
    }

    /// Standard deviations `value` lies above the mean, if defined
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev < f64::EPSILON {
            None
        } else {
            Some((value - self.mean) / self.std_dev)
        }
    }
}

impl Default for Baseline {
    fn default() -> Self {
        Self::new(DEFAULT_BASELINE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warm_up_transition() {
        let mut baseline = Baseline::default();
        for i in 0..MIN_SAMPLES_FOR_DETECTION {
            assert_eq!(baseline.state(MIN_SAMPLES_FOR_DETECTION), BaselineState::WarmingUp);
            baseline.add_sample(i as f64);
        }
        assert_eq!(baseline.state(MIN_SAMPLES_FOR_DETECTION), BaselineState::Baselined);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut baseline = Baseline::new(10);
        for i in 0..100 {
            baseline.add_sample(i as f64);
        }
        assert_eq!(baseline.count(), 10);
        // last ten samples are 90..=99
        assert!((baseline.mean - 94.5).abs() < 1e-9);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let mut baseline = Baseline::default();
        for i in 1..=20 {
            baseline.add_sample(i as f64);
        }
        assert!((baseline.mean - 10.5).abs() < 0.01);
        assert!((baseline.std_dev - 5.916).abs() < 0.01);
        assert!(baseline.z_score(30.0).unwrap() > 3.0);
    }

    #[test]
    fn test_flat_series_has_no_z_score() {
        let mut baseline = Baseline::default();
        for _ in 0..20 {
            baseline.add_sample(100.0);
        }
        assert_eq!(baseline.std_dev, 0.0);
        assert!(baseline.z_score(350.0).is_none());
    }

    #[test]
    fn test_non_finite_samples_ignored() {
        let mut baseline = Baseline::default();
        baseline.add_sample(f64::NAN);
        baseline.add_sample(f64::INFINITY);
        assert_eq!(baseline.count(), 0);
    }
}
