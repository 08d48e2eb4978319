//! # Anomaly Detector
//!
//! Bounded-window Z-score classifier. Each worker owns its own instance
//! (per-worker statistical context); cross-worker sharing is explicitly
//! not required by the design — it would add contention without
//! materially improving detection quality at target throughput.

use std::collections::VecDeque;

/// Minimum sample count before classification is attempted.
const WARMUP_SAMPLES: usize = 30;

pub struct AnomalyDetector {
    window: VecDeque<f64>,
    window_size: usize,
    threshold: f64,
}

impl AnomalyDetector {
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            threshold,
        }
    }

    /// Append `value`, evicting the oldest when full, and classify it.
    /// Returns `(is_anomaly, z_score)`.
    pub fn detect(&mut self, value: f64) -> (bool, f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);

        if self.window.len() < WARMUP_SAMPLES {
            return (false, 0.0);
        }

        let mean = self.mean();
        let std_dev = self.population_std_dev(mean);
        if std_dev == 0.0 {
            return (false, 0.0);
        }

        let z = (value - mean).abs() / std_dev;
        (z > self.threshold, z)
    }

    fn mean(&self) -> f64 {
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    fn population_std_dev(&self, mean: f64) -> f64 {
        let variance = self
            .window
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / self.window.len() as f64;
        variance.sqrt()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(100, 3.0)
    }
}
