use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics, Statistics as StatrsStats};

/// Latency distribution of one probe scenario, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl Statistics {
    pub fn from_samples(samples: &[f64]) -> Self {
        let finite: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
        if finite.is_empty() {
            return Self::default();
        }

        let count = finite.len();
        let mut data = Data::new(finite);

        Self {
            count,
            mean: data.mean().unwrap_or(0.0),
            median: data.median(),
            p90: data.quantile(0.90),
            p95: data.quantile(0.95),
            p99: data.quantile(0.99),
            p999: data.quantile(0.999),
            min: data.min(),
            max: data.max(),
            // A single sample has no spread.
            stddev: data.std_dev().filter(|s| s.is_finite()).unwrap_or(0.0),
        }
    }

    /// One-line rendering for console output.
    pub fn summary(&self) -> String {
        format!(
            "n={} mean={:.2}ms p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
            self.count, self.mean, self.median, self.p95, self.p99, self.max
        )
    }
}

/// Successful requests per second over a wall-clock duration.
pub fn throughput(successes: usize, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        successes as f64 / duration_secs
    } else {
        0.0
    }
}
