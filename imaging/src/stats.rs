//! Summary statistics embedded in saved images

use crate::SampleArray;
use serde::{Deserialize, Serialize};

/// Pixel statistics over a whole sample array
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageStatistics {
    pub mean: f64,
    /// Middle value; the mean of the two middle values for even counts
    pub median: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub max: f64,
    pub min: f64,
}

impl ImageStatistics {
    /// Compute statistics. An empty array yields all zeros.
    pub fn compute(samples: &SampleArray) -> Self {
        let n = samples.len();
        if n == 0 {
            return Self::default();
        }

        // Counting pass: bounded integer samples make the median a histogram walk
        let mut counts = vec![0u64; samples.max_value() as usize + 1];
        let mut sum = 0f64;
        let mut min = u16::MAX;
        let mut max = 0u16;
        for value in samples.values() {
            let slot = (value as usize).min(counts.len() - 1);
            counts[slot] += 1;
            sum += value as f64;
            min = min.min(value);
            max = max.max(value);
        }
        let mean = sum / n as f64;

        let variance = samples
            .values()
            .map(|v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;

        let median = if n % 2 == 1 {
            nth_value(&counts, n / 2) as f64
        } else {
            (nth_value(&counts, n / 2 - 1) as f64 + nth_value(&counts, n / 2) as f64) / 2.0
        };

        Self {
            mean,
            median,
            std_dev: variance.sqrt(),
            max: max as f64,
            min: min as f64,
        }
    }
}

/// Value at sorted position `rank` (zero based)
fn nth_value(counts: &[u64], rank: usize) -> usize {
    let mut seen = 0u64;
    for (value, &count) in counts.iter().enumerate() {
        seen += count;
        if seen > rank as u64 {
            return value;
        }
    }
    counts.len().saturating_sub(1)
}
