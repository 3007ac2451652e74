//! Intensity histogram of a sample array

use crate::SampleArray;

/// Default number of bins published with previews
pub const DEFAULT_BINS: usize = 256;

/// Histogram over `[0, 2^bit_depth - 1]` with `bins` equal-width bins.
///
/// The top value falls in the last bin.
pub fn histogram(samples: &SampleArray, bins: usize) -> Vec<u64> {
    let mut counts = vec![0u64; bins];
    if bins == 0 {
        return counts;
    }
    let max = samples.max_value() as u64;
    for value in samples.values() {
        let index = if max == 0 {
            0
        } else {
            ((value as u64 * bins as u64) / max).min(bins as u64 - 1) as usize
        };
        counts[index] += 1;
    }
    counts
}
