//! # Stage: Running Statistics
//!
//! ## Responsibility
//! Numeric building blocks shared by the pattern models and the metric
//! aggregator: Welford's online mean/variance accumulator, two-pass
//! population statistics and linear-interpolated percentiles.
//!
//! ## Guarantees
//! - Non-panicking: empty and single-sample inputs yield `None` or `0.0`
//! - Numerically stable: the online form never subtracts large sums

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Welford accumulator
// ---------------------------------------------------------------------------

/// Online mean / variance accumulator (Welford's algorithm).
///
/// `m2` is the running sum of squared deviations from the mean. Sample
/// variance is `m2 / (n - 1)` for `n > 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new accumulator with `x` folded in.
    pub fn push(self, x: f64) -> Self {
        let count = self.count + 1;
        let delta = x - self.mean;
        let mean = self.mean + delta / count as f64;
        let m2 = self.m2 + delta * (x - mean);
        Self { count, mean, m2 }
    }

    /// Sample variance (`n - 1` denominator). `0.0` with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        iter.into_iter().fold(RunningStats::new(), RunningStats::push)
    }
}

// ---------------------------------------------------------------------------
// Two-pass helpers
// ---------------------------------------------------------------------------

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divide by `n`).
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Sample variance (divide by `n - 1`), `None` below two samples.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    Some(values.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (values.len() - 1) as f64)
}

/// Sort a copy of `values` ascending. NaNs compare equal and keep input order.
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v
}

/// Linear-interpolated percentile over an ascending slice.
///
/// `rank` is in `[0, 100]`. The position is `rank/100 * (n - 1)`; the result
/// interpolates between the two neighbouring order statistics.
pub fn percentile_sorted(sorted: &[f64], rank: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let pos = (rank.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn percentile(values: &[f64], rank: f64) -> Option<f64> {
    percentile_sorted(&sorted(values), rank)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ===== RunningStats =====

    #[test]
    fn test_running_stats_empty() {
        let s = RunningStats::new();
        assert!(s.is_empty());
        assert_eq!(s.variance(), 0.0);
    }

    #[test]
    fn test_running_stats_single_sample() {
        let s = RunningStats::new().push(42.0);
        assert_eq!(s.count, 1);
        assert_eq!(s.mean, 42.0);
        assert_eq!(s.variance(), 0.0);
    }

    #[test]
    fn test_running_stats_matches_known_values() {
        let s: RunningStats = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter().collect();
        assert!((s.mean - 5.0).abs() < 1e-12);
        // sample variance of this classic set is 32/7
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_running_stats_constant_input_zero_variance() {
        let s: RunningStats = std::iter::repeat(75.0).take(500).collect();
        assert!((s.mean - 75.0).abs() < 1e-12);
        assert!(s.variance().abs() < 1e-12);
    }

    // ===== two-pass =====

    #[test]
    fn test_mean_empty_is_none() {
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn test_population_std_dev() {
        let sd = population_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sample_variance_needs_two() {
        assert!(sample_variance(&[1.0]).is_none());
        assert_eq!(sample_variance(&[1.0, 3.0]), Some(2.0));
    }

    // ===== percentiles =====

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 50.0), Some(2.5));
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(4.0));
    }

    #[test]
    fn test_percentile_unsorted_input() {
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 50.0), Some(2.5));
    }

    #[test]
    fn test_percentile_single_and_empty() {
        assert_eq!(percentile(&[7.0], 99.0), Some(7.0));
        assert!(percentile(&[], 50.0).is_none());
    }
}
