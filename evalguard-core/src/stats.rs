//! Bootstrap confidence intervals.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::fingerprint::sha256_u64;

/// Empirical percentile interval of a bootstrap distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
    pub resamples: usize,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// A generator seeded from `seed` and a label, so that each slice gets its own
/// reproducible stream regardless of the order slices are processed in.
pub fn labelled_rng(seed: u64, label: &str) -> StdRng {
    StdRng::seed_from_u64(seed ^ sha256_u64(label.as_bytes()))
}

/// Bootstrap interval of `mean(candidate) - mean(baseline)` over matched pairs.
///
/// Pairs are resampled with replacement `resamples` times. Returns `None` when
/// there are no pairs or no resamples.
pub fn bootstrap_delta(
    pairs: &[(bool, bool)],
    resamples: usize,
    confidence: f64,
    rng: &mut StdRng,
) -> Option<ConfidenceInterval> {
    if pairs.is_empty() || resamples == 0 {
        return None;
    }
    let n = pairs.len();
    let mut deltas: Vec<f64> = (0..resamples)
        .map(|_| {
            let mut diff: i64 = 0;
            for _ in 0..n {
                let (b, c) = pairs[rng.gen_range(0..n)];
                diff += i64::from(c) - i64::from(b);
            }
            diff as f64 / n as f64
        })
        .collect();
    deltas.sort_by(f64::total_cmp);

    let (lower, upper) = percentile_indices(resamples, confidence);
    Some(ConfidenceInterval {
        lower: deltas[lower],
        upper: deltas[upper],
        confidence,
        resamples,
    })
}

/// Indices of the lower and upper percentile in a sorted sample of `b` values.
fn percentile_indices(b: usize, confidence: f64) -> (usize, usize) {
    let alpha = (1.0 - confidence).clamp(0.0, 1.0);
    let lower = ((alpha / 2.0) * b as f64) as usize;
    let upper = (((1.0 - alpha / 2.0) * b as f64) as usize).saturating_sub(1);
    let last = b - 1;
    let lower = lower.min(last);
    (lower, upper.clamp(lower, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_indices() {
        assert_eq!(percentile_indices(1000, 0.95), (25, 974));
        assert_eq!(percentile_indices(1, 0.95), (0, 0));
        assert_eq!(percentile_indices(10, 1.0), (0, 9));
    }

    #[test]
    fn test_identical_runs_zero_interval() {
        let pairs = vec![(true, true), (false, false), (true, true)];
        let ci = bootstrap_delta(&pairs, 500, 0.95, &mut labelled_rng(1, "overall")).unwrap();
        assert_eq!(ci.lower, 0.0);
        assert_eq!(ci.upper, 0.0);
    }

    #[test]
    fn test_clear_improvement_excludes_zero() {
        let mut pairs = vec![(false, true); 60];
        pairs.extend(vec![(true, true); 40]);
        let ci = bootstrap_delta(&pairs, 1000, 0.95, &mut labelled_rng(7, "overall")).unwrap();
        assert!(ci.lower > 0.4, "{ci:?}");
        assert!(ci.contains(0.6));
    }

    #[test]
    fn test_deterministic_for_seed() {
        let pairs = vec![(true, false), (false, true), (true, true), (false, false)];
        let a = bootstrap_delta(&pairs, 200, 0.9, &mut labelled_rng(3, "s")).unwrap();
        let b = bootstrap_delta(&pairs, 200, 0.9, &mut labelled_rng(3, "s")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_pairs() {
        assert!(bootstrap_delta(&[], 100, 0.95, &mut labelled_rng(0, "x")).is_none());
        assert!(bootstrap_delta(&[(true, true)], 0, 0.95, &mut labelled_rng(0, "x")).is_none());
    }
}
