//! Aggregate metrics of a predictions log.
//!
//! Computed once from the full log as a fold over the *set* of predictions:
//! records are ordered by example id before summing so the floating-point
//! result never depends on completion order.

use std::collections::BTreeMap;

use crate::types::{Prediction, RunMetrics, SliceAssignment, SliceMetrics};

#[derive(Default)]
struct Tally {
    scored: usize,
    correct: usize,
}

impl Tally {
    fn add(&mut self, correct: Option<bool>) {
        if let Some(c) = correct {
            self.scored += 1;
            if c {
                self.correct += 1;
            }
        }
    }

    fn accuracy(&self) -> f64 {
        if self.scored == 0 {
            0.0
        } else {
            self.correct as f64 / self.scored as f64
        }
    }
}

/// Fold a set of predictions into run metrics. `computed_at` is left unset.
pub fn aggregate(predictions: &[Prediction]) -> RunMetrics {
    let mut ordered: Vec<&Prediction> = predictions.iter().collect();
    ordered.sort_by(|a, b| a.example_id.cmp(&b.example_id));

    let mut overall = Tally::default();
    let mut slices: BTreeMap<&SliceAssignment, Tally> = BTreeMap::new();
    let mut extra: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    let mut failed = 0;
    let mut latency_sum = 0.0;
    let mut latency_n = 0usize;

    for p in &ordered {
        overall.add(p.correct);
        for s in &p.slices {
            slices.entry(s).or_default().add(p.correct);
        }
        for (name, value) in &p.metrics {
            let entry = extra.entry(name.as_str()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        if p.is_failed() {
            failed += 1;
        } else {
            latency_sum += p.latency_ms;
            latency_n += 1;
        }
    }

    RunMetrics {
        overall_accuracy: overall.accuracy(),
        correct: overall.correct,
        scored: overall.scored,
        failed,
        total: ordered.len(),
        mean_latency_ms: if latency_n == 0 {
            0.0
        } else {
            latency_sum / latency_n as f64
        },
        slices: slices
            .into_iter()
            .filter(|(_, t)| t.scored > 0)
            .map(|(s, t)| SliceMetrics {
                feature: s.feature.clone(),
                value: s.value.clone(),
                count: t.scored,
                correct: t.correct,
                accuracy: t.accuracy(),
            })
            .collect(),
        extra: extra
            .into_iter()
            .map(|(name, (sum, n))| (name.to_string(), sum / n as f64))
            .collect(),
        computed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Example, Generation, Score};
    use pretty_assertions::assert_eq;

    fn pred(id: &str, subject: &str, correct: Option<bool>, latency: f64) -> Prediction {
        let ex = Example::new(id).with_metadata("subject", subject);
        let mut g = Generation::text("x");
        g.latency_ms = latency;
        let mut score = Score {
            correct,
            ..Default::default()
        };
        score.metrics.insert("f1".into(), if correct == Some(true) { 1.0 } else { 0.5 });
        Prediction::scored(&ex, g, score, 0, false)
    }

    #[test]
    fn test_aggregate_basic() {
        let preds = vec![
            pred("a", "math", Some(true), 10.0),
            pred("b", "math", Some(false), 20.0),
            pred("c", "art", Some(true), 30.0),
            Prediction::failed(&Example::new("d").with_ground_truth("x"), "boom", 0),
        ];
        let m = aggregate(&preds);
        assert_eq!(m.total, 4);
        assert_eq!(m.scored, 4);
        assert_eq!(m.correct, 2);
        assert_eq!(m.failed, 1);
        assert!((m.overall_accuracy - 0.5).abs() < 1e-12);
        assert!((m.mean_latency_ms - 20.0).abs() < 1e-12);

        let math = m.slices.iter().find(|s| s.value == "math").unwrap();
        assert_eq!((math.count, math.correct), (2, 1));
        let art = m.slices.iter().find(|s| s.value == "art").unwrap();
        assert!((art.accuracy - 1.0).abs() < 1e-12);
        assert!((m.extra["f1"] - 2.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_order_independent() {
        let mut preds: Vec<Prediction> = (0..50)
            .map(|i| {
                pred(
                    &format!("ex-{i:02}"),
                    if i % 3 == 0 { "x" } else { "y" },
                    Some(i % 2 == 0),
                    0.1 * i as f64,
                )
            })
            .collect();
        let forward = aggregate(&preds);
        preds.reverse();
        preds.swap(3, 17);
        assert_eq!(aggregate(&preds), forward);
    }

    #[test]
    fn test_withheld_ground_truth_not_scored() {
        let preds = vec![pred("a", "s", None, 1.0), pred("b", "s", Some(true), 1.0)];
        let m = aggregate(&preds);
        assert_eq!(m.scored, 1);
        assert_eq!(m.total, 2);
        assert!((m.overall_accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_log() {
        let m = aggregate(&[]);
        assert_eq!(m.total, 0);
        assert_eq!(m.overall_accuracy, 0.0);
        assert!(m.slices.is_empty());
    }
}
