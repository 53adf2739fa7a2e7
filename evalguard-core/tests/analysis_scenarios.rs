//! End-to-end scenarios for the comparator, regression gates, slice discovery
//! and the contamination scanner.

use evalguard_core::artifact::{RunArtifact, RunManifest};
use evalguard_core::compare::{ChangeKind, Side, compare};
use evalguard_core::config::{CompareConfig, ContaminationConfig, RunSpec, SliceConfig};
use evalguard_core::contamination::{ContaminationLevel, ContaminationScanner, MatchKind, TrainingRecord};
use evalguard_core::gates::{RegressionGate, evaluate_gates};
use evalguard_core::slices;
use evalguard_core::types::{DatasetVersion, Example, Generation, Payload, Prediction, Score};

const PASSAGE: &str = "In the early nineteenth century the river trade transformed the \
    small market town into a regional centre. Barges carried grain, timber and coal \
    downstream to the coast, and returned with cloth, tea and manufactured goods from \
    the port warehouses. Merchants built brick houses along the quay, and a new bridge \
    replaced the old ferry crossing in 1824. The arrival of the railway thirty years \
    later slowly drew traffic away from the water, yet the canal basin remained busy \
    with local boats until the end of the century. Today the restored wharf buildings \
    house a museum, several workshops and a popular market held every Saturday, while \
    the towpath forms part of a long distance footpath that follows the valley for \
    more than forty miles through farmland, woods and villages.";

fn manifest(run_id: &str) -> RunManifest {
    RunManifest::new(
        run_id,
        RunSpec::new("bench", "test", "mock:m", "v1"),
        DatasetVersion {
            name: "bench".into(),
            version: "1".into(),
            split: "test".into(),
            num_examples: None,
            content_hash: "abc".into(),
        },
        "test",
        1,
    )
}

fn run(run_id: &str, rows: &[(&str, bool)]) -> RunArtifact {
    let predictions = rows
        .iter()
        .map(|(id, correct)| {
            let ex = Example::new(*id)
                .with_ground_truth("x")
                .with_metadata("kind", "demo");
            Prediction::scored(
                &ex,
                Generation::text("x"),
                Score {
                    correct: Some(*correct),
                    ..Default::default()
                },
                0,
                false,
            )
        })
        .collect();
    RunArtifact::from_predictions(manifest(run_id), predictions)
}

fn as_refs(rows: &[(String, bool)]) -> Vec<(&str, bool)> {
    rows.iter().map(|(id, c)| (id.as_str(), *c)).collect()
}

#[test]
fn test_comparator_concrete_scenario() {
    let baseline = run("base", &[("A", true), ("B", false), ("C", true)]);
    let candidate = run("cand", &[("A", true), ("B", true), ("C", false), ("D", true)]);

    let result = compare(&baseline, &candidate, &CompareConfig::default()).unwrap();

    assert_eq!(result.example("A").unwrap().change, ChangeKind::Unchanged);
    assert_eq!(result.example("B").unwrap().change, ChangeKind::Improved);
    assert_eq!(result.example("C").unwrap().change, ChangeKind::Regressed);
    assert_eq!(
        result.example("D").unwrap().change,
        ChangeKind::Missing {
            only_in: Side::Candidate
        }
    );
    assert_eq!(result.summary.only_in_candidate, 1);

    let overall = &result.overall;
    assert_eq!(overall.count, 3);
    assert!((overall.baseline_accuracy - 2.0 / 3.0).abs() < 1e-9);
    assert!((overall.candidate_accuracy - 2.0 / 3.0).abs() < 1e-9);
    assert!(overall.delta.abs() < 1e-9);
    assert!(overall.low_confidence);
    let ci = overall.ci.unwrap();
    assert!(ci.lower <= 0.0 && ci.upper >= 0.0);
    assert_eq!(ci.resamples, 1000);

    let slice = result.slice("kind", "demo").unwrap();
    assert_eq!(slice.delta.count, 3);
    assert!(slice.delta.low_confidence);
}

#[test]
fn test_comparator_is_reproducible() {
    let baseline = run("base", &[("A", true), ("B", false), ("C", true), ("E", false)]);
    let candidate = run("cand", &[("A", false), ("B", true), ("C", true), ("E", true)]);
    let config = CompareConfig::default();
    assert_eq!(
        compare(&baseline, &candidate, &config).unwrap(),
        compare(&baseline, &candidate, &config).unwrap()
    );
}

#[test]
fn test_gates_on_scenario() {
    let rows_a: Vec<(String, bool)> = (0..50).map(|i| (format!("e{i}"), true)).collect();
    let rows_b: Vec<(String, bool)> = (0..50).map(|i| (format!("e{i}"), i >= 10)).collect();
    let baseline = run("base", &as_refs(&rows_a));
    let candidate = run("cand", &as_refs(&rows_b));
    let result = compare(&baseline, &candidate, &CompareConfig::default()).unwrap();

    let report = evaluate_gates(
        &[
            RegressionGate::min_delta("overall", -0.05),
            RegressionGate::min_delta("kind=demo", -0.5),
        ],
        &result,
    );
    assert!(!report.passed());
    assert_eq!(report.failures().count(), 1);
    assert!(report.outcomes[0].message.starts_with("overall.delta: -0.2000"));
}

#[test]
fn test_slice_pruning_is_monotonic() {
    let predictions = (0..60)
        .map(|i| {
            let ex = Example::new(format!("e{i:02}"))
                .with_metadata("a", format!("{}", i % 2))
                .with_metadata("b", format!("{}", i % 3))
                .with_metadata("c", format!("{}", i % 5));
            Prediction::scored(
                &ex,
                Generation::text("x"),
                Score {
                    correct: Some(i % 7 != 0 && i % 4 != 1),
                    ..Default::default()
                },
                0,
                false,
            )
        })
        .collect();
    let artifact = RunArtifact::from_predictions(manifest("r"), predictions);
    let config = SliceConfig {
        min_support: 8,
        max_depth: 3,
        top_k: 100,
    };
    let report = slices::discover(&artifact, &config).unwrap();
    for candidate in &report.candidates {
        assert!(candidate.count >= config.min_support, "{}", candidate.label());
        assert!(candidate.accuracy < report.overall_accuracy);
    }
    // a x b x c cells hold two examples each; triples can never survive.
    assert!(report.candidates.iter().all(|c| c.depth() < 3));
}

#[test]
fn test_contamination_scenario() {
    let records = vec![
        TrainingRecord::text("capital", "What is the capital of France?"),
        TrainingRecord::text("passage", PASSAGE),
    ];
    let scanner = ContaminationScanner::new(ContaminationConfig::default(), &records);

    let question = |id: &str, text: &str| Example::new(id).with_input("question", Payload::text(text));
    let half: String = PASSAGE.chars().take(PASSAGE.len() / 3).collect::<String>()
        + " The committee then reviewed quarterly accounts, approved the budget for \
           street lighting, and postponed a decision on the proposed swimming pool.";
    let examples = vec![
        question("exact", "what is the capital of france"),
        question("paraphrase", &PASSAGE.replacen("a new bridge", "the new bridge", 1)),
        question("partial", &half),
        question("clean", "Name three noble gases and describe one use of each."),
    ];

    let report = scanner.scan(&examples);
    assert_eq!(report.total_examples, 4);

    let exact = report.example("exact").unwrap();
    assert_eq!(exact.level, ContaminationLevel::Exact);
    assert!(exact
        .matches
        .iter()
        .any(|m| m.kind == MatchKind::Exact && m.record_id == "capital"));

    let paraphrase = report.example("paraphrase").unwrap();
    assert!(paraphrase.matches.iter().all(|m| m.kind == MatchKind::NearDuplicateText));
    assert!(paraphrase.best_score >= 0.9);
    assert_eq!(paraphrase.matches[0].record_id, "passage");

    assert!(report.example("partial").is_none());
    assert!(report.example("clean").is_none());
    assert_eq!(report.contaminated, 2);
    assert!((report.contamination_rate - 0.5).abs() < 1e-12);
}
