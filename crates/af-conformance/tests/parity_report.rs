//! Parity report generation over the built-in program corpus.

use af_conformance::{
    DriftClassification, GradientCheck, PARITY_REPORT_SCHEMA_VERSION, ParityConfig, ParityReport,
    run_suite,
};
use af_core::{ALL_PROGRAMS, ProgramSpec};
use af_test_utils::{
    TEST_LOG_SCHEMA_VERSION, TestCheck, TestLogV1, TestResult, append_log, fixture_id_from_json,
    init_test_tracing, read_logs, test_id,
};

fn suite() -> ParityReport {
    init_test_tracing();
    run_suite(ALL_PROGRAMS, &ParityConfig::default())
}

#[test]
fn every_builtin_program_passes() {
    let report = suite();
    assert_eq!(report.total, ALL_PROGRAMS.len());
    let failing: Vec<_> = report.cases.iter().filter(|case| !case.passed()).collect();
    assert!(failing.is_empty(), "failing cases: {failing:#?}");
    assert_eq!(report.passed, report.total);
}

#[test]
fn report_json_has_stable_shape() {
    let report = suite();
    let json = report.to_json().expect("serialize");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
    assert_eq!(parsed["schema_version"], PARITY_REPORT_SCHEMA_VERSION);
    assert_eq!(parsed["total"], ALL_PROGRAMS.len());
    let cases = parsed["cases"].as_array().expect("cases");
    assert_eq!(cases[0]["program"], ProgramSpec::MulThenScale.as_str());
    for case in cases {
        assert!(case["drift"].is_string());
        assert!(case["gradients"]["status"].is_string());
        assert!(case["cache_key"].as_str().is_some_and(|key| key.starts_with("afx-")));
    }

    let back: ParityReport = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, report);
}

#[test]
fn gradient_errors_survive_json_exactly() {
    let check = GradientCheck::Matched {
        max_error: 1.027_956_386_678_852e-9,
    };
    let json = serde_json::to_string(&check).expect("serialize");
    let back: GradientCheck = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, check);
}

#[test]
fn report_round_trips_through_a_file() {
    let report = suite();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("parity.json");
    std::fs::write(&path, report.to_json().expect("serialize")).expect("write");
    let loaded: ParityReport =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
    assert_eq!(loaded.passed, report.passed);
    assert_eq!(loaded.cases.len(), report.cases.len());
}

#[test]
fn gradient_checks_cover_differentiable_programs() {
    let report = suite();
    let by_name = |spec: ProgramSpec| {
        report
            .cases
            .iter()
            .find(|case| case.program == spec.as_str())
            .expect("case present")
    };
    for spec in [ProgramSpec::PureLoss, ProgramSpec::PureElementwise] {
        assert!(matches!(
            by_name(spec).gradients,
            GradientCheck::Matched { .. }
        ));
    }
    assert_eq!(
        by_name(ProgramSpec::SetRoundTrip).gradients,
        GradientCheck::NotApplicable
    );
}

#[test]
fn markdown_summarizes_every_case() {
    let report = suite();
    let md = report.to_markdown();
    assert!(md.starts_with("# Parity report"));
    assert!(md.contains(&format!("{}/{} cases pass.", report.passed, report.total)));
    for spec in ALL_PROGRAMS {
        assert!(md.contains(&format!("| {} |", spec.as_str())), "{}", spec.as_str());
    }
}

#[test]
fn suite_runs_are_logged_per_case() {
    let report = suite();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("conformance.jsonl");
    for case in &report.cases {
        let result = if case.drift == DriftClassification::Pass {
            TestResult::Pass
        } else {
            TestResult::Fail
        };
        let mut log = TestLogV1::unit(
            test_id(module_path!(), "suite_runs_are_logged_per_case"),
            fixture_id_from_json(case).expect("fixture digest"),
            TestCheck::EagerParity,
            result,
        )
        .with_program(case.program.clone());
        log.cache_keys.extend(case.cache_key.clone());
        append_log(&path, &log).expect("append");
    }

    let logs = read_logs(&path).expect("read logs");
    assert_eq!(logs.len(), report.cases.len());
    for (log, case) in logs.iter().zip(&report.cases) {
        assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
        assert_eq!(log.program.as_deref(), Some(case.program.as_str()));
        assert_eq!(log.cache_keys.len(), 1);
        assert_eq!(log.fixture_id.len(), 64);
    }
}
