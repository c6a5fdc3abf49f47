#![forbid(unsafe_code)]

use af_core::CompatibilityMode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const TEST_LOG_SCHEMA_VERSION: &str = "aotflow.test-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skip,
}

/// Which comparison a test made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCheck {
    /// Compiled outputs, input mutations and gradients against eager.
    EagerParity,
    /// Structure of the compiled graphs.
    GraphShape,
    /// An expected compile-time or call-time error.
    ExpectedError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub rust_version: String,
    pub os: String,
    pub cargo_target_dir: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub program: Option<String>,
    pub check: TestCheck,
    pub seed: Option<u64>,
    pub mode: CompatibilityMode,
    pub env: TestLogEnv,
    /// Cache keys of the artifacts the test compiled.
    pub cache_keys: Vec<String>,
    pub result: TestResult,
    pub duration_ms: u64,
    pub details: Option<String>,
}

impl TestLogV1 {
    #[must_use]
    pub fn unit(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        check: TestCheck,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            program: None,
            check,
            seed: capture_proptest_seed(),
            mode: CompatibilityMode::Strict,
            env: capture_env(),
            cache_keys: Vec::new(),
            result,
            duration_ms: 0,
            details: None,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Append one log as a JSON line, creating the file if needed.
pub fn append_log(path: &Path, log: &TestLogV1) -> std::io::Result<()> {
    let line = serde_json::to_string(log).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

pub fn read_logs(path: &Path) -> std::io::Result<Vec<TestLogV1>> {
    let file = std::fs::File::open(path)?;
    BufReader::new(file)
        .lines()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|line| serde_json::from_str(&line?).map_err(std::io::Error::other))
        .collect()
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        rust_version: rust_version(),
        os: std::env::consts::OS.to_owned(),
        cargo_target_dir: std::env::var("CARGO_TARGET_DIR").unwrap_or_else(|_| "target".to_owned()),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("AF_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        512
    } else {
        128
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    if let Ok(raw) = std::env::var("AF_PROPTEST_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    if let Ok(raw) = std::env::var("PROPTEST_RNG_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    None
}

/// Route pipeline logs to the test harness's captured output. Filtered by
/// `RUST_LOG`, `warn` when unset. Safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = fmt::layer().compact().with_test_writer().with_filter(filter);
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Deterministic, non-degenerate fill values: no zeros, mixed signs.
#[must_use]
pub fn fill_values(len: usize, seed: u64) -> Vec<f64> {
    (0..len as u64)
        .map(|i| {
            let k = (i.wrapping_mul(7).wrapping_add(seed.wrapping_mul(13))) % 11;
            let magnitude = (k as f64 + 1.0) * 0.25;
            if (i + seed) % 3 == 2 { -magnitude } else { magnitude }
        })
        .collect()
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn rust_version() -> String {
    Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map_or_else(
            || "rustc <unknown>".to_owned(),
            |out| String::from_utf8_lossy(&out.stdout).trim().to_owned(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_digest_is_deterministic() {
        let fixture = serde_json::json!({
            "program": "mul_then_scale",
            "inputs": [[1.0]]
        });
        let digest_a = fixture_id_from_json(&fixture).expect("digest should build");
        let digest_b = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 64);
    }

    #[test]
    fn property_case_count_has_default_floor() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn log_round_trips_through_a_jsonl_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs.jsonl");
        let first = TestLogV1::unit(
            test_id(module_path!(), "log_round_trips_through_a_jsonl_file"),
            "fixture-a",
            TestCheck::EagerParity,
            TestResult::Pass,
        )
        .with_program("mul_then_scale");
        let second = TestLogV1::unit("t2", "fixture-b", TestCheck::ExpectedError, TestResult::Fail)
            .with_details("guard violation");
        append_log(&path, &first).expect("append");
        append_log(&path, &second).expect("append");

        let logs = read_logs(&path).expect("read");
        assert_eq!(logs, vec![first, second]);
        assert_eq!(logs[0].schema_version, TEST_LOG_SCHEMA_VERSION);
    }

    #[test]
    fn fill_values_avoid_zero_and_repeat_per_seed() {
        let values = fill_values(32, 5);
        assert!(values.iter().all(|v| *v != 0.0));
        assert!(values.iter().any(|v| *v < 0.0));
        assert_eq!(values, fill_values(32, 5));
        assert_ne!(values, fill_values(32, 6));
    }
}
