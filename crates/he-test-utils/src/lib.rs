#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "hetensor.test-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub rust_version: String,
    pub os: String,
    pub cargo_target_dir: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestPhaseTimings {
    pub setup_ms: u64,
    pub execute_ms: u64,
    pub verify_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub env: TestLogEnv,
    pub artifact_refs: Vec<String>,
    pub result: TestResult,
    pub duration_ms: u64,
    pub details: Option<String>,
    pub phase_timings: TestPhaseTimings,
}

impl TestLogV1 {
    #[must_use]
    pub fn unit(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            env: capture_env(),
            artifact_refs: Vec::new(),
            result,
            duration_ms: 0,
            details: None,
            phase_timings: TestPhaseTimings::default(),
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| format!("log dir create failed: {err}"))?;
        }
        let payload = serde_json::to_string_pretty(self)
            .map_err(|err| format!("log serialize failed: {err}"))?;
        fs::write(path, payload).map_err(|err| format!("log write failed: {err}"))
    }
}

/// Run `body`, record a `TestLogV1` for it under `log_root`, and panic with
/// the failure detail if the body reported one.
///
/// The body returns the artifact references it wants attached to the log.
pub fn run_logged<Fixture, F>(
    log_root: &Path,
    test_id: &str,
    fixture: &Fixture,
    body: F,
) where
    Fixture: Serialize,
    F: FnOnce() -> Result<Vec<String>, String>,
{
    let overall_start = Instant::now();
    let setup_start = Instant::now();
    let fixture_id = fixture_id_from_json(fixture).unwrap_or_else(|err| format!("<digest:{err}>"));
    let mut log = TestLogV1::unit(test_id, fixture_id, TestResult::Fail);
    log.phase_timings.setup_ms = duration_ms(setup_start);

    let execute_start = Instant::now();
    let outcome = body();
    log.phase_timings.execute_ms = duration_ms(execute_start);

    let verify_start = Instant::now();
    let failure = match outcome {
        Ok(artifact_refs) => {
            log.result = TestResult::Pass;
            log.artifact_refs = artifact_refs;
            None
        }
        Err(detail) => {
            log.details = Some(detail.clone());
            Some(detail)
        }
    };
    log.phase_timings.verify_ms = duration_ms(verify_start);

    let log_path = test_log_path(log_root, test_id);
    log.artifact_refs.push(log_path.display().to_string());
    log.duration_ms = duration_ms(overall_start);
    // A log that cannot be written must not mask the test verdict.
    let _ = log.write_to(&log_path);

    if let Some(detail) = failure {
        panic!("{detail}");
    }
}

#[must_use]
pub fn test_log_path(log_root: &Path, test_id: &str) -> PathBuf {
    log_root.join(format!("{}.json", test_id.replace("::", "__")))
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        rust_version: rust_version(),
        os: std::env::consts::OS.to_owned(),
        cargo_target_dir: std::env::var("CARGO_TARGET_DIR")
            .unwrap_or_else(|_| "<default>".to_owned()),
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
    if let Ok(raw) = std::env::var("HE_PROPTEST_CASES")
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
    if let Ok(raw) = std::env::var("HE_PROPTEST_SEED")
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

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Element-wise closeness with a combined absolute/relative tolerance.
#[must_use]
pub fn all_close(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (a - e).abs() <= tolerance * (1.0 + e.abs()))
}

fn duration_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn rust_version() -> String {
    let output = Command::new("rustc").arg("--version").output();
    match output {
        Ok(result) if result.status.success() => {
            String::from_utf8_lossy(&result.stdout).trim().to_owned()
        }
        _ => "rustc <unknown>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TEST_LOG_SCHEMA_VERSION, TestLogV1, TestResult, all_close,
        fixture_id_from_json, property_test_case_count, test_id, test_log_path,
    };
    use std::path::Path;

    #[test]
    fn test_fixture_digest_deterministic_json() {
        let fixture = serde_json::json!({
            "shape": [4, 3],
            "axes": [0, 1]
        });
        let digest_a = fixture_id_from_json(&fixture).expect("digest should build");
        let digest_b = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 64);
    }

    #[test]
    fn test_property_case_count_has_default_floor() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn test_log_schema_round_trip_serialization() {
        let log = TestLogV1::unit(
            test_id(module_path!(), "test_log_schema_round_trip_serialization"),
            "fixture-id",
            TestResult::Pass,
        );
        assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
        let encoded = serde_json::to_string(&log).expect("serialize should work");
        let decoded: TestLogV1 = serde_json::from_str(&encoded).expect("deserialize should work");
        assert_eq!(decoded.result, TestResult::Pass);
        assert_eq!(decoded, log);
    }

    #[test]
    fn test_log_path_flattens_module_separators() {
        let path = test_log_path(Path::new("/tmp/logs"), "he_ops::tests::reverse");
        assert_eq!(path, Path::new("/tmp/logs/he_ops__tests__reverse.json"));
    }

    #[test]
    fn all_close_respects_tolerance_and_length() {
        assert!(all_close(&[1.0, 2.0005], &[1.0, 2.0], 1e-3));
        assert!(!all_close(&[1.0, 2.1], &[1.0, 2.0], 1e-3));
        assert!(!all_close(&[1.0], &[1.0, 2.0], 1e-3));
    }
}
