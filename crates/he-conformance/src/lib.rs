#![forbid(unsafe_code)]

//! Fixture-driven conformance harness for the structural operators.
//!
//! Every reversal fixture runs through the backend facade under each
//! encryption, complex-packing and batching combination, at several slot
//! counts, and the results are folded into a [`ParityReport`].

use he_core::{AxisSet, ConfigRegistry, OpDescriptor, Shape, TensorConfig, unary_program};
use he_encoding::EncodingParams;
use he_runtime::{Backend, CpuBackend};
use he_test_utils::all_close;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const PARITY_REPORT_SCHEMA_VERSION: &str = "hetensor.reverse-parity-report.v1";

/// Name the harness registers its single program parameter under.
const INPUT_PARAMETER: &str = "arg";

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    /// Slot counts each case runs at. Small counts force axis-0 groups to
    /// straddle container boundaries.
    pub slot_counts: Vec<usize>,
    pub tolerance: f64,
    pub key_seed: u64,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            slot_counts: vec![EncodingParams::default().slot_count, 4, 3, 1],
            tolerance: 1e-3,
            key_seed: 0x5eed,
        }
    }

    #[must_use]
    pub fn reverse_bundle_path(&self) -> PathBuf {
        self.fixture_root.join("reverse_cases.json")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub slot_counts: Vec<usize>,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    HarnessReport {
        suite: "smoke",
        fixture_count: collect_json_fixtures(&config.fixture_root).len(),
        slot_counts: config.slot_counts.clone(),
    }
}

fn collect_json_fixtures(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut paths = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseFixtureCase {
    pub case_id: String,
    pub shape: Vec<u32>,
    pub axes: Vec<usize>,
    pub input: Vec<f64>,
    pub expected: Vec<f64>,
}

impl ReverseFixtureCase {
    #[must_use]
    pub fn shape(&self) -> Shape {
        Shape::new(self.shape.clone())
    }

    #[must_use]
    pub fn axis_set(&self) -> AxisSet {
        self.axes.iter().copied().collect()
    }

    /// Configurations this case runs under: every flag combination, minus
    /// batched packing for scalars.
    #[must_use]
    pub fn configurations(&self) -> Vec<TensorConfig> {
        TensorConfig::all()
            .into_iter()
            .filter(|config| !(config.packed && self.shape.is_empty()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseFixtureBundle {
    pub schema_version: String,
    pub generated_by: String,
    pub cases: Vec<ReverseFixtureCase>,
}

pub fn read_reverse_bundle(path: &Path) -> Result<ReverseFixtureBundle, std::io::Error> {
    let raw = fs::read_to_string(path)?;
    let parsed =
        serde_json::from_str::<ReverseFixtureBundle>(&raw).map_err(std::io::Error::other)?;
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseCaseReport {
    pub case_id: String,
    pub slot_count: usize,
    pub config: TensorConfig,
    pub matched: bool,
    pub expected: Vec<f64>,
    pub actual: Option<Vec<f64>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityReport {
    pub schema_version: String,
    pub total_cases: usize,
    pub matched_cases: usize,
    pub mismatched_cases: usize,
    pub reports: Vec<ReverseCaseReport>,
}

impl ParityReport {
    #[must_use]
    pub fn from_reports(reports: Vec<ReverseCaseReport>) -> Self {
        let matched_cases = reports.iter().filter(|report| report.matched).count();
        Self {
            schema_version: PARITY_REPORT_SCHEMA_VERSION.to_owned(),
            total_cases: reports.len(),
            matched_cases,
            mismatched_cases: reports.len().saturating_sub(matched_cases),
            reports,
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatched_cases == 0
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &ReverseCaseReport> + '_ {
        self.reports.iter().filter(|report| !report.matched)
    }
}

/// Runs every case of `bundle` at every configured slot count under every
/// configuration the case admits.
#[must_use]
pub fn run_reverse_bundle(config: &HarnessConfig, bundle: &ReverseFixtureBundle) -> ParityReport {
    let mut reports = Vec::new();
    for &slot_count in &config.slot_counts {
        let mut backend = match EncodingParams::small(slot_count) {
            Ok(params) => CpuBackend::with_seed(params, config.key_seed),
            Err(err) => {
                log::warn!("skipping slot count {slot_count}: {err}");
                for case in &bundle.cases {
                    for tensor_config in case.configurations() {
                        reports.push(failed_report(
                            case,
                            slot_count,
                            tensor_config,
                            err.to_string(),
                        ));
                    }
                }
                continue;
            }
        };
        for case in &bundle.cases {
            for tensor_config in case.configurations() {
                reports.push(run_reverse_case(
                    &mut backend,
                    case,
                    tensor_config,
                    config.tolerance,
                ));
            }
        }
    }

    let report = ParityReport::from_reports(reports);
    log::info!(
        "reverse parity: {}/{} matched",
        report.matched_cases,
        report.total_cases
    );
    report
}

/// One case under one configuration, following the harness flow: register
/// the config, create and write the input, compile, call with a validated
/// output handle, read back.
pub fn run_reverse_case(
    backend: &mut CpuBackend,
    case: &ReverseFixtureCase,
    tensor_config: TensorConfig,
    tolerance: f64,
) -> ReverseCaseReport {
    let slot_count = backend.capability().params().slot_count;
    match execute_reverse_case(backend, case, tensor_config) {
        Ok(actual) => {
            let matched = all_close(&actual, &case.expected, tolerance);
            if !matched {
                log::debug!(
                    "{} mismatched at slot count {slot_count} under {tensor_config}",
                    case.case_id
                );
            }
            ReverseCaseReport {
                case_id: case.case_id.clone(),
                slot_count,
                config: tensor_config,
                matched,
                expected: case.expected.clone(),
                actual: Some(actual),
                error: None,
            }
        }
        Err(err) => failed_report(case, slot_count, tensor_config, err),
    }
}

fn execute_reverse_case(
    backend: &mut CpuBackend,
    case: &ReverseFixtureCase,
    tensor_config: TensorConfig,
) -> Result<Vec<f64>, String> {
    backend.set_config(ConfigRegistry::new().with_entry(INPUT_PARAMETER, tensor_config));
    let shape = case.shape();

    let mut input = backend
        .create_parameter(INPUT_PARAMETER, &shape)
        .map_err(|err| err.to_string())?;
    backend
        .write(&mut input, &case.input)
        .map_err(|err| err.to_string())?;

    let program = unary_program(
        INPUT_PARAMETER,
        shape.clone(),
        OpDescriptor::reverse(case.axis_set()),
    );
    let mut executable = backend.compile(&program).map_err(|err| err.to_string())?;

    let mut outputs = vec![
        backend
            .create_tensor(&shape, tensor_config)
            .map_err(|err| err.to_string())?,
    ];
    executable
        .call_with_validate(&mut outputs, std::slice::from_ref(&input))
        .map_err(|err| err.to_string())?;

    if outputs[0].is_encrypted() != tensor_config.encrypted {
        return Err(format!(
            "output is {} but the config asked for {tensor_config}",
            outputs[0].tag()
        ));
    }
    backend.read(&outputs[0]).map_err(|err| err.to_string())
}

fn failed_report(
    case: &ReverseFixtureCase,
    slot_count: usize,
    tensor_config: TensorConfig,
    error: String,
) -> ReverseCaseReport {
    ReverseCaseReport {
        case_id: case.case_id.clone(),
        slot_count,
        config: tensor_config,
        matched: false,
        expected: case.expected.clone(),
        actual: None,
        error: Some(error),
    }
}

pub fn emit_parity_json(report: &ParityReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

#[must_use]
pub fn emit_parity_markdown(report: &ParityReport) -> String {
    let mut out = String::new();
    out.push_str("# Reverse Parity Report\n\n");
    out.push_str("| Metric | Value |\n");
    out.push_str("|---|---|\n");
    out.push_str(&format!("| Schema | `{}` |\n", report.schema_version));
    out.push_str(&format!("| Total Cases | {} |\n", report.total_cases));
    out.push_str(&format!("| Matched Cases | {} |\n", report.matched_cases));
    out.push_str(&format!(
        "| Mismatched Cases | {} |\n\n",
        report.mismatched_cases
    ));

    out.push_str("| Case ID | Slots | Config | Matched | Error |\n");
    out.push_str("|---|---|---|---|---|\n");
    for case in &report.reports {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            case.case_id,
            case.slot_count,
            case.config,
            case.matched,
            case.error.as_deref().unwrap_or("")
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{HarnessConfig, ParityReport, ReverseCaseReport, ReverseFixtureCase};
    use he_core::TensorConfig;

    fn case(shape: Vec<u32>) -> ReverseFixtureCase {
        ReverseFixtureCase {
            case_id: "c".to_owned(),
            shape,
            axes: Vec::new(),
            input: vec![6.0],
            expected: vec![6.0],
        }
    }

    #[test]
    fn scalar_cases_skip_batched_configurations() {
        assert_eq!(case(Vec::new()).configurations().len(), 4);
        assert!(
            case(Vec::new())
                .configurations()
                .iter()
                .all(|config| !config.packed)
        );
        assert_eq!(case(vec![8]).configurations().len(), 8);
    }

    #[test]
    fn parity_report_counts() {
        let report = |matched| ReverseCaseReport {
            case_id: "c".to_owned(),
            slot_count: 4,
            config: TensorConfig::encrypted(),
            matched,
            expected: vec![1.0],
            actual: Some(vec![1.0]),
            error: None,
        };
        let parity = ParityReport::from_reports(vec![report(true), report(false), report(true)]);
        assert_eq!(parity.total_cases, 3);
        assert_eq!(parity.matched_cases, 2);
        assert_eq!(parity.mismatched_cases, 1);
        assert!(!parity.is_clean());
        assert_eq!(parity.mismatches().count(), 1);
    }

    #[test]
    fn default_paths_point_at_bundled_fixtures() {
        let config = HarnessConfig::default_paths();
        assert!(config.reverse_bundle_path().ends_with("fixtures/reverse_cases.json"));
        assert!(config.slot_counts.contains(&1));
    }
}
