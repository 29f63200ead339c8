use he_interpreters::StepRecord;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One executed equation, as recorded by an executable call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step: usize,
    pub equation_index: usize,
    pub primitive: String,
    pub output_var: u32,
    pub output_shape: Vec<u32>,
    pub tag: String,
    pub complex_packed: bool,
    pub containers_written: usize,
    pub ts_unix_ms: u128,
}

impl LedgerEntry {
    #[must_use]
    pub fn from_step(record: &StepRecord) -> Self {
        Self {
            step: record.step,
            equation_index: record.equation_index,
            primitive: record.primitive.as_str().to_owned(),
            output_var: record.output.0,
            output_shape: record.output_shape.dims.clone(),
            tag: record.output_config.tag().to_owned(),
            complex_packed: record.output_config.complex_packed,
            containers_written: record.containers,
            ts_unix_ms: now_unix_ms(),
        }
    }
}

/// Per-call evidence of what the engine executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLedger {
    program_fingerprint: String,
    entries: Vec<LedgerEntry>,
}

impl ExecutionLedger {
    #[must_use]
    pub fn new(program_fingerprint: impl Into<String>) -> Self {
        Self {
            program_fingerprint: program_fingerprint.into(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, record: &StepRecord) {
        self.entries.push(LedgerEntry::from_step(record));
    }

    #[must_use]
    pub fn program_fingerprint(&self) -> &str {
        &self.program_fingerprint
    }

    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_containers_written(&self) -> usize {
        self.entries.iter().map(|entry| entry.containers_written).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
