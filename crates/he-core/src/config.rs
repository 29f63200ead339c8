//! Per-parameter encryption and packing policy.
//!
//! The registry is built once, before compilation, and handed by reference to
//! every call that binds parameters. Nothing mutates it during execution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Encryption/packing flags for one tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorConfig {
    pub encrypted: bool,
    pub packed: bool,
    pub complex_packed: bool,
}

impl TensorConfig {
    #[must_use]
    pub fn from_flags(encrypted: bool, packed: bool, complex_packed: bool) -> Self {
        Self {
            encrypted,
            packed,
            complex_packed,
        }
    }

    #[must_use]
    pub fn plaintext() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn encrypted() -> Self {
        Self {
            encrypted: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_encrypted(self, encrypted: bool) -> Self {
        Self { encrypted, ..self }
    }

    /// Name of the packed-value variant this config selects.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match (self.encrypted, self.packed) {
            (false, false) => "plain_unpacked",
            (false, true) => "plain_batched",
            (true, false) => "cipher_unpacked",
            (true, true) => "cipher_batched",
        }
    }

    /// Every flag combination, plaintext first.
    #[must_use]
    pub fn all() -> [Self; 8] {
        let mut out = [Self::default(); 8];
        for (idx, slot) in out.iter_mut().enumerate() {
            *slot = Self::from_flags(idx & 4 != 0, idx & 1 != 0, idx & 2 != 0);
        }
        out
    }
}

impl std::fmt::Display for TensorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            self.tag(),
            if self.complex_packed { "+complex" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Unresolved { name: String },
    Malformed { detail: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved { name } => {
                write!(f, "no encryption/packing configuration for parameter '{name}'")
            }
            Self::Malformed { detail } => write!(f, "malformed configuration: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigRegistry {
    entries: BTreeMap<String, TensorConfig>,
}

impl ConfigRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, config: TensorConfig) -> Self {
        self.entries.insert(name.into(), config);
        self
    }

    /// Parses `{"<name>": {"encrypted": .., "packed": .., "complex_packed": ..}}`.
    /// Every flag is required; unknown keys are rejected.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::Malformed {
            detail: err.to_string(),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<TensorConfig, ConfigError> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::Unresolved {
                name: name.to_owned(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorConfig)> + '_ {
        self.entries.iter().map(|(name, config)| (name.as_str(), *config))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigRegistry, TensorConfig};

    #[test]
    fn resolve_returns_registered_entry() {
        let registry =
            ConfigRegistry::new().with_entry("a", TensorConfig::from_flags(true, false, true));
        let config = registry.resolve("a").expect("entry should resolve");
        assert!(config.encrypted);
        assert!(config.complex_packed);
        assert!(!config.packed);
        assert_eq!(config.tag(), "cipher_unpacked");
    }

    #[test]
    fn missing_entry_is_unresolved() {
        let registry = ConfigRegistry::new();
        assert_eq!(
            registry.resolve("b"),
            Err(ConfigError::Unresolved {
                name: "b".to_owned()
            })
        );
    }

    #[test]
    fn json_document_parses_all_flags() {
        let registry = ConfigRegistry::from_json_str(
            r#"{"a": {"encrypted": true, "packed": true, "complex_packed": false}}"#,
        )
        .expect("document should parse");
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.resolve("a"),
            Ok(TensorConfig::from_flags(true, true, false))
        );
    }

    #[test]
    fn json_document_with_missing_flag_is_malformed() {
        let err = ConfigRegistry::from_json_str(r#"{"a": {"encrypted": true}}"#)
            .expect_err("missing flags must fail");
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn json_document_with_unknown_flag_is_malformed() {
        let err = ConfigRegistry::from_json_str(
            r#"{"a": {"encrypted": true, "packed": false, "complex_packed": false, "noise": 3}}"#,
        )
        .expect_err("unknown flags must fail");
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn all_covers_each_flag_combination_once() {
        let all = TensorConfig::all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(all[0], TensorConfig::plaintext());
    }
}
