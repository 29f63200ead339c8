//! Tensor handles over packed, possibly encrypted storage.

#![forbid(unsafe_code)]

mod handle;
mod layout;
mod packed;

pub use handle::TensorHandle;
pub use layout::{Layout, LayoutError, PackingScheme, PhysicalAddress};
pub use packed::PackedValue;

use he_core::ConfigError;
use he_encoding::EncodingError;

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    Layout(LayoutError),
    Encoding(EncodingError),
    Config(ConfigError),
    ValueCount { expected: usize, actual: usize },
}

impl std::fmt::Display for TensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout(err) => write!(f, "{err}"),
            Self::Encoding(err) => write!(f, "encoding failed: {err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::ValueCount { expected, actual } => {
                write!(f, "expected {expected} values, got {actual}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

impl From<LayoutError> for TensorError {
    fn from(value: LayoutError) -> Self {
        Self::Layout(value)
    }
}

impl From<EncodingError> for TensorError {
    fn from(value: EncodingError) -> Self {
        Self::Encoding(value)
    }
}

impl From<ConfigError> for TensorError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}
