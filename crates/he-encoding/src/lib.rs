//! Encoding capability consumed by the tensor core.
//!
//! The core never looks inside a container. It only needs four conversions
//! (encode, decode, encrypt, decrypt) and the ability to move one lane of a
//! container into a lane of another container, which [`LaneContainer`]
//! provides without exposing what a lane holds.
//!
//! A lane carries one real value. With complex packing, two consecutive
//! lanes form the real and imaginary parts of one slot, so a container holds
//! up to `2 * slot_count` lanes.

#![forbid(unsafe_code)]

mod keystream;

pub use keystream::KeystreamCodec;

use serde::{Deserialize, Serialize};

/// Fixed-point scale Δ = 2^DEFAULT_SCALE_BITS.
pub const DEFAULT_SCALE_BITS: u32 = 30;

/// Slots per container for the default parameter set (N = 8192, S = N/2).
pub const DEFAULT_SLOT_COUNT: usize = 4096;

/// Largest accepted scale; keeps every encoded lane well inside `i64`.
pub const MAX_SCALE_BITS: u32 = 52;

const ENCODED_MAGNITUDE_LIMIT: f64 = (1_u64 << 62) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingParams {
    /// Number of complex slots per container.
    pub slot_count: usize,
    /// log2 of the fixed-point scale.
    pub scale_bits: u32,
}

impl EncodingParams {
    pub fn new(slot_count: usize, scale_bits: u32) -> Result<Self, EncodingError> {
        if slot_count == 0 {
            return Err(EncodingError::InvalidParams {
                detail: "slot_count must be at least 1".to_owned(),
            });
        }
        if scale_bits == 0 || scale_bits > MAX_SCALE_BITS {
            return Err(EncodingError::InvalidParams {
                detail: format!("scale_bits must be in 1..={MAX_SCALE_BITS}, got {scale_bits}"),
            });
        }
        Ok(Self {
            slot_count,
            scale_bits,
        })
    }

    /// Default scale with a reduced slot count. Small slot counts force
    /// batched tensors to span several containers.
    pub fn small(slot_count: usize) -> Result<Self, EncodingError> {
        Self::new(slot_count, DEFAULT_SCALE_BITS)
    }

    #[must_use]
    pub fn scale(&self) -> f64 {
        (1_u64 << self.scale_bits) as f64
    }

    /// Lane capacity of one container when complex packing is in use.
    #[must_use]
    pub fn max_lanes(&self) -> usize {
        self.slot_count * 2
    }
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            scale_bits: DEFAULT_SCALE_BITS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodingError {
    InvalidParams { detail: String },
    ValueOutOfRange { index: usize, value: f64 },
    TooManyLanes { lanes: usize, capacity: usize },
    ForeignCiphertext { lane: usize },
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParams { detail } => write!(f, "invalid encoding parameters: {detail}"),
            Self::ValueOutOfRange { index, value } => {
                write!(f, "value {value} at lane {index} cannot be encoded")
            }
            Self::TooManyLanes { lanes, capacity } => {
                write!(f, "{lanes} lanes exceed container capacity {capacity}")
            }
            Self::ForeignCiphertext { lane } => {
                write!(f, "ciphertext lane {lane} was not produced under this key")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

/// Container whose lanes can be relocated without being interpreted.
pub trait LaneContainer: Clone + Send + Sync {
    type Lane: Clone + Send + Sync;

    fn lanes(&self) -> &[Self::Lane];

    fn from_lanes(lanes: Vec<Self::Lane>) -> Self;

    fn lane_count(&self) -> usize {
        self.lanes().len()
    }
}

/// Encoded, unencrypted container: one fixed-point integer per lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    lanes: Vec<i64>,
}

impl LaneContainer for Plaintext {
    type Lane = i64;

    fn lanes(&self) -> &[i64] {
        &self.lanes
    }

    fn from_lanes(lanes: Vec<i64>) -> Self {
        Self { lanes }
    }
}

/// One encrypted lane. Its fields are meaningless without the key that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherLane {
    key_id: u64,
    nonce: u64,
    body: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    lanes: Vec<CipherLane>,
}

impl LaneContainer for Ciphertext {
    type Lane = CipherLane;

    fn lanes(&self) -> &[CipherLane] {
        &self.lanes
    }

    fn from_lanes(lanes: Vec<CipherLane>) -> Self {
        Self { lanes }
    }
}

/// Conversions between real values, encoded plaintexts and ciphertexts.
///
/// `decrypt` is reserved for reading results out; structural operators never
/// call it.
pub trait EncodingCapability: Send + Sync {
    fn params(&self) -> &EncodingParams;

    fn encode(&self, values: &[f64]) -> Result<Plaintext, EncodingError>;

    fn decode(&self, plaintext: &Plaintext) -> Vec<f64>;

    fn encrypt(&self, plaintext: &Plaintext) -> Ciphertext;

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Plaintext, EncodingError>;
}

/// Fixed-point encoding shared by capability implementations.
pub fn encode_fixed_point(values: &[f64], params: &EncodingParams) -> Result<Plaintext, EncodingError> {
    if values.len() > params.max_lanes() {
        return Err(EncodingError::TooManyLanes {
            lanes: values.len(),
            capacity: params.max_lanes(),
        });
    }
    let scale = params.scale();
    let lanes = values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let scaled = (value * scale).round();
            if !scaled.is_finite() || scaled.abs() >= ENCODED_MAGNITUDE_LIMIT {
                return Err(EncodingError::ValueOutOfRange {
                    index,
                    value: *value,
                });
            }
            Ok(scaled as i64)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Plaintext { lanes })
}

#[must_use]
pub fn decode_fixed_point(plaintext: &Plaintext, params: &EncodingParams) -> Vec<f64> {
    let scale = params.scale();
    plaintext
        .lanes
        .iter()
        .map(|lane| *lane as f64 / scale)
        .collect()
}
