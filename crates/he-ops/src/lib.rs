//! Structural operators over tensor handles.
//!
//! Operators only rearrange lanes. They validate shapes first, then drive the
//! index/slot mapper to copy each output lane from its source, without
//! decrypting and without arithmetic. Output flags are a declared function of
//! the input flags ([`propagate_config`]).

#![forbid(unsafe_code)]

mod gather;
mod tensor_ops;

use he_core::{Arity, AxisSet, OpDescriptor, Primitive, Shape, TensorConfig};
use he_encoding::{Ciphertext, EncodingCapability};
use he_tensor::{Layout, LayoutError, PackedValue, PackingScheme, TensorHandle};
use std::borrow::Cow;

use gather::gather_lanes;
use tensor_ops::SourceMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    ArityMismatch {
        primitive: Primitive,
        expected: Arity,
        actual: usize,
    },
    InvalidAxis {
        primitive: Primitive,
        axis: usize,
        rank: usize,
    },
    InvalidPermutation {
        permutation: Vec<usize>,
        rank: usize,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    InvalidBounds {
        axis: usize,
        start: u32,
        limit: u32,
        dim: u32,
    },
    InvalidStride {
        axis: usize,
        stride: u32,
    },
    Layout(LayoutError),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                let expected = match expected {
                    Arity::Exactly(n) => format!("{n}"),
                    Arity::AtLeast(n) => format!("at least {n}"),
                };
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::InvalidAxis {
                primitive,
                axis,
                rank,
            } => write!(
                f,
                "invalid axis {} for {} on rank {}",
                axis,
                primitive.as_str(),
                rank
            ),
            Self::InvalidPermutation { permutation, rank } => write!(
                f,
                "transpose permutation {permutation:?} is not a permutation of 0..{rank}"
            ),
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => write!(
                f,
                "shape mismatch for {}: left={:?} right={:?}",
                primitive.as_str(),
                left.dims,
                right.dims
            ),
            Self::InvalidBounds {
                axis,
                start,
                limit,
                dim,
            } => write!(
                f,
                "slice bounds {start}..{limit} invalid for axis {axis} of length {dim}"
            ),
            Self::InvalidStride { axis, stride } => {
                write!(f, "slice stride {stride} on axis {axis} must be at least 1")
            }
            Self::Layout(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for OpError {}

impl From<LayoutError> for OpError {
    fn from(value: LayoutError) -> Self {
        Self::Layout(value)
    }
}

/// Output shape of `op` applied to operands of `inputs` shapes.
pub fn infer_shape(op: &OpDescriptor, inputs: &[&Shape]) -> Result<Shape, OpError> {
    tensor_ops::check_arity(op, inputs.len())?;
    match op {
        OpDescriptor::Reverse { axes } => tensor_ops::reverse_shape(inputs[0], axes),
        OpDescriptor::Slice {
            start,
            limit,
            strides,
        } => tensor_ops::slice_shape(inputs[0], start, limit, strides),
        OpDescriptor::Concatenate { axis } => tensor_ops::concatenate_shape(inputs, *axis),
        OpDescriptor::Reshape { new_shape } => tensor_ops::reshape_shape(inputs[0], new_shape),
        OpDescriptor::Transpose { permutation } => {
            tensor_ops::transpose_shape(inputs[0], permutation)
        }
    }
}

/// Output flags of `op` given operand flags.
///
/// Every operator keeps operand 0's packing. Concatenation is encrypted when
/// any operand is. A reshape to rank 0 drops batching, since a scalar has no
/// axis to batch over.
pub fn propagate_config(
    op: &OpDescriptor,
    inputs: &[TensorConfig],
) -> Result<TensorConfig, OpError> {
    tensor_ops::check_arity(op, inputs.len())?;
    let first = inputs[0];
    Ok(match op {
        OpDescriptor::Concatenate { .. } => {
            first.with_encrypted(inputs.iter().any(|config| config.encrypted))
        }
        OpDescriptor::Reshape { new_shape } if new_shape.rank() == 0 => TensorConfig {
            packed: false,
            ..first
        },
        _ => first,
    })
}

/// Applies `op` to `inputs`.
///
/// All validation happens before any container is read. `capability` is only
/// used to encrypt plaintext operands of a concatenation that also has
/// encrypted operands; it is never asked to decrypt.
pub fn execute(
    op: &OpDescriptor,
    inputs: &[&TensorHandle],
    capability: &dyn EncodingCapability,
) -> Result<TensorHandle, OpError> {
    execute_with(op, inputs, Some(capability))
}

/// Reverses `input` along every axis in `axes`.
pub fn reverse(input: &TensorHandle, axes: &AxisSet) -> Result<TensorHandle, OpError> {
    execute_with(&OpDescriptor::Reverse { axes: axes.clone() }, &[input], None)
}

pub fn slice(
    input: &TensorHandle,
    start: &[u32],
    limit: &[u32],
    strides: &[u32],
) -> Result<TensorHandle, OpError> {
    let op = OpDescriptor::Slice {
        start: start.to_vec(),
        limit: limit.to_vec(),
        strides: strides.to_vec(),
    };
    execute_with(&op, &[input], None)
}

pub fn reshape(input: &TensorHandle, new_shape: &Shape) -> Result<TensorHandle, OpError> {
    let op = OpDescriptor::Reshape {
        new_shape: new_shape.clone(),
    };
    execute_with(&op, &[input], None)
}

pub fn transpose(input: &TensorHandle, permutation: &[usize]) -> Result<TensorHandle, OpError> {
    let op = OpDescriptor::Transpose {
        permutation: permutation.to_vec(),
    };
    execute_with(&op, &[input], None)
}

pub fn concatenate(
    inputs: &[&TensorHandle],
    axis: usize,
    capability: &dyn EncodingCapability,
) -> Result<TensorHandle, OpError> {
    execute_with(&OpDescriptor::Concatenate { axis }, inputs, Some(capability))
}

fn execute_with(
    op: &OpDescriptor,
    inputs: &[&TensorHandle],
    capability: Option<&dyn EncodingCapability>,
) -> Result<TensorHandle, OpError> {
    let shapes = inputs.iter().map(|handle| handle.shape()).collect::<Vec<_>>();
    let output_shape = infer_shape(op, &shapes)?;
    let configs = inputs
        .iter()
        .map(|handle| handle.config())
        .collect::<Vec<_>>();
    let output_config = propagate_config(op, &configs)?;

    if let OpDescriptor::Reverse { axes } = op
        && axes.is_empty()
    {
        return Ok(inputs[0].clone());
    }

    let layout = Layout::new(
        &output_shape,
        PackingScheme::from_config(output_config, inputs[0].slot_count()),
    )?;
    let map = SourceMap::for_op(op, &shapes, &output_shape);
    log::trace!(
        "{} -> {} {}: gathering {} containers",
        op.primitive().as_str(),
        output_shape,
        output_config,
        layout.container_count()
    );

    let value = if output_config.encrypted {
        let storage = inputs
            .iter()
            .map(|handle| ciphertext_storage(handle, capability))
            .collect::<Result<Vec<_>, _>>()?;
        let operands = inputs
            .iter()
            .zip(&storage)
            .map(|(handle, containers)| (handle.layout(), &**containers))
            .collect::<Vec<_>>();
        PackedValue::from_ciphertexts(
            output_config.packed,
            gather_lanes(&layout, &operands, &map)?,
        )
    } else {
        let operands = inputs
            .iter()
            .map(|handle| {
                handle
                    .plaintexts()
                    .map(|containers| (handle.layout(), containers))
                    .ok_or_else(|| LayoutError::PackingSchemeViolation {
                        detail: format!("{} operand for a plaintext result", handle.tag()),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        PackedValue::from_plaintexts(
            output_config.packed,
            gather_lanes(&layout, &operands, &map)?,
        )
    };

    Ok(TensorHandle::from_parts(layout, output_config, value)?)
}

fn ciphertext_storage<'a>(
    handle: &'a TensorHandle,
    capability: Option<&dyn EncodingCapability>,
) -> Result<Cow<'a, [Ciphertext]>, LayoutError> {
    if let Some(containers) = handle.value().ciphertexts() {
        return Ok(Cow::Borrowed(containers));
    }
    let capability = capability.ok_or_else(|| LayoutError::PackingSchemeViolation {
        detail: format!("{} operand needs encryption", handle.tag()),
    })?;
    Ok(Cow::Owned(handle.value().to_ciphertexts(capability)))
}

#[cfg(test)]
mod tests {
    use super::{OpError, concatenate, execute, propagate_config, reshape, reverse, slice, transpose};
    use he_core::{AxisSet, OpDescriptor, Primitive, Shape, TensorConfig};
    use he_encoding::{EncodingParams, KeystreamCodec};
    use he_tensor::TensorHandle;

    fn codec(slot_count: usize) -> KeystreamCodec {
        KeystreamCodec::from_seed(EncodingParams::small(slot_count).expect("params"), 23)
    }

    fn iota(n: usize) -> Vec<f64> {
        (0..n).map(|v| v as f64).collect()
    }

    fn handle(codec: &KeystreamCodec, dims: &[u32], config: TensorConfig) -> TensorHandle {
        let shape = Shape::new(dims);
        let count = shape.element_count().expect("small shape") as usize;
        TensorHandle::encode(&shape, config, &iota(count), codec).expect("encode")
    }

    fn assert_values(codec: &KeystreamCodec, handle: &TensorHandle, expected: &[f64]) {
        let actual = handle.readout(codec).expect("readout");
        assert_eq!(actual.len(), expected.len(), "{handle}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{handle}: {actual:?} vs {expected:?}");
        }
    }

    fn supported_configs(rank: usize) -> impl Iterator<Item = TensorConfig> {
        TensorConfig::all()
            .into_iter()
            .filter(move |config| rank > 0 || !config.packed)
    }

    #[test]
    fn reversal_scenarios_hold_for_every_config() {
        let cases: [(&[u32], &[usize], Vec<f64>); 6] = [
            (&[], &[], vec![0.0]),
            (&[8], &[0], vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]),
            (
                &[4, 3],
                &[0],
                vec![9.0, 10.0, 11.0, 6.0, 7.0, 8.0, 3.0, 4.0, 5.0, 0.0, 1.0, 2.0],
            ),
            (
                &[4, 3],
                &[1],
                vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0, 8.0, 7.0, 6.0, 11.0, 10.0, 9.0],
            ),
            (
                &[4, 3],
                &[0, 1],
                vec![11.0, 10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0],
            ),
            (&[2, 4, 3], &[0, 1, 2], (0..24).rev().map(|v| v as f64).collect()),
        ];
        for slot_count in [1, 3, 4096] {
            let codec = codec(slot_count);
            for (dims, axes, expected) in &cases {
                for config in supported_configs(dims.len()) {
                    let input = handle(&codec, dims, config);
                    let axes = axes.iter().copied().collect::<AxisSet>();
                    let output = reverse(&input, &axes).expect("reverse");
                    assert_eq!(output.shape(), input.shape());
                    assert_eq!(output.config(), config);
                    assert_values(&codec, &output, expected);
                }
            }
        }
    }

    #[test]
    fn empty_axis_set_returns_input_unchanged() {
        let codec = codec(4);
        let input = handle(&codec, &[], TensorConfig::encrypted());
        let output = reverse(&input, &AxisSet::empty()).expect("reverse");
        assert_eq!(output, input);
    }

    #[test]
    fn reversing_an_empty_axis_yields_an_empty_tensor() {
        let codec = codec(2);
        let axes = AxisSet::from([0, 1]);
        for config in supported_configs(2) {
            let input = handle(&codec, &[3, 0], config);
            let output = reverse(&input, &axes).expect("reverse");
            assert_eq!(output.shape(), &Shape::new([3, 0]));
            assert_eq!(output.config(), config);
            assert_eq!(output.container_count(), 0);
            assert_values(&codec, &output, &[]);
        }

        let batched = TensorConfig::from_flags(true, true, false);
        let wide = Shape::new([0, u32::MAX, u32::MAX]);
        let input = TensorHandle::encode(&wide, batched, &[], &codec).expect("encode");
        let output = reverse(&input, &axes).expect("reverse");
        assert_eq!(output.container_count(), 0);
    }

    #[test]
    fn invalid_axis_fails_before_touching_containers() {
        let codec = codec(4);
        let input = handle(&codec, &[4, 3], TensorConfig::encrypted());
        let err = reverse(&input, &AxisSet::from([2])).expect_err("axis 2 of rank 2");
        assert_eq!(
            err,
            OpError::InvalidAxis {
                primitive: Primitive::Reverse,
                axis: 2,
                rank: 2
            }
        );
        let scalar = handle(&codec, &[], TensorConfig::plaintext());
        assert!(matches!(
            reverse(&scalar, &AxisSet::from([0])),
            Err(OpError::InvalidAxis { axis: 0, rank: 0, .. })
        ));
    }

    #[test]
    fn batched_reversal_crosses_container_boundaries() {
        let codec = codec(3);
        let config = TensorConfig::from_flags(true, true, false);
        let input = handle(&codec, &[7, 2], config);
        assert_eq!(input.container_count(), 6);
        let output = reverse(&input, &AxisSet::from([0])).expect("reverse");
        assert_eq!(output.lane_counts(), input.lane_counts());
        assert_values(
            &codec,
            &output,
            &[12.0, 13.0, 10.0, 11.0, 8.0, 9.0, 6.0, 7.0, 4.0, 5.0, 2.0, 3.0, 0.0, 1.0],
        );
    }

    #[test]
    fn slice_with_stride_under_batching() {
        let codec = codec(2);
        for config in supported_configs(2) {
            let input = handle(&codec, &[5, 3], config);
            let output = slice(&input, &[1, 0], &[5, 3], &[2, 2]).expect("slice");
            assert_eq!(output.shape(), &Shape::new([2, 2]));
            assert_values(&codec, &output, &[3.0, 5.0, 9.0, 11.0]);
        }
    }

    #[test]
    fn reshape_and_transpose_preserve_values() {
        let codec = codec(2);
        for config in supported_configs(2) {
            let input = handle(&codec, &[2, 3], config);
            let flat = reshape(&input, &Shape::vector(6)).expect("reshape");
            assert_values(&codec, &flat, &iota(6));

            let swapped = transpose(&input, &[1, 0]).expect("transpose");
            assert_eq!(swapped.shape(), &Shape::new([3, 2]));
            assert_values(&codec, &swapped, &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        }
    }

    #[test]
    fn reshape_to_scalar_drops_batching() {
        let codec = codec(2);
        let input = handle(&codec, &[1, 1], TensorConfig::from_flags(true, true, true));
        let scalar = reshape(&input, &Shape::scalar()).expect("reshape");
        assert!(!scalar.config().packed);
        assert!(scalar.config().complex_packed);
        assert_values(&codec, &scalar, &[0.0]);
    }

    #[test]
    fn mixed_concatenation_encrypts_result() {
        let codec = codec(2);
        let left = handle(&codec, &[2, 2], TensorConfig::from_flags(false, true, false));
        let right = handle(&codec, &[1, 2], TensorConfig::encrypted());
        let out = concatenate(&[&left, &right], 0, &codec).expect("concatenate");
        assert!(out.is_encrypted());
        assert!(out.config().packed);
        assert_eq!(out.shape(), &Shape::new([3, 2]));
        assert_values(&codec, &out, &[0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);

        let along_columns = execute(
            &OpDescriptor::Concatenate { axis: 1 },
            &[&left, &left],
            &codec,
        )
        .expect("concatenate");
        assert!(!along_columns.is_encrypted());
        assert_values(
            &codec,
            &along_columns,
            &[0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0],
        );
    }

    #[test]
    fn concatenation_shape_errors() {
        let codec = codec(2);
        let a = handle(&codec, &[2, 2], TensorConfig::plaintext());
        let b = handle(&codec, &[2, 3], TensorConfig::plaintext());
        assert!(matches!(
            concatenate(&[&a, &b], 0, &codec),
            Err(OpError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            concatenate(&[&a, &b], 2, &codec),
            Err(OpError::InvalidAxis { axis: 2, rank: 2, .. })
        ));
        assert!(matches!(
            concatenate(&[], 0, &codec),
            Err(OpError::ArityMismatch { actual: 0, .. })
        ));
    }

    #[test]
    fn reshape_requires_matching_element_count() {
        let codec = codec(2);
        let input = handle(&codec, &[2, 3], TensorConfig::plaintext());
        assert!(matches!(
            reshape(&input, &Shape::new([4, 2])),
            Err(OpError::ShapeMismatch {
                primitive: Primitive::Reshape,
                ..
            })
        ));
    }

    #[test]
    fn propagation_rules() {
        let plain = TensorConfig::plaintext();
        let cipher = TensorConfig::encrypted();
        assert_eq!(
            propagate_config(&OpDescriptor::reverse([0]), &[cipher]),
            Ok(cipher)
        );
        assert_eq!(
            propagate_config(&OpDescriptor::Concatenate { axis: 0 }, &[plain, cipher]),
            Ok(cipher)
        );
        assert!(matches!(
            propagate_config(&OpDescriptor::reverse([0]), &[plain, plain]),
            Err(OpError::ArityMismatch { .. })
        ));
    }
}
