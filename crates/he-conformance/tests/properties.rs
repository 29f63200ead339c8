//! Algebraic properties of reversal over random shapes, axis subsets,
//! configurations and slot counts.

use he_core::proptest_strategies::{arb_shape_and_axes, arb_tensor_config};
use he_core::{AxisSet, Shape, TensorConfig, flat_index, row_major_strides, unflatten_index};
use he_encoding::{EncodingParams, KeystreamCodec};
use he_ops::reverse;
use he_tensor::TensorHandle;
use he_test_utils::{all_close, property_test_case_count, run_logged, test_id};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestRunner};
use std::path::PathBuf;

const TOLERANCE: f64 = 1e-3;

fn log_root() -> PathBuf {
    PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("he-conformance-logs")
}

fn runner() -> TestRunner {
    TestRunner::new(ProptestConfig::with_cases(property_test_case_count()))
}

fn codec(slot_count: usize) -> KeystreamCodec {
    KeystreamCodec::from_seed(
        EncodingParams::small(slot_count).expect("slot count is positive"),
        slot_count as u64,
    )
}

/// Scalars cannot be batched; everything else keeps the drawn config.
fn admissible(shape: &Shape, config: TensorConfig) -> TensorConfig {
    if shape.rank() == 0 {
        TensorConfig {
            packed: false,
            ..config
        }
    } else {
        config
    }
}

fn iota(shape: &Shape) -> Vec<f64> {
    let count = shape.element_count().unwrap_or(0) as usize;
    (0..count).map(|value| value as f64).collect()
}

fn reference_reverse(shape: &Shape, axes: &AxisSet, values: &[f64]) -> Vec<f64> {
    let dims = shape.dims_usize();
    let strides = row_major_strides(&dims);
    (0..values.len())
        .map(|flat| {
            let mut coord = unflatten_index(flat, &dims);
            for axis in axes.iter() {
                coord[axis] = dims[axis] - 1 - coord[axis];
            }
            values[flat_index(&coord, &strides)]
        })
        .collect()
}

fn case_strategy() -> impl Strategy<Value = ((Shape, AxisSet), TensorConfig, usize)> {
    (arb_shape_and_axes(4, 4), arb_tensor_config(), 1_usize..=5)
}

#[test]
fn prop_reverse_matches_reference_and_preserves_metadata() {
    let fixture = serde_json::json!({ "max_rank": 4, "max_dim": 4, "slot_counts": "1..=5" });
    run_logged(
        &log_root(),
        &test_id(module_path!(), "prop_reverse_matches_reference_and_preserves_metadata"),
        &fixture,
        || {
            runner()
                .run(&case_strategy(), |((shape, axes), config, slot_count)| {
                    let codec = codec(slot_count);
                    let config = admissible(&shape, config);
                    let values = iota(&shape);
                    let input = TensorHandle::encode(&shape, config, &values, &codec)
                        .map_err(|err| TestCaseError::fail(err.to_string()))?;

                    let output =
                        reverse(&input, &axes).map_err(|err| TestCaseError::fail(err.to_string()))?;
                    prop_assert_eq!(output.shape(), input.shape());
                    prop_assert_eq!(output.config(), input.config());
                    prop_assert_eq!(output.slot_count(), input.slot_count());
                    prop_assert_eq!(output.lane_counts(), input.lane_counts());

                    let read = output
                        .readout(&codec)
                        .map_err(|err| TestCaseError::fail(err.to_string()))?;
                    prop_assert!(all_close(
                        &read,
                        &reference_reverse(&shape, &axes, &values),
                        TOLERANCE
                    ));
                    Ok(())
                })
                .map_err(|err| err.to_string())?;
            Ok(Vec::new())
        },
    );
}

#[test]
fn prop_reverse_is_an_involution() {
    runner()
        .run(&case_strategy(), |((shape, axes), config, slot_count)| {
            let codec = codec(slot_count);
            let config = admissible(&shape, config);
            let values = iota(&shape);
            let input = TensorHandle::encode(&shape, config, &values, &codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let twice = reverse(&input, &axes)
                .and_then(|once| reverse(&once, &axes))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let read = twice
                .readout(&codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert!(all_close(&read, &values, TOLERANCE));
            Ok(())
        })
        .expect("reverse twice restores the input");
}

#[test]
fn prop_disjoint_reversals_compose() {
    let strategy = case_strategy().prop_flat_map(|((shape, axes), config, slot_count)| {
        let picks = prop::collection::vec(any::<bool>(), axes.len());
        (Just((shape, axes)), Just(config), Just(slot_count), picks)
    });
    runner()
        .run(&strategy, |((shape, axes), config, slot_count, picks)| {
            let first = axes
                .iter()
                .zip(&picks)
                .filter(|(_, pick)| **pick)
                .map(|(axis, _)| axis)
                .collect::<AxisSet>();
            let second = axes
                .iter()
                .zip(&picks)
                .filter(|(_, pick)| !**pick)
                .map(|(axis, _)| axis)
                .collect::<AxisSet>();
            prop_assert!(first.is_disjoint(&second));

            let codec = codec(slot_count);
            let config = admissible(&shape, config);
            let values = iota(&shape);
            let input = TensorHandle::encode(&shape, config, &values, &codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;

            let composed = reverse(&input, &first)
                .and_then(|partial| reverse(&partial, &second))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let direct = reverse(&input, &first.union(&second))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;

            let composed = composed
                .readout(&codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let direct = direct
                .readout(&codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert!(all_close(&composed, &direct, TOLERANCE));
            Ok(())
        })
        .expect("disjoint reversals compose into their union");
}

#[test]
fn prop_empty_axis_set_is_a_no_op() {
    runner()
        .run(&case_strategy(), |((shape, _), config, slot_count)| {
            let codec = codec(slot_count);
            let config = admissible(&shape, config);
            let input = TensorHandle::encode(&shape, config, &iota(&shape), &codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let output = reverse(&input, &AxisSet::empty())
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(output.value(), input.value());
            Ok(())
        })
        .expect("empty reversal leaves containers untouched");
}

#[test]
fn prop_encrypted_inputs_stay_opaque() {
    runner()
        .run(&case_strategy(), |((shape, axes), config, slot_count)| {
            let codec = codec(slot_count);
            let config = admissible(&shape, config.with_encrypted(true));
            let values = iota(&shape);
            let cipher_input = TensorHandle::encode(&shape, config, &values, &codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let plain_input =
                TensorHandle::encode(&shape, config.with_encrypted(false), &values, &codec)
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;

            let cipher_output = reverse(&cipher_input, &axes)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert!(cipher_output.is_encrypted());
            prop_assert!(cipher_output.plaintexts().is_none());
            prop_assert!(cipher_output.value().ciphertexts().is_some());

            let plain_output = reverse(&plain_input, &axes)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let from_cipher = cipher_output
                .readout(&codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let from_plain = plain_output
                .readout(&codec)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert!(all_close(&from_cipher, &from_plain, TOLERANCE));
            Ok(())
        })
        .expect("encrypted reversal reads out like its plaintext twin");
}
