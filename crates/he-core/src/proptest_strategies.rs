use proptest::prelude::*;

use crate::{AxisSet, Shape, TensorConfig};

pub fn arb_shape(max_rank: usize, max_dim: u32) -> impl Strategy<Value = Shape> {
    prop::collection::vec(0..=max_dim, 0..=max_rank).prop_map(Shape::new)
}

/// Shapes whose every axis is non-empty.
pub fn arb_populated_shape(max_rank: usize, max_dim: u32) -> impl Strategy<Value = Shape> {
    prop::collection::vec(1..=max_dim.max(1), 0..=max_rank).prop_map(Shape::new)
}

pub fn arb_shape_and_axes(
    max_rank: usize,
    max_dim: u32,
) -> impl Strategy<Value = (Shape, AxisSet)> {
    arb_populated_shape(max_rank, max_dim)
        .prop_flat_map(|shape| {
            let rank = shape.rank();
            (Just(shape), prop::collection::vec(any::<bool>(), rank))
        })
        .prop_map(|(shape, mask)| {
            let axes = mask
                .iter()
                .enumerate()
                .filter(|(_, selected)| **selected)
                .map(|(axis, _)| axis)
                .collect::<AxisSet>();
            (shape, axes)
        })
}

pub fn arb_tensor_config() -> impl Strategy<Value = TensorConfig> {
    (any::<bool>(), any::<bool>(), any::<bool>())
        .prop_map(|(encrypted, packed, complex)| TensorConfig::from_flags(encrypted, packed, complex))
}
