use he_encoding::LaneContainer;
use he_tensor::{Layout, LayoutError, PhysicalAddress};
use rayon::prelude::*;

use crate::tensor_ops::SourceMap;

/// Builds every output container by copying lanes from operand containers.
///
/// Each rayon task owns exactly one output container. Lanes are cloned, never
/// inspected, so the same routine serves plaintext and ciphertext storage.
pub(crate) fn gather_lanes<C: LaneContainer>(
    output: &Layout,
    operands: &[(&Layout, &[C])],
    map: &SourceMap,
) -> Result<Vec<C>, LayoutError> {
    (0..output.container_count())
        .into_par_iter()
        .map(|container| {
            let lane_count = output.lanes_in(container);
            let mut lanes = Vec::with_capacity(lane_count);
            let mut coord = vec![0; output.dims().len()];
            let mut src = Vec::with_capacity(coord.len());
            for slot in 0..lane_count {
                output.to_logical_into(PhysicalAddress { container, slot }, &mut coord)?;
                let operand = map.source(&coord, &mut src);
                let (layout, containers) = operands.get(operand).ok_or_else(|| {
                    LayoutError::PackingSchemeViolation {
                        detail: format!("source operand {operand} of {}", operands.len()),
                    }
                })?;
                let address = layout.to_physical(&src)?;
                let lane = containers
                    .get(address.container)
                    .and_then(|source| source.lanes().get(address.slot))
                    .ok_or_else(|| LayoutError::PackingSchemeViolation {
                        detail: format!(
                            "source address (container {}, slot {}) has no lane",
                            address.container, address.slot
                        ),
                    })?;
                lanes.push(lane.clone());
            }
            Ok(C::from_lanes(lanes))
        })
        .collect()
}
