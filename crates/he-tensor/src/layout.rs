//! Index/slot mapper.
//!
//! A [`Layout`] is the pure bijection between the logical coordinates of a
//! shape and the `(container, slot)` addresses of its packed storage. It
//! never sees element values.
//!
//! Every layout splits a coordinate into an *outer* index, which is cut into
//! groups of `lanes_per_container`, and an *inner* index that selects one of
//! `inner_count` container families:
//!
//! - unpacked: outer is the row-major flat index, `inner_count == 1`;
//! - batched: outer is the coordinate on axis 0, inner is the row-major
//!   flattening of axes `1..`.
//!
//! `container = (outer / lanes) * inner_count + inner` and
//! `slot = outer % lanes`. Only the last group of each family can be short,
//! so containers hold exactly the lanes they address and no padding.

use he_core::{Shape, TensorConfig, row_major_strides};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackingScheme {
    pub batched: bool,
    pub complex: bool,
    pub slot_count: usize,
}

impl PackingScheme {
    #[must_use]
    pub fn from_config(config: TensorConfig, slot_count: usize) -> Self {
        Self {
            batched: config.packed,
            complex: config.complex_packed,
            slot_count,
        }
    }

    /// Real values one container can address. A complex slot holds two.
    #[must_use]
    pub fn lanes_per_container(&self) -> usize {
        let slots = if self.batched { self.slot_count } else { 1 };
        if self.complex { slots * 2 } else { slots }
    }
}

/// Physical position of one logical element. `slot` is a lane offset: with
/// complex packing `slot / 2` is the complex slot and `slot % 2` selects the
/// real (0) or imaginary (1) part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalAddress {
    pub container: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// A coordinate or address fell outside the layout. Never expected from
    /// correct operator code.
    PackingSchemeViolation { detail: String },
    /// Batched packing needs an axis to batch over.
    ScalarBatch,
    InvalidScheme { detail: String },
}

impl LayoutError {
    pub(crate) fn violation(detail: impl Into<String>) -> Self {
        Self::PackingSchemeViolation {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PackingSchemeViolation { detail } => {
                write!(f, "packing scheme violation: {detail}")
            }
            Self::ScalarBatch => write!(f, "batched packing requires rank >= 1"),
            Self::InvalidScheme { detail } => write!(f, "invalid packing scheme: {detail}"),
        }
    }
}

impl std::error::Error for LayoutError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    scheme: PackingScheme,
    dims: Vec<usize>,
    strides: Vec<usize>,
    element_count: usize,
    outer_len: usize,
    inner_count: usize,
    lanes: usize,
    container_count: usize,
}

impl Layout {
    pub fn new(shape: &Shape, scheme: PackingScheme) -> Result<Self, LayoutError> {
        if scheme.slot_count == 0 {
            return Err(LayoutError::InvalidScheme {
                detail: "slot_count must be at least 1".to_owned(),
            });
        }
        if scheme.batched && shape.rank() == 0 {
            return Err(LayoutError::ScalarBatch);
        }

        let element_count = shape
            .element_count()
            .and_then(|count| usize::try_from(count).ok())
            .ok_or_else(|| LayoutError::violation(format!("shape {shape} is not addressable")))?;
        let dims = shape.dims_usize();
        let strides = row_major_strides(&dims);

        let (outer_len, inner_count) = if scheme.batched {
            // the trailing product of an empty shape may not fit in usize
            let inner_count = if element_count == 0 {
                0
            } else {
                dims[1..].iter().product::<usize>()
            };
            (dims[0], inner_count)
        } else {
            (element_count, 1)
        };
        let lanes = scheme.lanes_per_container();
        let container_count = outer_len.div_ceil(lanes) * inner_count;

        Ok(Self {
            shape: shape.clone(),
            scheme,
            dims,
            strides,
            element_count,
            outer_len,
            inner_count,
            lanes,
            container_count,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn scheme(&self) -> PackingScheme {
        self.scheme
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.container_count
    }

    #[must_use]
    pub fn lanes_per_container(&self) -> usize {
        self.lanes
    }

    /// Lanes occupied in `container`; zero past the last container.
    #[must_use]
    pub fn lanes_in(&self, container: usize) -> usize {
        if container >= self.container_count {
            return 0;
        }
        let group = container / self.inner_count;
        self.lanes.min(self.outer_len - group * self.lanes)
    }

    /// Sum of [`Self::lanes_in`] over every container; always equals the
    /// element count.
    #[must_use]
    pub fn total_lanes(&self) -> usize {
        (0..self.container_count).map(|c| self.lanes_in(c)).sum()
    }

    pub fn to_physical(&self, coord: &[usize]) -> Result<PhysicalAddress, LayoutError> {
        if coord.len() != self.dims.len() {
            return Err(LayoutError::violation(format!(
                "coordinate {coord:?} has rank {} but shape {} has rank {}",
                coord.len(),
                self.shape,
                self.dims.len()
            )));
        }
        if let Some(axis) = coord.iter().zip(&self.dims).position(|(c, d)| c >= d) {
            return Err(LayoutError::violation(format!(
                "coordinate {coord:?} out of bounds on axis {axis} of shape {}",
                self.shape
            )));
        }

        let (outer, inner) = if self.scheme.batched {
            let inner = coord[1..]
                .iter()
                .zip(&self.strides[1..])
                .map(|(c, s)| c * s)
                .sum::<usize>();
            (coord[0], inner)
        } else {
            (he_core::flat_index(coord, &self.strides), 0)
        };

        Ok(PhysicalAddress {
            container: (outer / self.lanes) * self.inner_count + inner,
            slot: outer % self.lanes,
        })
    }

    pub fn to_logical(&self, address: PhysicalAddress) -> Result<Vec<usize>, LayoutError> {
        let mut coord = vec![0; self.dims.len()];
        self.to_logical_into(address, &mut coord)?;
        Ok(coord)
    }

    /// Allocation-free form of [`Self::to_logical`]; `coord` must have the
    /// layout's rank.
    pub fn to_logical_into(
        &self,
        address: PhysicalAddress,
        coord: &mut [usize],
    ) -> Result<(), LayoutError> {
        if address.slot >= self.lanes_in(address.container) {
            return Err(LayoutError::violation(format!(
                "address (container {}, slot {}) outside {} containers of shape {}",
                address.container, address.slot, self.container_count, self.shape
            )));
        }
        if coord.len() != self.dims.len() {
            return Err(LayoutError::violation(format!(
                "coordinate buffer of rank {} for shape {}",
                coord.len(),
                self.shape
            )));
        }

        let group = address.container / self.inner_count;
        let inner = address.container % self.inner_count;
        let outer = group * self.lanes + address.slot;

        if self.scheme.batched {
            coord[0] = outer;
            he_core::unflatten_index_into(inner, &self.dims[1..], &mut coord[1..]);
        } else {
            he_core::unflatten_index_into(outer, &self.dims, coord);
        }
        Ok(())
    }
}
