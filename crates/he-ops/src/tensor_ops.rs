//! Shape rules and source maps for the structural operators.
//!
//! Every operator is described by where each output element comes from: an
//! operand index plus a coordinate in that operand. The maps depend only on
//! shapes and operator parameters.

use he_core::{AxisSet, OpDescriptor, Primitive, Shape, flat_index, row_major_strides};

use crate::OpError;

pub(crate) fn check_arity(op: &OpDescriptor, actual: usize) -> Result<(), OpError> {
    let expected = op.arity();
    if expected.accepts(actual) {
        Ok(())
    } else {
        Err(OpError::ArityMismatch {
            primitive: op.primitive(),
            expected,
            actual,
        })
    }
}

pub(crate) fn reverse_shape(input: &Shape, axes: &AxisSet) -> Result<Shape, OpError> {
    axes.validate(input.rank())
        .map_err(|err| OpError::InvalidAxis {
            primitive: Primitive::Reverse,
            axis: err.axis,
            rank: err.rank,
        })?;
    Ok(input.clone())
}

pub(crate) fn slice_shape(
    input: &Shape,
    start: &[u32],
    limit: &[u32],
    strides: &[u32],
) -> Result<Shape, OpError> {
    let primitive = Primitive::Slice;
    let rank = input.rank();
    for param in [start, limit, strides] {
        if param.len() != rank {
            return Err(OpError::ShapeMismatch {
                primitive,
                left: input.clone(),
                right: Shape::new(param),
            });
        }
    }

    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let (lo, hi, stride, dim) = (start[axis], limit[axis], strides[axis], input.dims[axis]);
        if lo > hi || hi > dim {
            return Err(OpError::InvalidBounds {
                axis,
                start: lo,
                limit: hi,
                dim,
            });
        }
        if stride == 0 {
            return Err(OpError::InvalidStride { axis, stride });
        }
        dims.push((hi - lo).div_ceil(stride));
    }
    Ok(Shape::new(dims))
}

pub(crate) fn concatenate_shape(inputs: &[&Shape], axis: usize) -> Result<Shape, OpError> {
    let primitive = Primitive::Concatenate;
    let Some(first) = inputs.first() else {
        return Err(OpError::ArityMismatch {
            primitive,
            expected: he_core::Arity::AtLeast(1),
            actual: 0,
        });
    };
    let rank = first.rank();
    if axis >= rank {
        return Err(OpError::InvalidAxis {
            primitive,
            axis,
            rank,
        });
    }

    let mut total = 0_u64;
    for shape in inputs {
        let compatible = shape.rank() == rank
            && shape
                .dims
                .iter()
                .zip(&first.dims)
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b);
        if !compatible {
            return Err(OpError::ShapeMismatch {
                primitive,
                left: (*first).clone(),
                right: (*shape).clone(),
            });
        }
        total += u64::from(shape.dims[axis]);
    }

    let mut dims = first.dims.clone();
    dims[axis] = u32::try_from(total).map_err(|_| OpError::ShapeMismatch {
        primitive,
        left: (*first).clone(),
        right: (*inputs[inputs.len() - 1]).clone(),
    })?;
    Ok(Shape::new(dims))
}

pub(crate) fn reshape_shape(input: &Shape, new_shape: &Shape) -> Result<Shape, OpError> {
    if input.element_count() != new_shape.element_count() || new_shape.element_count().is_none() {
        return Err(OpError::ShapeMismatch {
            primitive: Primitive::Reshape,
            left: input.clone(),
            right: new_shape.clone(),
        });
    }
    Ok(new_shape.clone())
}

pub(crate) fn transpose_shape(input: &Shape, permutation: &[usize]) -> Result<Shape, OpError> {
    let rank = input.rank();
    if let Some(axis) = permutation.iter().copied().find(|axis| *axis >= rank) {
        return Err(OpError::InvalidAxis {
            primitive: Primitive::Transpose,
            axis,
            rank,
        });
    }
    let mut seen = vec![false; rank];
    let is_permutation = permutation.len() == rank
        && permutation
            .iter()
            .all(|axis| !std::mem::replace(&mut seen[*axis], true));
    if !is_permutation {
        return Err(OpError::InvalidPermutation {
            permutation: permutation.to_vec(),
            rank,
        });
    }
    Ok(Shape::new(
        permutation
            .iter()
            .map(|axis| input.dims[*axis])
            .collect::<Vec<_>>(),
    ))
}

/// Output coordinate to (operand, operand coordinate), one variant per
/// operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceMap {
    Reverse {
        dims: Vec<usize>,
        reversed: Vec<bool>,
    },
    Slice {
        start: Vec<usize>,
        strides: Vec<usize>,
    },
    Concatenate {
        axis: usize,
        offsets: Vec<usize>,
    },
    Reshape {
        output_strides: Vec<usize>,
        input_dims: Vec<usize>,
    },
    Transpose {
        permutation: Vec<usize>,
    },
}

impl SourceMap {
    /// Builds the map for an operator whose shapes were already checked by
    /// [`crate::infer_shape`].
    pub(crate) fn for_op(op: &OpDescriptor, inputs: &[&Shape], output: &Shape) -> Self {
        match op {
            OpDescriptor::Reverse { axes } => {
                let dims = inputs[0].dims_usize();
                let reversed = (0..dims.len()).map(|axis| axes.contains(axis)).collect();
                Self::Reverse { dims, reversed }
            }
            OpDescriptor::Slice { start, strides, .. } => Self::Slice {
                start: start.iter().map(|v| *v as usize).collect(),
                strides: strides.iter().map(|v| *v as usize).collect(),
            },
            OpDescriptor::Concatenate { axis } => {
                let mut offsets = Vec::with_capacity(inputs.len());
                let mut next = 0_usize;
                for shape in inputs {
                    offsets.push(next);
                    next += shape.dims[*axis] as usize;
                }
                Self::Concatenate {
                    axis: *axis,
                    offsets,
                }
            }
            OpDescriptor::Reshape { .. } => Self::Reshape {
                output_strides: row_major_strides(&output.dims_usize()),
                input_dims: inputs[0].dims_usize(),
            },
            OpDescriptor::Transpose { permutation } => Self::Transpose {
                permutation: permutation.clone(),
            },
        }
    }

    /// Writes the source coordinate of `out` into `src` and returns the
    /// operand it belongs to.
    pub(crate) fn source(&self, out: &[usize], src: &mut Vec<usize>) -> usize {
        src.clear();
        match self {
            Self::Reverse { dims, reversed } => {
                src.extend(out.iter().zip(dims).zip(reversed).map(|((c, d), flip)| {
                    if *flip { d - 1 - c } else { *c }
                }));
                0
            }
            Self::Slice { start, strides } => {
                src.extend(
                    out.iter()
                        .zip(start)
                        .zip(strides)
                        .map(|((c, lo), stride)| lo + c * stride),
                );
                0
            }
            Self::Concatenate { axis, offsets } => {
                let position = out[*axis];
                let operand = offsets
                    .partition_point(|offset| *offset <= position)
                    .saturating_sub(1);
                src.extend_from_slice(out);
                src[*axis] = position - offsets[operand];
                operand
            }
            Self::Reshape {
                output_strides,
                input_dims,
            } => {
                let flat = flat_index(out, output_strides);
                src.resize(input_dims.len(), 0);
                he_core::unflatten_index_into(flat, input_dims, src);
                0
            }
            Self::Transpose { permutation } => {
                src.resize(permutation.len(), 0);
                for (out_axis, in_axis) in permutation.iter().enumerate() {
                    src[*in_axis] = out[out_axis];
                }
                0
            }
        }
    }
}
