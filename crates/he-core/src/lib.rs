#![forbid(unsafe_code)]

pub mod config;
#[cfg(any(test, feature = "proptest"))]
pub mod proptest_strategies;

pub use config::{ConfigError, ConfigRegistry, TensorConfig};

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeSet;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: impl Into<Vec<u32>>) -> Self {
        Self { dims: dims.into() }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    #[must_use]
    pub fn dims_usize(&self) -> Vec<usize> {
        self.dims.iter().map(|d| *d as usize).collect()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// Row-major strides for `dims`; the last axis has stride 1.
///
/// Strides saturate. They only overflow when some axis is empty, and an
/// empty shape has no element to address.
#[must_use]
pub fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(dims[i + 1]);
    }
    strides
}

#[must_use]
pub fn flat_index(coord: &[usize], strides: &[usize]) -> usize {
    coord.iter().zip(strides).map(|(c, s)| c * s).sum()
}

/// Inverse of [`flat_index`] for row-major `dims`, written into `coord`.
pub fn unflatten_index_into(mut flat: usize, dims: &[usize], coord: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        let dim = dims[axis].max(1);
        coord[axis] = flat % dim;
        flat /= dim;
    }
}

#[must_use]
pub fn unflatten_index(flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut coord = vec![0; dims.len()];
    unflatten_index_into(flat, dims, &mut coord);
    coord
}

/// Set of axis indices selected by a structural operator.
///
/// Backed by an ordered set, so duplicates collapse on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisSet(BTreeSet<usize>);

impl AxisSet {
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    #[must_use]
    pub fn contains(&self, axis: usize) -> bool {
        self.0.contains(&axis)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.0.is_disjoint(&other.0)
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Fails on the smallest axis that does not exist in a tensor of `rank`.
    pub fn validate(&self, rank: usize) -> Result<(), AxisError> {
        match self.0.iter().find(|axis| **axis >= rank) {
            Some(axis) => Err(AxisError { axis: *axis, rank }),
            None => Ok(()),
        }
    }
}

impl FromIterator<usize> for AxisSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[usize; N]> for AxisSet {
    fn from(axes: [usize; N]) -> Self {
        axes.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisError {
    pub axis: usize,
    pub rank: usize,
}

impl std::fmt::Display for AxisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "axis {} out of range for rank {}", self.axis, self.rank)
    }
}

impl std::error::Error for AxisError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Reverse,
    Slice,
    Concatenate,
    Reshape,
    Transpose,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reverse => "reverse",
            Self::Slice => "slice",
            Self::Concatenate => "concatenate",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
        }
    }
}

/// Operand count accepted by a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    #[must_use]
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Self::Exactly(n) => count == n,
            Self::AtLeast(n) => count >= n,
        }
    }
}

/// A structural operator together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpDescriptor {
    Reverse {
        axes: AxisSet,
    },
    Slice {
        start: Vec<u32>,
        limit: Vec<u32>,
        strides: Vec<u32>,
    },
    Concatenate {
        axis: usize,
    },
    Reshape {
        new_shape: Shape,
    },
    Transpose {
        permutation: Vec<usize>,
    },
}

impl OpDescriptor {
    #[must_use]
    pub fn reverse(axes: impl Into<AxisSet>) -> Self {
        Self::Reverse { axes: axes.into() }
    }

    /// Unit-stride slice.
    #[must_use]
    pub fn slice(start: impl Into<Vec<u32>>, limit: impl Into<Vec<u32>>) -> Self {
        let start = start.into();
        let strides = vec![1; start.len()];
        Self::Slice {
            start,
            limit: limit.into(),
            strides,
        }
    }

    #[must_use]
    pub fn primitive(&self) -> Primitive {
        match self {
            Self::Reverse { .. } => Primitive::Reverse,
            Self::Slice { .. } => Primitive::Slice,
            Self::Concatenate { .. } => Primitive::Concatenate,
            Self::Reshape { .. } => Primitive::Reshape,
            Self::Transpose { .. } => Primitive::Transpose,
        }
    }

    #[must_use]
    pub fn arity(&self) -> Arity {
        match self {
            Self::Concatenate { .. } => Arity::AtLeast(1),
            _ => Arity::Exactly(1),
        }
    }

    fn write_params(&self, out: &mut String) {
        match self {
            Self::Reverse { axes } => {
                let _ = write!(out, "axes=");
                for axis in axes.iter() {
                    let _ = write!(out, "{axis},");
                }
            }
            Self::Slice {
                start,
                limit,
                strides,
            } => {
                let _ = write!(out, "start={start:?};limit={limit:?};strides={strides:?}");
            }
            Self::Concatenate { axis } => {
                let _ = write!(out, "axis={axis}");
            }
            Self::Reshape { new_shape } => {
                let _ = write!(out, "new_shape={:?}", new_shape.dims);
            }
            Self::Transpose { permutation } => {
                let _ = write!(out, "permutation={permutation:?}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// A named program input. The name is the key into the configuration registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub var: VarId,
    pub name: String,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub op: OpDescriptor,
    pub inputs: SmallVec<[VarId; 4]>,
    pub output: VarId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Program {
    pub params: Vec<Parameter>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
    #[serde(skip)]
    fingerprint_cache: std::sync::OnceLock<String>,
}

impl Clone for Program {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            outvars: self.outvars.clone(),
            equations: self.equations.clone(),
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
            && self.outvars == other.outvars
            && self.equations == other.equations
    }
}

impl Eq for Program {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramValidationError {
    DuplicateBinding { section: &'static str, var: VarId },
    DuplicateParameterName { name: String },
    UnboundInputVar { equation_index: usize, var: VarId },
    UnknownOutvar { var: VarId },
}

impl std::fmt::Display for ProgramValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBinding { section, var } => {
                write!(f, "duplicate binding in {} for var v{}", section, var.0)
            }
            Self::DuplicateParameterName { name } => {
                write!(f, "parameter name '{name}' is declared more than once")
            }
            Self::UnboundInputVar {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} references unbound input var v{}",
                    equation_index, var.0
                )
            }
            Self::UnknownOutvar { var } => {
                write!(f, "outvar v{} does not have a defining binding", var.0)
            }
        }
    }
}

impl std::error::Error for ProgramValidationError {}

impl Program {
    #[must_use]
    pub fn new(params: Vec<Parameter>, outvars: Vec<VarId>, equations: Vec<Equation>) -> Self {
        Self {
            params,
            outvars,
            equations,
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            out.push_str("params=[");
            for param in &self.params {
                let _ = write!(&mut out, "v{}:{}:{:?},", param.var.0, param.name, param.shape.dims);
            }
            out.push(']');
            out.push_str("out=[");
            for var in &self.outvars {
                let _ = write!(&mut out, "v{},", var.0);
            }
            out.push(']');

            for eqn in &self.equations {
                let _ = write!(&mut out, "eqn:{}(", eqn.op.primitive().as_str());
                for var in &eqn.inputs {
                    let _ = write!(&mut out, "v{},", var.0);
                }
                let _ = write!(&mut out, ")->v{}{{", eqn.output.0);
                eqn.op.write_params(&mut out);
                out.push('}');
                out.push('|');
            }

            out
        })
    }

    /// Checks binding structure without assuming the equations are listed in
    /// dependency order; ordering is resolved at compile time.
    pub fn validate_well_formed(&self) -> Result<(), ProgramValidationError> {
        let mut bindings = BTreeSet::new();
        let mut names = BTreeSet::new();

        for param in &self.params {
            if !bindings.insert(param.var) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "params",
                    var: param.var,
                });
            }
            if !names.insert(param.name.as_str()) {
                return Err(ProgramValidationError::DuplicateParameterName {
                    name: param.name.clone(),
                });
            }
        }

        for eqn in &self.equations {
            if !bindings.insert(eqn.output) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "equations",
                    var: eqn.output,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            if let Some(var) = eqn.inputs.iter().find(|var| !bindings.contains(*var)) {
                return Err(ProgramValidationError::UnboundInputVar {
                    equation_index,
                    var: *var,
                });
            }
        }

        let mut seen_outvars = BTreeSet::new();
        for outvar in &self.outvars {
            if !seen_outvars.insert(*outvar) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "outvars",
                    var: *outvar,
                });
            }
            if !bindings.contains(outvar) {
                return Err(ProgramValidationError::UnknownOutvar { var: *outvar });
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn parameter(&self, var: VarId) -> Option<&Parameter> {
        self.params.iter().find(|param| param.var == var)
    }
}

/// One parameter feeding a single operator.
#[must_use]
pub fn unary_program(name: impl Into<String>, shape: Shape, op: OpDescriptor) -> Program {
    chain_program(name, shape, vec![op])
}

/// One parameter threaded through `ops` in order; the last result is the
/// single output. An empty `ops` list returns the parameter itself.
#[must_use]
pub fn chain_program(name: impl Into<String>, shape: Shape, ops: Vec<OpDescriptor>) -> Program {
    let params = vec![Parameter {
        var: VarId(1),
        name: name.into(),
        shape,
    }];
    let mut current = VarId(1);
    let mut equations = Vec::with_capacity(ops.len());
    for (idx, op) in ops.into_iter().enumerate() {
        let output = VarId(idx as u32 + 2);
        equations.push(Equation {
            op,
            inputs: smallvec![current],
            output,
        });
        current = output;
    }
    Program::new(params, vec![current], equations)
}
