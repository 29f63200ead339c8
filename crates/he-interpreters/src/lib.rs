#![forbid(unsafe_code)]

use he_core::{
    ConfigError, ConfigRegistry, Primitive, Program, ProgramValidationError, Shape, TensorConfig,
    VarId,
};
use he_encoding::EncodingCapability;
use he_ops::{OpError, execute, infer_shape, propagate_config};
use he_tensor::{TensorError, TensorHandle};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    Validation(ProgramValidationError),
    DependencyCycle {
        equations: Vec<usize>,
    },
    Config(ConfigError),
    BoundShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
    BoundConfigMismatch {
        name: String,
        expected: TensorConfig,
        actual: TensorConfig,
    },
    Tensor(TensorError),
    Op(OpError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::Validation(err) => write!(f, "malformed program: {err}"),
            Self::DependencyCycle { equations } => {
                write!(f, "equations {equations:?} depend on each other cyclically")
            }
            Self::Config(err) => write!(f, "{err}"),
            Self::BoundShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "parameter '{name}' declared with shape {expected}, bound to {actual}"
            ),
            Self::BoundConfigMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "parameter '{name}' configured as {expected}, bound to {actual}"
            ),
            Self::Tensor(err) => write!(f, "tensor binding failed: {err}"),
            Self::Op(err) => write!(f, "operator failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<ProgramValidationError> for InterpreterError {
    fn from(value: ProgramValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<ConfigError> for InterpreterError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TensorError> for InterpreterError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<OpError> for InterpreterError {
    fn from(value: OpError) -> Self {
        Self::Op(value)
    }
}

/// What one executed equation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: usize,
    pub equation_index: usize,
    pub primitive: Primitive,
    pub output: VarId,
    pub output_shape: Shape,
    pub output_config: TensorConfig,
    pub containers: usize,
}

/// A validated program with a dependency order and every variable's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    program: Program,
    order: Vec<usize>,
    shapes: BTreeMap<VarId, Shape>,
    /// Variables whose last consumer is the equation at the same position in
    /// `order`; they are dropped right after it runs.
    releases: Vec<Vec<VarId>>,
}

pub fn compile(program: &Program) -> Result<CompiledProgram, InterpreterError> {
    program.validate_well_formed()?;
    let order = dependency_order(program)?;

    let mut shapes: BTreeMap<VarId, Shape> = program
        .params
        .iter()
        .map(|param| (param.var, param.shape.clone()))
        .collect();
    for &index in &order {
        let eqn = &program.equations[index];
        let input_shapes = eqn
            .inputs
            .iter()
            .map(|var| shapes.get(var).ok_or(InterpreterError::MissingVariable(*var)))
            .collect::<Result<Vec<_>, _>>()?;
        let output_shape = infer_shape(&eqn.op, &input_shapes)?;
        shapes.insert(eqn.output, output_shape);
    }

    let outvars = program.outvars.iter().copied().collect::<BTreeSet<_>>();
    let mut last_use: BTreeMap<VarId, usize> = BTreeMap::new();
    for (step, &index) in order.iter().enumerate() {
        for var in &program.equations[index].inputs {
            last_use.insert(*var, step);
        }
    }
    let mut releases = vec![Vec::new(); order.len()];
    for (var, step) in last_use {
        if !outvars.contains(&var) {
            releases[step].push(var);
        }
    }

    Ok(CompiledProgram {
        program: program.clone(),
        order,
        shapes,
        releases,
    })
}

/// Kahn ordering that keeps the listed order among independent equations.
fn dependency_order(program: &Program) -> Result<Vec<usize>, InterpreterError> {
    let producers: BTreeMap<VarId, usize> = program
        .equations
        .iter()
        .enumerate()
        .map(|(index, eqn)| (eqn.output, index))
        .collect();

    let mut pending = vec![0_usize; program.equations.len()];
    let mut dependents = vec![Vec::new(); program.equations.len()];
    for (index, eqn) in program.equations.iter().enumerate() {
        let upstream = eqn
            .inputs
            .iter()
            .filter_map(|var| producers.get(var).copied())
            .collect::<BTreeSet<_>>();
        pending[index] = upstream.len();
        for producer in upstream {
            dependents[producer].push(index);
        }
    }

    let mut ready = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| index)
        .collect::<BTreeSet<_>>();
    let mut order = Vec::with_capacity(program.equations.len());
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != program.equations.len() {
        let equations = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(index, _)| index)
            .collect();
        return Err(InterpreterError::DependencyCycle { equations });
    }
    Ok(order)
}

impl CompiledProgram {
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        self.program.canonical_fingerprint()
    }

    /// Equation indices in execution order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    #[must_use]
    pub fn var_shape(&self, var: VarId) -> Option<&Shape> {
        self.shapes.get(&var)
    }

    pub fn output_shapes(&self) -> Result<Vec<&Shape>, InterpreterError> {
        self.program
            .outvars
            .iter()
            .map(|var| self.var_shape(*var).ok_or(InterpreterError::MissingVariable(*var)))
            .collect()
    }

    /// Configs of every parameter, in declaration order.
    pub fn parameter_configs(
        &self,
        registry: &ConfigRegistry,
    ) -> Result<Vec<TensorConfig>, InterpreterError> {
        self.program
            .params
            .iter()
            .map(|param| registry.resolve(&param.name).map_err(InterpreterError::from))
            .collect()
    }

    /// Output configs implied by the registry, without touching any data.
    pub fn output_configs(
        &self,
        registry: &ConfigRegistry,
    ) -> Result<Vec<TensorConfig>, InterpreterError> {
        let mut configs: BTreeMap<VarId, TensorConfig> = self
            .program
            .params
            .iter()
            .zip(self.parameter_configs(registry)?)
            .map(|(param, config)| (param.var, config))
            .collect();
        for &index in &self.order {
            let eqn = &self.program.equations[index];
            let inputs = eqn
                .inputs
                .iter()
                .map(|var| {
                    configs
                        .get(var)
                        .copied()
                        .ok_or(InterpreterError::MissingVariable(*var))
                })
                .collect::<Result<Vec<_>, _>>()?;
            configs.insert(eqn.output, propagate_config(&eqn.op, &inputs)?);
        }
        self.program
            .outvars
            .iter()
            .map(|var| {
                configs
                    .get(var)
                    .copied()
                    .ok_or(InterpreterError::MissingVariable(*var))
            })
            .collect()
    }

    /// Encodes one row-major value list per parameter under the registry.
    pub fn bind_inputs(
        &self,
        registry: &ConfigRegistry,
        values: &[&[f64]],
        capability: &dyn EncodingCapability,
    ) -> Result<Vec<TensorHandle>, InterpreterError> {
        if values.len() != self.program.params.len() {
            return Err(InterpreterError::InputArity {
                expected: self.program.params.len(),
                actual: values.len(),
            });
        }
        self.program
            .params
            .iter()
            .zip(values)
            .map(|(param, values)| {
                TensorHandle::bind_parameter(&param.name, &param.shape, values, registry, capability)
                    .map_err(InterpreterError::from)
            })
            .collect()
    }
}

pub fn evaluate(
    compiled: &CompiledProgram,
    registry: &ConfigRegistry,
    inputs: Vec<TensorHandle>,
    capability: &dyn EncodingCapability,
) -> Result<Vec<TensorHandle>, InterpreterError> {
    evaluate_traced(compiled, registry, inputs, capability, &mut |_| {})
}

/// Runs `compiled` over bound parameter handles, reporting each step to
/// `on_step`.
///
/// Every parameter is checked against the registry before the first equation
/// runs. Equations execute one at a time; an equation starts only after the
/// previous one has written all of its containers.
pub fn evaluate_traced(
    compiled: &CompiledProgram,
    registry: &ConfigRegistry,
    inputs: Vec<TensorHandle>,
    capability: &dyn EncodingCapability,
    on_step: &mut dyn FnMut(&StepRecord),
) -> Result<Vec<TensorHandle>, InterpreterError> {
    let program = &compiled.program;
    if inputs.len() != program.params.len() {
        return Err(InterpreterError::InputArity {
            expected: program.params.len(),
            actual: inputs.len(),
        });
    }

    let configs = compiled.parameter_configs(registry)?;
    let mut env: BTreeMap<VarId, TensorHandle> = BTreeMap::new();
    for ((param, config), handle) in program.params.iter().zip(configs).zip(inputs) {
        if handle.shape() != &param.shape {
            return Err(InterpreterError::BoundShapeMismatch {
                name: param.name.clone(),
                expected: param.shape.clone(),
                actual: handle.shape().clone(),
            });
        }
        if handle.config() != config {
            return Err(InterpreterError::BoundConfigMismatch {
                name: param.name.clone(),
                expected: config,
                actual: handle.config(),
            });
        }
        env.insert(param.var, handle);
    }

    for (step, (&index, releases)) in compiled.order.iter().zip(&compiled.releases).enumerate() {
        let eqn = &program.equations[index];
        let output = {
            let operands = eqn
                .inputs
                .iter()
                .map(|var| env.get(var).ok_or(InterpreterError::MissingVariable(*var)))
                .collect::<Result<Vec<_>, _>>()?;
            execute(&eqn.op, &operands, capability)?
        };

        let record = StepRecord {
            step,
            equation_index: index,
            primitive: eqn.op.primitive(),
            output: eqn.output,
            output_shape: output.shape().clone(),
            output_config: output.config(),
            containers: output.container_count(),
        };
        log::debug!(
            "step {} (eqn {}): {} -> v{} {} [{}] {} containers",
            record.step,
            record.equation_index,
            record.primitive.as_str(),
            record.output.0,
            record.output_shape,
            record.output_config,
            record.containers
        );
        on_step(&record);

        env.insert(eqn.output, output);
        for var in releases {
            env.remove(var);
        }
    }

    let mut outputs = Vec::with_capacity(program.outvars.len());
    for var in &program.outvars {
        // An outvar listed twice is rejected by validation, so each can move.
        let handle = env.remove(var).ok_or(InterpreterError::MissingVariable(*var))?;
        outputs.push(handle);
    }
    Ok(outputs)
}
