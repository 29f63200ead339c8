//! Backend trait and the executable it compiles programs into.

use he_core::{ConfigRegistry, Program, Shape, TensorConfig};
use he_encoding::EncodingCapability;
use he_interpreters::{CompiledProgram, InterpreterError, evaluate_traced};
use he_tensor::{TensorError, TensorHandle};
use std::sync::Arc;

use crate::ledger::ExecutionLedger;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    Interpreter(InterpreterError),
    Tensor(TensorError),
    OutputArity {
        expected: usize,
        actual: usize,
    },
    OutputMismatch {
        index: usize,
        expected_shape: Shape,
        actual_shape: Shape,
        expected_config: TensorConfig,
        actual_config: TensorConfig,
    },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpreter(err) => write!(f, "execution failed: {err}"),
            Self::Tensor(err) => write!(f, "tensor access failed: {err}"),
            Self::OutputArity { expected, actual } => {
                write!(f, "expected {expected} output handles, got {actual}")
            }
            Self::OutputMismatch {
                index,
                expected_shape,
                actual_shape,
                expected_config,
                actual_config,
            } => write!(
                f,
                "output {index} expects {expected_shape} {expected_config}, got {actual_shape} {actual_config}"
            ),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<InterpreterError> for BackendError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

impl From<TensorError> for BackendError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Uniform surface for execution backends.
///
/// A backend owns one encoding capability and one configuration registry.
/// Tensor creation, writes and reads all go through that capability.
pub trait Backend: Send + Sync {
    /// Human-readable backend name (e.g., "cpu").
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn capability(&self) -> &dyn EncodingCapability;

    fn registry(&self) -> &ConfigRegistry;

    /// Compiles `program` against the current registry. Later registry
    /// changes do not affect the returned executable.
    fn compile(&self, program: &Program) -> Result<Executable, BackendError>;

    /// All-zero handle under `config`.
    fn create_tensor(
        &self,
        shape: &Shape,
        config: TensorConfig,
    ) -> Result<TensorHandle, BackendError> {
        Ok(TensorHandle::zeros(shape, config, self.capability())?)
    }

    /// Handle for the registered parameter `name`, zero-filled.
    fn create_parameter(&self, name: &str, shape: &Shape) -> Result<TensorHandle, BackendError> {
        let config = self
            .registry()
            .resolve(name)
            .map_err(|err| BackendError::Tensor(err.into()))?;
        self.create_tensor(shape, config)
    }

    fn write(&self, handle: &mut TensorHandle, values: &[f64]) -> Result<(), BackendError> {
        Ok(handle.write(values, self.capability())?)
    }

    fn read(&self, handle: &TensorHandle) -> Result<Vec<f64>, BackendError> {
        Ok(handle.readout(self.capability())?)
    }
}

/// A compiled program bound to a capability and a registry snapshot.
pub struct Executable {
    compiled: CompiledProgram,
    registry: Arc<ConfigRegistry>,
    capability: Arc<dyn EncodingCapability>,
    last_ledger: Option<ExecutionLedger>,
}

impl Executable {
    pub fn new(
        program: &Program,
        registry: Arc<ConfigRegistry>,
        capability: Arc<dyn EncodingCapability>,
    ) -> Result<Self, BackendError> {
        let compiled = he_interpreters::compile(program)?;
        Ok(Self {
            compiled,
            registry,
            capability,
            last_ledger: None,
        })
    }

    #[must_use]
    pub fn compiled(&self) -> &CompiledProgram {
        &self.compiled
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        self.compiled.fingerprint()
    }

    /// Ledger of the most recent successful call.
    #[must_use]
    pub fn last_ledger(&self) -> Option<&ExecutionLedger> {
        self.last_ledger.as_ref()
    }

    /// Runs the program, taking ownership of the bound inputs.
    pub fn call(&mut self, inputs: Vec<TensorHandle>) -> Result<Vec<TensorHandle>, BackendError> {
        let mut ledger = ExecutionLedger::new(self.compiled.fingerprint());
        let mut record_step = |record: &he_interpreters::StepRecord| ledger.record(record);
        let outputs = evaluate_traced(
            &self.compiled,
            &self.registry,
            inputs,
            self.capability.as_ref(),
            &mut record_step,
        )?;
        self.last_ledger = Some(ledger);
        Ok(outputs)
    }

    /// Checks every output handle against the program's output shapes and
    /// configs, runs the program and replaces the handles' contents.
    ///
    /// Nothing runs when an output handle does not match.
    pub fn call_with_validate(
        &mut self,
        outputs: &mut [TensorHandle],
        inputs: &[TensorHandle],
    ) -> Result<(), BackendError> {
        let shapes = self.compiled.output_shapes()?;
        let configs = self.compiled.output_configs(&self.registry)?;
        if outputs.len() != shapes.len() {
            return Err(BackendError::OutputArity {
                expected: shapes.len(),
                actual: outputs.len(),
            });
        }
        for (index, ((output, shape), config)) in
            outputs.iter().zip(&shapes).zip(&configs).enumerate()
        {
            if output.shape() != *shape || output.config() != *config {
                return Err(BackendError::OutputMismatch {
                    index,
                    expected_shape: (*shape).clone(),
                    actual_shape: output.shape().clone(),
                    expected_config: *config,
                    actual_config: output.config(),
                });
            }
        }

        let results = self.call(inputs.to_vec())?;
        for (slot, result) in outputs.iter_mut().zip(results) {
            *slot = result;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("fingerprint", &self.compiled.fingerprint())
            .field("order", &self.compiled.order())
            .field("last_ledger", &self.last_ledger.as_ref().map(ExecutionLedger::len))
            .finish_non_exhaustive()
    }
}
