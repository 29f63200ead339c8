//! Host CPU backend.
//!
//! Operators run on the host; the lane gather inside each operator spreads
//! output containers over rayon's global pool.

use he_core::{ConfigRegistry, Program};
use he_encoding::{EncodingCapability, EncodingParams, KeystreamCodec};
use std::sync::Arc;

use crate::backend::{Backend, BackendError, Executable};

pub struct CpuBackend {
    capability: Arc<dyn EncodingCapability>,
    registry: Arc<ConfigRegistry>,
    version_string: String,
}

impl CpuBackend {
    #[must_use]
    pub fn new(capability: Arc<dyn EncodingCapability>) -> Self {
        Self {
            capability,
            registry: Arc::new(ConfigRegistry::new()),
            version_string: format!("he-backend-cpu/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Backend over a [`KeystreamCodec`] with a freshly generated key.
    #[must_use]
    pub fn with_params(params: EncodingParams) -> Self {
        let mut rng = rand::rng();
        Self::new(Arc::new(KeystreamCodec::new(params, &mut rng)))
    }

    /// Deterministic key, for tests and reproducible reports.
    #[must_use]
    pub fn with_seed(params: EncodingParams, seed: u64) -> Self {
        Self::new(Arc::new(KeystreamCodec::from_seed(params, seed)))
    }

    /// Replaces the registry used by tensors and by later compilations.
    pub fn set_config(&mut self, registry: ConfigRegistry) {
        log::debug!("cpu backend registry set with {} entries", registry.len());
        self.registry = Arc::new(registry);
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::with_params(EncodingParams::default())
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn version(&self) -> &str {
        &self.version_string
    }

    fn capability(&self) -> &dyn EncodingCapability {
        self.capability.as_ref()
    }

    fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    fn compile(&self, program: &Program) -> Result<Executable, BackendError> {
        let executable = Executable::new(
            program,
            Arc::clone(&self.registry),
            Arc::clone(&self.capability),
        )?;
        log::debug!(
            "compiled {} equations, fingerprint {}",
            program.equations.len(),
            executable.fingerprint()
        );
        Ok(executable)
    }
}
