use he_core::{ConfigRegistry, Shape, TensorConfig, flat_index, row_major_strides};
use he_encoding::{EncodingCapability, EncodingError, Plaintext};

use crate::layout::{Layout, LayoutError, PackingScheme, PhysicalAddress};
use crate::packed::PackedValue;
use crate::TensorError;

/// Logical shape, packing configuration and packed storage of one tensor.
///
/// Invariant: the value's tag matches `config`, the value has exactly
/// `layout.container_count()` containers, and container `i` holds
/// `layout.lanes_in(i)` lanes. Every constructor checks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHandle {
    layout: Layout,
    config: TensorConfig,
    value: PackedValue,
}

impl TensorHandle {
    /// Assembles a handle from storage produced elsewhere, typically by an
    /// operator.
    pub fn from_parts(
        layout: Layout,
        config: TensorConfig,
        value: PackedValue,
    ) -> Result<Self, LayoutError> {
        let scheme = layout.scheme();
        if PackingScheme::from_config(config, scheme.slot_count) != scheme {
            return Err(LayoutError::violation(format!(
                "config {config} disagrees with layout scheme {scheme:?}"
            )));
        }
        if value.is_encrypted() != config.encrypted || value.is_batched() != config.packed {
            return Err(LayoutError::violation(format!(
                "{} storage under config {config}",
                value.tag()
            )));
        }
        let lane_counts = value.lane_counts();
        let expected = (0..layout.container_count())
            .map(|container| layout.lanes_in(container));
        if lane_counts.len() != layout.container_count()
            || !lane_counts.iter().copied().eq(expected)
        {
            return Err(LayoutError::violation(format!(
                "{} containers do not cover shape {} ({} containers expected)",
                lane_counts.len(),
                layout.shape(),
                layout.container_count()
            )));
        }
        Ok(Self {
            layout,
            config,
            value,
        })
    }

    /// Encodes row-major `values` under `config`, encrypting when the config
    /// asks for it.
    pub fn encode(
        shape: &Shape,
        config: TensorConfig,
        values: &[f64],
        capability: &dyn EncodingCapability,
    ) -> Result<Self, TensorError> {
        let layout = Layout::new(
            shape,
            PackingScheme::from_config(config, capability.params().slot_count),
        )?;
        if values.len() != layout.element_count() {
            return Err(TensorError::ValueCount {
                expected: layout.element_count(),
                actual: values.len(),
            });
        }

        let strides = row_major_strides(layout.dims());
        let mut coord = vec![0; layout.dims().len()];
        let mut plaintexts = Vec::with_capacity(layout.container_count());
        for container in 0..layout.container_count() {
            let mut lanes = Vec::with_capacity(layout.lanes_in(container));
            for slot in 0..layout.lanes_in(container) {
                layout.to_logical_into(PhysicalAddress { container, slot }, &mut coord)?;
                lanes.push(values[flat_index(&coord, &strides)]);
            }
            plaintexts.push(capability.encode(&lanes)?);
        }

        let value = if config.encrypted {
            PackedValue::from_ciphertexts(
                config.packed,
                plaintexts.iter().map(|pt| capability.encrypt(pt)).collect(),
            )
        } else {
            PackedValue::from_plaintexts(config.packed, plaintexts)
        };
        Ok(Self::from_parts(layout, config, value)?)
    }

    /// All-zero tensor, the state of a freshly created output handle.
    pub fn zeros(
        shape: &Shape,
        config: TensorConfig,
        capability: &dyn EncodingCapability,
    ) -> Result<Self, TensorError> {
        let layout = Layout::new(
            shape,
            PackingScheme::from_config(config, capability.params().slot_count),
        )?;
        Self::encode(shape, config, &vec![0.0; layout.element_count()], capability)
    }

    /// Resolves `name` in `registry` and encodes `values` under the result.
    pub fn bind_parameter(
        name: &str,
        shape: &Shape,
        values: &[f64],
        registry: &ConfigRegistry,
        capability: &dyn EncodingCapability,
    ) -> Result<Self, TensorError> {
        let config = registry.resolve(name)?;
        Self::encode(shape, config, values, capability)
    }

    /// Re-encodes the handle's contents in place; shape and config stay.
    pub fn write(
        &mut self,
        values: &[f64],
        capability: &dyn EncodingCapability,
    ) -> Result<(), TensorError> {
        *self = Self::encode(self.layout.shape(), self.config, values, capability)?;
        Ok(())
    }

    /// Row-major logical values, decrypting and decoding each container once.
    ///
    /// This is the only path that reveals encrypted contents.
    pub fn readout(&self, capability: &dyn EncodingCapability) -> Result<Vec<f64>, TensorError> {
        let decoded: Vec<Vec<f64>> = match &self.value {
            PackedValue::PlainUnpacked(c) | PackedValue::PlainBatched(c) => {
                c.iter().map(|pt| capability.decode(pt)).collect()
            }
            PackedValue::CipherUnpacked(c) | PackedValue::CipherBatched(c) => c
                .iter()
                .map(|ct| capability.decrypt(ct).map(|pt| capability.decode(&pt)))
                .collect::<Result<_, EncodingError>>()?,
        };

        let strides = row_major_strides(self.layout.dims());
        let mut coord = vec![0; self.layout.dims().len()];
        let mut out = vec![0.0; self.layout.element_count()];
        for (container, lanes) in decoded.iter().enumerate() {
            for (slot, value) in lanes.iter().enumerate() {
                self.layout
                    .to_logical_into(PhysicalAddress { container, slot }, &mut coord)?;
                out[flat_index(&coord, &strides)] = *value;
            }
        }
        Ok(out)
    }

    /// Encoded containers, for plaintext handles only.
    #[must_use]
    pub fn plaintexts(&self) -> Option<&[Plaintext]> {
        self.value.plaintexts()
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    #[must_use]
    pub fn config(&self) -> TensorConfig {
        self.config
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn value(&self) -> &PackedValue {
        &self.value
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.layout.scheme().slot_count
    }

    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.value.tag()
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.config.encrypted
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.value.container_count()
    }

    /// Lanes of every container, in container order. Ciphertext lanes are
    /// opaque; this exists for inspecting packing, not values.
    #[must_use]
    pub fn lane_counts(&self) -> Vec<usize> {
        self.value.lane_counts()
    }
}

impl std::fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tensor{} {} ({} containers)",
            self.shape(),
            self.config,
            self.container_count()
        )
    }
}
