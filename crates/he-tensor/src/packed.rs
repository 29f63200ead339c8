use he_encoding::{Ciphertext, EncodingCapability, LaneContainer, Plaintext};

/// Storage of one tensor, tagged by encryption status and packing.
///
/// The tag is fixed when the value is built; operators dispatch on it and
/// never on container contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackedValue {
    PlainUnpacked(Vec<Plaintext>),
    PlainBatched(Vec<Plaintext>),
    CipherUnpacked(Vec<Ciphertext>),
    CipherBatched(Vec<Ciphertext>),
}

impl PackedValue {
    #[must_use]
    pub fn from_plaintexts(batched: bool, containers: Vec<Plaintext>) -> Self {
        if batched {
            Self::PlainBatched(containers)
        } else {
            Self::PlainUnpacked(containers)
        }
    }

    #[must_use]
    pub fn from_ciphertexts(batched: bool, containers: Vec<Ciphertext>) -> Self {
        if batched {
            Self::CipherBatched(containers)
        } else {
            Self::CipherUnpacked(containers)
        }
    }

    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PlainUnpacked(_) => "plain_unpacked",
            Self::PlainBatched(_) => "plain_batched",
            Self::CipherUnpacked(_) => "cipher_unpacked",
            Self::CipherBatched(_) => "cipher_batched",
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::CipherUnpacked(_) | Self::CipherBatched(_))
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        matches!(self, Self::PlainBatched(_) | Self::CipherBatched(_))
    }

    #[must_use]
    pub fn plaintexts(&self) -> Option<&[Plaintext]> {
        match self {
            Self::PlainUnpacked(c) | Self::PlainBatched(c) => Some(c.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn ciphertexts(&self) -> Option<&[Ciphertext]> {
        match self {
            Self::CipherUnpacked(c) | Self::CipherBatched(c) => Some(c.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        match self {
            Self::PlainUnpacked(c) | Self::PlainBatched(c) => c.len(),
            Self::CipherUnpacked(c) | Self::CipherBatched(c) => c.len(),
        }
    }

    #[must_use]
    pub fn lane_counts(&self) -> Vec<usize> {
        match self {
            Self::PlainUnpacked(c) | Self::PlainBatched(c) => {
                c.iter().map(|container| container.lane_count()).collect()
            }
            Self::CipherUnpacked(c) | Self::CipherBatched(c) => {
                c.iter().map(|container| container.lane_count()).collect()
            }
        }
    }

    /// Ciphertext containers for this value, encrypting plaintext containers
    /// one by one. Layout and tag packing are unchanged.
    #[must_use]
    pub fn to_ciphertexts(&self, capability: &dyn EncodingCapability) -> Vec<Ciphertext> {
        match self {
            Self::PlainUnpacked(c) | Self::PlainBatched(c) => {
                c.iter().map(|pt| capability.encrypt(pt)).collect()
            }
            Self::CipherUnpacked(c) | Self::CipherBatched(c) => c.clone(),
        }
    }
}
