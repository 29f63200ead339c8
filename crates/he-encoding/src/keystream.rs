//! Reference capability: fixed-point encoding with per-lane keystream masking.
//!
//! Each encrypted lane carries its own nonce, and its body is the encoded
//! value plus one ChaCha20 keystream word selected by that nonce. Lanes stay
//! decryptable wherever they are moved, which is what lets structural
//! operators relocate single lanes across container boundaries.
//!
//! This is a stand-in for a lattice scheme with the same interface. It has
//! no homomorphic arithmetic and no security claims.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    CipherLane, Ciphertext, EncodingCapability, EncodingError, EncodingParams, Plaintext,
    decode_fixed_point, encode_fixed_point,
};

pub struct KeystreamCodec {
    params: EncodingParams,
    key: [u8; 32],
    key_id: u64,
    next_nonce: AtomicU64,
}

impl KeystreamCodec {
    /// Generate a fresh secret key from `rng`.
    pub fn new<R: RngCore + ?Sized>(params: EncodingParams, rng: &mut R) -> Self {
        let mut key = [0_u8; 32];
        rng.fill_bytes(&mut key);
        Self {
            params,
            key,
            key_id: key_fingerprint(&key),
            next_nonce: AtomicU64::new(0),
        }
    }

    /// Deterministic key for reproducible tests.
    #[must_use]
    pub fn from_seed(params: EncodingParams, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Self::new(params, &mut rng)
    }

    #[must_use]
    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    fn mask(&self, nonce: u64) -> u64 {
        let mut stream = ChaCha20Rng::from_seed(self.key);
        stream.set_stream(nonce);
        stream.next_u64()
    }
}

impl std::fmt::Debug for KeystreamCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystreamCodec")
            .field("params", &self.params)
            .field("key_id", &format_args!("{:016x}", self.key_id))
            .finish_non_exhaustive()
    }
}

impl EncodingCapability for KeystreamCodec {
    fn params(&self) -> &EncodingParams {
        &self.params
    }

    fn encode(&self, values: &[f64]) -> Result<Plaintext, EncodingError> {
        encode_fixed_point(values, &self.params)
    }

    fn decode(&self, plaintext: &Plaintext) -> Vec<f64> {
        decode_fixed_point(plaintext, &self.params)
    }

    fn encrypt(&self, plaintext: &Plaintext) -> Ciphertext {
        let first = self
            .next_nonce
            .fetch_add(plaintext.lanes.len() as u64, Ordering::Relaxed);
        let lanes = plaintext
            .lanes
            .iter()
            .enumerate()
            .map(|(offset, lane)| {
                let nonce = first + offset as u64;
                CipherLane {
                    key_id: self.key_id,
                    nonce,
                    body: (*lane as u64).wrapping_add(self.mask(nonce)),
                }
            })
            .collect();
        Ciphertext { lanes }
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Plaintext, EncodingError> {
        let lanes = ciphertext
            .lanes
            .iter()
            .enumerate()
            .map(|(lane, cipher)| {
                if cipher.key_id != self.key_id {
                    return Err(EncodingError::ForeignCiphertext { lane });
                }
                Ok(cipher.body.wrapping_sub(self.mask(cipher.nonce)) as i64)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Plaintext { lanes })
    }
}

/// Leading eight bytes of the key's SHA-256 digest.
fn key_fingerprint(key: &[u8; 32]) -> u64 {
    let digest = Sha256::digest(key);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::{KeystreamCodec, key_fingerprint};
    use crate::{
        Ciphertext, EncodingCapability, EncodingError, EncodingParams, LaneContainer,
    };
    use proptest::prelude::*;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use sha2::{Digest, Sha256};

    fn codec(seed: u64) -> KeystreamCodec {
        KeystreamCodec::from_seed(EncodingParams::small(4).expect("params"), seed)
    }

    #[test]
    fn encrypt_then_decrypt_recovers_values() {
        let codec = codec(7);
        let values = [6.0, -1.5, 0.25];
        let ct = codec.encrypt(&codec.encode(&values).expect("encode"));
        let decoded = codec.decode(&codec.decrypt(&ct).expect("decrypt"));
        for (decoded, original) in decoded.iter().zip(values) {
            assert!((decoded - original).abs() < 1e-6);
        }
    }

    #[test]
    fn repeated_encryption_uses_fresh_nonces() {
        let codec = codec(7);
        let pt = codec.encode(&[1.0]).expect("encode");
        let a = codec.encrypt(&pt);
        let b = codec.encrypt(&pt);
        assert_ne!(a, b);
    }

    #[test]
    fn ciphertext_lanes_do_not_expose_encoded_values() {
        let codec = codec(11);
        let pt = codec.encode(&[0.0, 0.0, 0.0, 0.0]).expect("encode");
        let ct = codec.encrypt(&pt);
        let bodies = ct.lanes().iter().map(|lane| lane.body).collect::<Vec<_>>();
        assert!(bodies.iter().any(|body| *body != 0));
    }

    #[test]
    fn relocated_lanes_still_decrypt() {
        let codec = codec(3);
        let left = codec.encrypt(&codec.encode(&[1.0, 2.0]).expect("encode"));
        let right = codec.encrypt(&codec.encode(&[3.0, 4.0]).expect("encode"));
        let mixed = Ciphertext::from_lanes(vec![right.lanes()[1], left.lanes()[0]]);
        let decoded = codec.decode(&codec.decrypt(&mixed).expect("decrypt"));
        assert!((decoded[0] - 4.0).abs() < 1e-6);
        assert!((decoded[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn foreign_key_is_rejected() {
        let ct = codec(1).encrypt(&codec(1).encode(&[1.0]).expect("encode"));
        assert_eq!(
            codec(2).decrypt(&ct),
            Err(EncodingError::ForeignCiphertext { lane: 0 })
        );
    }

    #[test]
    fn key_id_is_the_sha256_prefix_of_the_key() {
        let mut key = [0_u8; 32];
        ChaCha20Rng::seed_from_u64(9).fill_bytes(&mut key);
        let digest = Sha256::digest(key);
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);

        assert_eq!(codec(9).key_id(), u64::from_le_bytes(prefix));
        assert_eq!(key_fingerprint(&key), codec(9).key_id());
        assert_ne!(codec(9).key_id(), codec(10).key_id());
    }

    #[test]
    fn debug_output_omits_key_material() {
        let rendered = format!("{:?}", codec(5));
        assert!(rendered.contains("key_id"));
        assert!(!rendered.contains("key:"));
    }

    proptest! {
        #[test]
        fn prop_encrypt_decrypt_round_trip(values in prop::collection::vec(-1.0e6f64..1.0e6, 0..8)) {
            let codec = codec(42);
            let ct = codec.encrypt(&codec.encode(&values).expect("encode"));
            let decoded = codec.decode(&codec.decrypt(&ct).expect("decrypt"));
            prop_assert_eq!(decoded.len(), values.len());
            for (decoded, original) in decoded.iter().zip(&values) {
                prop_assert!((decoded - original).abs() < 1e-6);
            }
        }
    }
}
