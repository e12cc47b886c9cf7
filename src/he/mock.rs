//! Deterministic mock codec
//!
//! Stands in for a real CKKS backend in tests and single-machine deployments.
//! "Ciphertexts" carry the plaintext values behind a fixed header plus a
//! sha256 trailer, so inner products are exact and any truncated or modified
//! payload is rejected as corrupt. Offers no confidentiality; the point is
//! that the engine, wire formats, and pipelines behave exactly as they would
//! with an opaque FHE library underneath.

use sha2::{Digest, Sha256};

use super::{EncryptedScalar, EncryptedVector, HeCodec};
use crate::{Error, Result};

const VECTOR_MAGIC: &[u8; 4] = b"MHE1";
const SCALAR_MAGIC: &[u8; 4] = b"MSC1";
const DIGEST_LEN: usize = 32;
/// Scalars pad to a fixed size so result payloads do not leak structure
const SCALAR_LEN: usize = 64;

#[derive(Debug, Default)]
pub struct MockHeCodec;

impl MockHeCodec {
    fn encode(&self, plain: &[f32]) -> Result<EncryptedVector> {
        if plain.is_empty() {
            return Err(Error::validation("cannot encode an empty vector"));
        }

        let mut payload = Vec::with_capacity(8 + plain.len() * 4 + DIGEST_LEN);
        payload.extend_from_slice(VECTOR_MAGIC);
        payload.extend_from_slice(&(plain.len() as u32).to_le_bytes());
        for value in plain {
            payload.extend_from_slice(&value.to_le_bytes());
        }

        let digest = Sha256::digest(&payload);
        payload.extend_from_slice(&digest);

        Ok(EncryptedVector::from_bytes(payload))
    }

    fn decode(&self, enc: &EncryptedVector) -> Result<Vec<f32>> {
        let data = enc.as_bytes();
        if data.len() < 8 + DIGEST_LEN || &data[..4] != VECTOR_MAGIC {
            return Err(Error::corrupt("not a mock ciphertext"));
        }

        let dim = u32::from_le_bytes(data[4..8].try_into().expect("bounds checked")) as usize;
        let expected_len = 8 + dim * 4 + DIGEST_LEN;
        if data.len() != expected_len {
            return Err(Error::corrupt(format!(
                "ciphertext length mismatch: expected {} bytes, got {}",
                expected_len,
                data.len()
            )));
        }

        let (body, trailer) = data.split_at(data.len() - DIGEST_LEN);
        let digest = Sha256::digest(body);
        if digest.as_slice() != trailer {
            return Err(Error::corrupt("ciphertext integrity check failed"));
        }

        Ok(body[8..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunks of 4")))
            .collect())
    }
}

impl HeCodec for MockHeCodec {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn encode_vector(&self, plain: &[f32]) -> Result<EncryptedVector> {
        self.encode(plain)
    }

    fn encode_query(&self, plain: &[f32]) -> Result<EncryptedVector> {
        self.encode(plain)
    }

    fn inner_product(&self, a: &EncryptedVector, b: &EncryptedVector) -> Result<EncryptedScalar> {
        let left = self.decode(a)?;
        let right = self.decode(b)?;

        if left.len() != right.len() {
            return Err(Error::corrupt(format!(
                "operand dimension mismatch: {} vs {}",
                left.len(),
                right.len()
            )));
        }

        let dot: f32 = left.iter().zip(right.iter()).map(|(x, y)| x * y).sum();

        let mut payload = Vec::with_capacity(SCALAR_LEN);
        payload.extend_from_slice(SCALAR_MAGIC);
        payload.extend_from_slice(&dot.to_le_bytes());
        let digest = Sha256::digest(&payload);
        payload.extend_from_slice(&digest);
        payload.resize(SCALAR_LEN, 0);

        Ok(EncryptedScalar::from_bytes(payload))
    }

    fn decrypt_scalar(&self, enc: &EncryptedScalar) -> Result<f32> {
        let data = enc.as_bytes();
        if data.len() != SCALAR_LEN || &data[..4] != SCALAR_MAGIC {
            return Err(Error::corrupt("not a mock encrypted scalar"));
        }

        let body = &data[..8];
        let digest = Sha256::digest(body);
        if digest.as_slice() != &data[8..8 + DIGEST_LEN] {
            return Err(Error::corrupt("scalar integrity check failed"));
        }

        Ok(f32::from_le_bytes(data[4..8].try_into().expect("bounds checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    #[test]
    fn inner_product_round_trip() {
        let codec = MockHeCodec::default();
        let a = unit(vec![1.0, 2.0, 3.0, 4.0]);
        let b = unit(vec![-2.0, 0.5, 1.0, 3.0]);

        let enc_a = codec.encode_vector(&a).unwrap();
        let enc_b = codec.encode_query(&b).unwrap();

        let scalar = codec.inner_product(&enc_a, &enc_b).unwrap();
        let got = codec.decrypt_scalar(&scalar).unwrap();

        let expected: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn self_similarity_of_unit_vector_is_one() {
        let codec = MockHeCodec::default();
        let v = unit((0..384).map(|i| ((i % 13) as f32) - 6.0).collect());
        let enc = codec.encode_vector(&v).unwrap();
        let score = codec
            .decrypt_scalar(&codec.inner_product(&enc, &enc).unwrap())
            .unwrap();
        assert!((score - 1.0).abs() < 1e-4);
    }

    #[test]
    fn fixed_size_for_fixed_dimension() {
        let codec = MockHeCodec::default();
        let a = codec.encode_vector(&[0.1; 384]).unwrap();
        let b = codec.encode_vector(&[0.9; 384]).unwrap();
        assert_eq!(a.as_bytes().len(), b.as_bytes().len());
    }

    #[test]
    fn tampering_is_detected() {
        let codec = MockHeCodec::default();
        let enc = codec.encode_vector(&[0.5, -0.5]).unwrap();

        let mut bytes = enc.into_bytes();
        bytes[9] ^= 0xff;
        let tampered = EncryptedVector::from_bytes(bytes);

        let err = codec.inner_product(&tampered, &tampered).unwrap_err();
        assert!(matches!(err, Error::CorruptCiphertext(_)));
    }

    #[test]
    fn truncation_is_detected() {
        let codec = MockHeCodec::default();
        let mut bytes = codec.encode_vector(&[0.5; 16]).unwrap().into_bytes();
        bytes.truncate(bytes.len() - 1);
        let truncated = EncryptedVector::from_bytes(bytes);
        assert!(codec
            .inner_product(&truncated, &truncated)
            .is_err());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let codec = MockHeCodec::default();
        let a = codec.encode_vector(&[0.5; 8]).unwrap();
        let b = codec.encode_vector(&[0.5; 16]).unwrap();
        assert!(codec.inner_product(&a, &b).is_err());
    }
}
