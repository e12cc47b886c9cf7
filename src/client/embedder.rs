//! Deterministic pseudo-embedder
//!
//! Stands in for a real sentence-embedding model in tests and the CLI. The
//! vector for a text is seeded from its hash, plus smaller per-word
//! components, so texts sharing words land measurably closer in cosine space
//! while the whole mapping stays reproducible across hosts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};

use crate::types::Vector;

const WORD_COMPONENT_SCALE: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct PseudoEmbedder {
    dim: u32,
}

impl PseudoEmbedder {
    pub fn new(dim: u32) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    /// Map text to a unit vector.
    pub fn embed(&self, text: &str) -> Vector {
        let mut vector = self.seeded_noise(text.as_bytes(), 1.0);

        for word in text.to_lowercase().split_whitespace() {
            let component = self.seeded_noise(word.as_bytes(), WORD_COMPONENT_SCALE);
            for (value, delta) in vector.iter_mut().zip(component.iter()) {
                *value += delta;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }

    fn seeded_noise(&self, material: &[u8], scale: f32) -> Vector {
        let digest = Sha256::digest(material);
        let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        let mut rng = StdRng::seed_from_u64(seed);
        (0..self.dim)
            .map(|_| {
                let value: f32 = rng.sample(StandardNormal);
                value * scale
            })
            .collect()
    }
}
