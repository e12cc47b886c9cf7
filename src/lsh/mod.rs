//! Sign-of-random-hyperplane LSH
//!
//! Each client gets `num_tables` hash tables of `hash_size` hyperplanes in
//! `embedding_dim` dimensions. The hash of a vector in table `t` is the
//! integer whose bit `i` is set when the vector lies on the non-negative side
//! of plane `(t, i)`. Near vectors under cosine distance collide in at least
//! one table with high probability.
//!
//! Planes are regenerated from a seed derived from `(server_secret,
//! client_id)`, so the server never has to persist them and any host produces
//! byte-identical planes for the same client.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

const PLANES_MAGIC: &[u8; 4] = b"LSHP";

/// Derive the deterministic plane seed for a client.
pub fn plane_seed(server_secret: &str, client_id: Uuid) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(server_secret.as_bytes());
    hasher.update(client_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Dense matrix of random hyperplanes, shape `(num_tables, hash_size, dim)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LshPlanes {
    num_tables: u32,
    hash_size: u32,
    dim: u32,
    /// Row-major `num_tables * hash_size * dim` values; each `(table, bit)`
    /// row is unit-normalized
    values: Vec<f32>,
}

impl LshPlanes {
    /// Generate planes from a seed. The same `(seed, shape)` yields the same
    /// bytes on any host.
    pub fn generate(num_tables: u32, hash_size: u32, dim: u32, seed: u64) -> Result<Self> {
        if num_tables == 0 || hash_size == 0 || dim == 0 {
            return Err(Error::validation("LSH shape components must be positive"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let row_len = dim as usize;
        let total = num_tables as usize * hash_size as usize * row_len;
        let mut values = Vec::with_capacity(total);

        for _ in 0..(num_tables * hash_size) {
            let mut row: Vec<f32> = (0..row_len).map(|_| rng.sample(StandardNormal)).collect();
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for value in &mut row {
                    *value /= norm;
                }
            }
            values.extend_from_slice(&row);
        }

        Ok(Self {
            num_tables,
            hash_size,
            dim,
            values,
        })
    }

    pub fn num_tables(&self) -> u32 {
        self.num_tables
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    fn row(&self, table: u32, bit: u32) -> &[f32] {
        let row_len = self.dim as usize;
        let start = (table as usize * self.hash_size as usize + bit as usize) * row_len;
        &self.values[start..start + row_len]
    }

    /// Hash a vector into one bucket per table.
    ///
    /// The input is unit-normalized first; bit `i` carries weight `2^i`, so a
    /// client computing the same dot products reproduces the same integers.
    pub fn hash_vector(&self, vector: &[f32]) -> Result<Vec<u32>> {
        if vector.len() != self.dim as usize {
            return Err(Error::validation(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        let scale = if norm > 0.0 { 1.0 / norm } else { 1.0 };

        let mut hashes = Vec::with_capacity(self.num_tables as usize);
        for table in 0..self.num_tables {
            let mut hash = 0u32;
            for bit in 0..self.hash_size {
                let dot: f32 = self
                    .row(table, bit)
                    .iter()
                    .zip(vector.iter())
                    .map(|(p, v)| p * v * scale)
                    .sum();
                if dot >= 0.0 {
                    hash |= 1 << bit;
                }
            }
            hashes.push(hash);
        }

        Ok(hashes)
    }

    /// Serialize to the wire layout: magic, shape header, then f32 LE values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.values.len() * 4);
        out.extend_from_slice(PLANES_MAGIC);
        out.extend_from_slice(&self.num_tables.to_le_bytes());
        out.extend_from_slice(&self.hash_size.to_le_bytes());
        out.extend_from_slice(&self.dim.to_le_bytes());
        for value in &self.values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 16 || &data[..4] != PLANES_MAGIC {
            return Err(Error::validation("malformed LSH plane bytes"));
        }

        let read_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().expect("bounds checked"))
        };
        let num_tables = read_u32(4);
        let hash_size = read_u32(8);
        let dim = read_u32(12);

        let total = num_tables as usize * hash_size as usize * dim as usize;
        if data.len() != 16 + total * 4 {
            return Err(Error::validation(format!(
                "LSH plane payload length mismatch: expected {} values",
                total
            )));
        }

        let values = data[16..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunks of 4")))
            .collect();

        Ok(Self {
            num_tables,
            hash_size,
            dim,
            values,
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::validation(format!("invalid base64 planes: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}
