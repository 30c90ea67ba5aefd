//! Seeded 64-bit digests of 16-byte elements.
//!
//! Both passes derive every bucket and table position from
//! [`SeededHasher::digest`], so the same implementation must be used for a
//! whole run and for later probes. The hasher's [`SeededHasher::NAME`] is
//! recorded in the table manifest for that reason.
//!
//! - [`Xxh3Seeded`] (default): XXH3-64. Fast, well distributed.
//! - [`Sha3Seeded`]: truncated Keccak-256. Slower, for callers that want a
//!   cryptographic primitive underneath.

use crate::types::{Element, Seed, ELEMENT_SIZE, SEED_SIZE};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha3::{Digest, Keccak256};

/// A keyed hash from `(seed, element)` to a uniformly distributed `u64`.
///
/// Implementations are stateless and may be called from any thread.
pub trait SeededHasher: Clone + Send + Sync + 'static {
    /// Stable identifier stored in the manifest.
    const NAME: &'static str;

    fn digest(seed: &Seed, element: &Element) -> u64;
}

/// XXH3-64 keyed by the low half of the seed, with the high half prepended
/// to the input so that all 128 seed bits matter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Xxh3Seeded;

impl SeededHasher for Xxh3Seeded {
    const NAME: &'static str = "xxh3-64";

    #[inline(always)]
    fn digest(seed: &Seed, element: &Element) -> u64 {
        let (lo, hi) = seed.split_at(SEED_SIZE / 2);
        let mut input = [0u8; SEED_SIZE / 2 + ELEMENT_SIZE];
        input[..SEED_SIZE / 2].copy_from_slice(hi);
        input[SEED_SIZE / 2..].copy_from_slice(element);
        xxhash_rust::xxh3::xxh3_64_with_seed(&input, u64_le(lo))
    }
}

/// First 8 bytes of `Keccak256(seed || element)`, little-endian.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha3Seeded;

impl SeededHasher for Sha3Seeded {
    const NAME: &'static str = "keccak256-64";

    #[inline]
    fn digest(seed: &Seed, element: &Element) -> u64 {
        let out: [u8; 32] = Keccak256::new()
            .chain_update(seed)
            .chain_update(element)
            .finalize()
            .into();
        u64_le(&out[..8])
    }
}

#[inline(always)]
fn u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Deterministically derive `hash_n` seeds from a 64-bit RNG seed.
pub fn generate_seeds(hash_n: usize, rng_seed: u64) -> Vec<Seed> {
    let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);
    (0..hash_n).map(|_| rng.random()).collect()
}

/// Lowercase hex rendering of a seed, used in the settings report.
pub fn seed_to_hex(seed: &Seed) -> String {
    seed.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a 32-character hex string into a seed.
pub fn seed_from_hex(s: &str) -> Option<Seed> {
    parse_hex16(s)
}

pub(crate) fn parse_hex16(s: &str) -> Option<[u8; 16]> {
    let s = s.trim();
    if s.len() != 32 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(out)
}
