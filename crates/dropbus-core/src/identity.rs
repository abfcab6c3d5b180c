/*!
 * Randomness sources used for address allocation.
 */
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// A source of random bytes
pub trait RandomSource: Send {
    /// Draw the next random byte
    fn next_byte(&mut self) -> u8;
}

/// Random source backed by the `rand` standard generator
#[derive(Debug)]
pub struct StdRandom(StdRng);

impl StdRandom {
    /// Seed from operating system entropy
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    /// Deterministic generator, for simulations and tests
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for StdRandom {
    fn next_byte(&mut self) -> u8 {
        (self.0.next_u32() & 0xff) as u8
    }
}

/// Replays a fixed script of bytes, then falls back to a seeded generator
#[derive(Debug)]
pub struct ScriptedRandom {
    script: VecDeque<u8>,
    fallback: StdRandom,
}

impl ScriptedRandom {
    /// Create a scripted source
    pub fn new<I: IntoIterator<Item = u8>>(script: I) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: StdRandom::seeded(0x5eed),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn next_byte(&mut self) -> u8 {
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.next_byte())
    }
}
