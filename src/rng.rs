//! Internal random number generator based on PCG32.
//!
//! Sessions only need randomness for connection magic numbers and
//! synchronization nonces, so a minimal PCG-XSH-RR implementation avoids
//! pulling in the `rand` crate.
//!
//! Reference: <https://www.pcg-random.org/>

use std::time::{SystemTime, UNIX_EPOCH};

/// Standard increment for single-stream PCG32, from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Standard multiplier for 64-bit state PCG.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG32 random number generator. NOT cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from a 64-bit seed.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        // The increment must be odd
        let inc = (PCG_DEFAULT_INCREMENT << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(seed);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator seeded from wall-clock time. Good enough for
    /// nonces and magic numbers.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let addr = {
            let probe = 0u8;
            std::ptr::addr_of!(probe) as u64
        };
        Self::seed_from_u64(nanos ^ addr.rotate_left(32))
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates a nonzero `u16`, as required for connection magic numbers.
    #[must_use]
    pub fn next_magic(&mut self) -> u16 {
        loop {
            let value = self.next_u32() as u16;
            if value != 0 {
                return value;
            }
        }
    }
}
