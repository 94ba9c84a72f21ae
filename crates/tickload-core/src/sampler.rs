use fnv::FnvHasher;
use rand::Rng;
use std::hash::Hasher;

/// Decides which responses get their body hashed and compares the result.
///
/// The rate is a probability per response, not a quota: over `n` responses
/// the number checked deviates from `rate * n` by roughly `sqrt(n)`.
#[derive(Debug, Clone, Copy)]
pub struct HashSampler {
    rate: f64,
    expected: u64,
}

impl HashSampler {
    pub fn new(rate: f64, expected: u64) -> Self {
        Self { rate, expected }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Independent draw for one response.
    pub fn should_check<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if !self.is_enabled() {
            return false;
        }
        rng.gen::<f64>() < self.rate
    }

    /// True when `hash` differs from the expected value.
    pub fn mismatch(&self, hash: u64) -> bool {
        hash != self.expected
    }
}

/// FNV-1a 64-bit hash of `data`.
pub fn body_hash(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}
