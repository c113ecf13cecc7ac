//! Seeded RNG wrapper for reproducible behavior.
//!
//! Shared by detector noise and random failure injection so a single seed
//! reproduces a whole simulated run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded RNG wrapper for reproducible random behavior
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Returns true with probability `rate` (clamped to 0..=1).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform noise in `[-amplitude, amplitude)`.
    pub fn noise(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..amplitude)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_noise_is_reproducible() {
        let a = MockRng::new(Some(7));
        let b = MockRng::new(Some(7));
        for _ in 0..16 {
            assert_eq!(a.noise(0.1), b.noise(0.1));
        }
    }

    #[test]
    fn noise_is_bounded() {
        let rng = MockRng::new(Some(1));
        for _ in 0..1000 {
            assert!(rng.noise(0.25).abs() <= 0.25);
        }
        assert_eq!(rng.noise(0.0), 0.0);
    }

    #[test]
    fn failure_rate_extremes() {
        let rng = MockRng::new(Some(3));
        assert!(!rng.should_fail(0.0));
        assert!(rng.should_fail(1.0));
    }
}
