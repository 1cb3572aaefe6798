use std::{
    cmp,
    time::Duration,
};

use rand::Rng;

/// Jittered exponential backoff state for one failure kind.
///
/// `fail` returns the next delay to sleep; the caller owns the sleeping (and
/// any budget accounting) so this stays usable from both async loops and
/// retry contexts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::Backoff;

    #[test]
    fn test_delay_is_capped() {
        let mut rng = ChaCha12Rng::seed_from_u64(0);
        let max = Duration::from_millis(500);
        let mut backoff = Backoff::new(Duration::from_millis(10), max);
        for _ in 0..64 {
            assert!(backoff.fail(&mut rng) <= max);
        }
        assert_eq!(backoff.failures(), 64);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }
}
