//! Deterministic "human" jitter applied to typing delays.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Ceiling used by the jitter function when no explicit one is configured.
pub const DEFAULT_MAX_DELAY: f64 = 1.0;

/// Jitter parameters; the random source is supplied by the caller so each
/// effect instance owns its own seeded generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    amount: f64,
    max_delay: f64,
    cap_to_max: bool,
}

impl Jitter {
    pub fn new(amount: f64, max_delay: f64, cap_to_max: bool) -> Result<Self> {
        if !(0.0..=1.0).contains(&amount) {
            return Err(Error::precondition(
                "jitter",
                format!("jitter must be within [0, 1], got {amount}"),
            ));
        }
        if !max_delay.is_finite() || max_delay < 0.0 {
            return Err(Error::precondition(
                "jitter",
                format!("max_delay must be a non-negative number, got {max_delay}"),
            ));
        }
        Ok(Self {
            amount,
            max_delay,
            cap_to_max,
        })
    }

    /// Perturb a delay (seconds) with one uniform draw.
    ///
    /// Below 0.5 the delay is scaled by a factor in `[1 - amount, 1 + amount)`.
    /// Otherwise a delay already above `max_delay` is capped (when
    /// `cap_to_max`) or kept, and a shorter one moves towards `max_delay` by a
    /// mix in `[-amount, amount)`.
    pub fn apply<R: Rng>(&self, delay: f64, rng: &mut R) -> f64 {
        let draw: f64 = rng.random();
        let out = if draw < 0.5 {
            delay * (1.0 + self.amount * (4.0 * draw - 1.0))
        } else if delay > self.max_delay {
            if self.cap_to_max { self.max_delay } else { delay }
        } else {
            let mix = self.amount * (4.0 * draw - 3.0);
            delay + (self.max_delay - delay) * mix
        };
        out.max(0.0)
    }
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
