use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Upper bound for users spawned in one tick, so huge rates never overflow.
pub const MAX_BATCH: usize = usize::MAX >> 3;

const DUE_EPSILON: f64 = 1e-9;

/// Where the population should go and how fast.
///
/// `spawn_rate` is users per second and applies to ramp-up and ramp-down alike.
/// `f64::INFINITY` means "all at once".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RampPolicy {
    pub target: usize,
    pub spawn_rate: f64,
}

impl RampPolicy {
    pub fn new(target: usize, spawn_rate: f64) -> Result<Self, Error> {
        let policy = Self { target, spawn_rate };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.spawn_rate.is_nan() || self.spawn_rate <= 0.0 {
            return Err(Error::config(format!(
                "spawn rate must be positive, got {}",
                self.spawn_rate
            )));
        }
        Ok(())
    }
}

/// Pure function computing how many users to spawn (or retire) this tick.
///
/// A ramp running at `spawn_rate` users/s for `elapsed` owes `ceil(spawn_rate * elapsed)`
/// users in total, `done` of which were already handled. Counting from the ramp start
/// means a tick spawns the users due during the window it opens, and rounding never
/// drifts: 5/s with 100ms ticks has 5 users out at 0.9s and 10 at 1.9s.
pub fn calc_spawn_batch(spawn_rate: f64, elapsed: Duration, done: usize) -> usize {
    if spawn_rate == f64::INFINITY {
        return MAX_BATCH;
    }
    let due_f = spawn_rate * elapsed.as_secs_f64();
    if due_f.is_nan() || due_f <= 0.0 {
        return 0;
    }
    // exact multiples must not round up on float noise
    let nearest = due_f.round();
    let due_f = if (due_f - nearest).abs() <= DUE_EPSILON * nearest.max(1.0) {
        nearest
    } else {
        due_f.ceil()
    };
    if due_f >= MAX_BATCH as f64 {
        return MAX_BATCH;
    }
    (due_f as usize).saturating_sub(done).min(MAX_BATCH)
}
