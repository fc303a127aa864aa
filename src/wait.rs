use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Error;

/// Pacing between two task iterations of a virtual user.
///
/// Each decision draws uniformly from `[min_seconds, max_seconds]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl WaitPolicy {
    pub fn between(min_seconds: f64, max_seconds: f64) -> Result<Self, Error> {
        let policy = Self {
            min_seconds,
            max_seconds,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Fixed pause of `seconds` between iterations.
    pub fn constant(seconds: f64) -> Result<Self, Error> {
        Self::between(seconds, seconds)
    }

    /// No pause at all.
    pub fn none() -> Self {
        Self {
            min_seconds: 0.0,
            max_seconds: 0.0,
        }
    }

    /// `STAMPEDE_WAIT_MIN` / `STAMPEDE_WAIT_MAX` (seconds), falling back to `default`
    /// for whichever is unset.
    pub fn from_env(default: WaitPolicy) -> Result<Self, Error> {
        let read = |key: &str, fallback: f64| -> Result<f64, Error> {
            match std::env::var(key) {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(format!("{key}={raw:?} is not a number"))),
                Err(_) => Ok(fallback),
            }
        };
        Self::between(
            read("STAMPEDE_WAIT_MIN", default.min_seconds)?,
            read("STAMPEDE_WAIT_MAX", default.max_seconds)?,
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        let finite = self.min_seconds.is_finite() && self.max_seconds.is_finite();
        if !finite || self.min_seconds < 0.0 || self.min_seconds > self.max_seconds {
            return Err(Error::config(format!(
                "wait policy needs 0 <= min <= max, got min={} max={}",
                self.min_seconds, self.max_seconds
            )));
        }
        if Duration::try_from_secs_f64(self.max_seconds).is_err() {
            return Err(Error::config(format!(
                "wait policy max={} does not fit in a Duration",
                self.max_seconds
            )));
        }
        Ok(())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let secs = if self.max_seconds <= self.min_seconds {
            self.min_seconds
        } else {
            rng.random_range(self.min_seconds..=self.max_seconds)
        };
        // only reachable by bypassing `validate` through the public fields
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Cooperative suspend: sleeps for `duration` unless the stop flag flips first.
///
/// Returns `true` when the full duration elapsed, `false` when asked to stop.
pub(crate) async fn pause(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    if duration.is_zero() {
        // still yield so a zero-wait user cannot starve its worker context
        tokio::task::yield_now().await;
        return !*stop.borrow();
    }
    let slept = tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.wait_for(|s| *s) => false,
    };
    slept && !*stop.borrow()
}
