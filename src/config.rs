use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{error::Error, scheduler::RampPolicy};

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Parameters of one run.
///
/// Build it in code, deserialize it (durations in humantime form: `"30s"`, `"2m"`), or
/// read it from the environment with [`RunConfig::from_env`].
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct RunConfig {
    /// Target population.
    pub users: usize,
    /// Users started (or retired) per second while ramping.
    pub spawn_rate: f64,
    /// Number of worker contexts polling users.
    #[builder(default = default_workers())]
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Scheduler wake-up interval.
    #[builder(default = default_tick())]
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
    #[builder(default = default_stop_timeout())]
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Only used by [`RunController::run`](crate::RunController::run).
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "humantime_serde")]
    pub run_time: Option<Duration>,
    /// Period of the progress summaries logged during
    /// [`RunController::run`](crate::RunController::run).
    #[builder(default, setter(strip_option))]
    #[serde(default, with = "humantime_serde")]
    pub report_interval: Option<Duration>,
    /// Seeds every user's RNG (offset by its id) for reproducible runs.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub seed: Option<u64>,
}

impl RunConfig {
    /// Reads `STAMPEDE_USERS` and `STAMPEDE_SPAWN_RATE` (required), plus
    /// `STAMPEDE_WORKERS`, `STAMPEDE_RUN_TIME`, `STAMPEDE_STOP_TIMEOUT`,
    /// `STAMPEDE_REPORT_INTERVAL` and `STAMPEDE_SEED`.
    pub fn from_env() -> Result<Self, Error> {
        let users = parse_env("STAMPEDE_USERS")?
            .ok_or_else(|| Error::config("STAMPEDE_USERS is not set"))?;
        let spawn_rate = parse_env("STAMPEDE_SPAWN_RATE")?
            .ok_or_else(|| Error::config("STAMPEDE_SPAWN_RATE is not set"))?;

        let config = Self {
            users,
            spawn_rate,
            workers: parse_env("STAMPEDE_WORKERS")?.unwrap_or_else(default_workers),
            tick: default_tick(),
            stop_timeout: duration_env("STAMPEDE_STOP_TIMEOUT")?
                .unwrap_or_else(default_stop_timeout),
            run_time: duration_env("STAMPEDE_RUN_TIME")?,
            report_interval: duration_env("STAMPEDE_REPORT_INTERVAL")?,
            seed: parse_env("STAMPEDE_SEED")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.users == 0 {
            return Err(Error::config("users must be at least 1"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.tick.is_zero() {
            return Err(Error::config("tick must be non-zero"));
        }
        if self.report_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::config("report interval must be non-zero"));
        }
        self.ramp_policy().validate()
    }

    pub fn ramp_policy(&self) -> RampPolicy {
        RampPolicy {
            target: self.users,
            spawn_rate: self.spawn_rate,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, Error> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{key}={raw:?} is not valid"))),
        Err(_) => Ok(None),
    }
}

fn duration_env(key: &str) -> Result<Option<Duration>, Error> {
    match std::env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|err| Error::config(format!("{key}={raw:?}: {err}"))),
        Err(_) => Ok(None),
    }
}
