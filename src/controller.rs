//! Run Controller: the public lifecycle of a load run.
//!
//! ```text
//! Idle --start--> Ramping --target reached--> Steady
//!                    ^                          |
//!                    +----------ramp------------+
//! Ramping | Steady --stop--> Stopping --all users stopped--> Stopped --reset--> Idle
//! ```
//!
//! `stop` on an idle or already stopped run is a no-op. Statistics stay readable in
//! every state; once the run is `Stopped` the measurement window is frozen and repeated
//! snapshots are identical.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    config::RunConfig,
    error::Error,
    report::Snapshot,
    scenario::Scenario,
    scheduler::{RampPolicy, SchedulerHandle, SchedulerSetup, StopReport, UserScheduler},
    stats::StatsAggregator,
    user::{Population, PopulationSnapshot},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Ramping,
    Steady,
    Stopping,
    Stopped,
}

pub struct RunController {
    scenario: Scenario,
    stats: Arc<StatsAggregator>,
    population: Arc<Population>,
    state: Arc<watch::Sender<RunState>>,
    scheduler: Option<SchedulerHandle>,
}

impl RunController {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            stats: Arc::new(StatsAggregator::new()),
            population: Arc::new(Population::new()),
            state: Arc::new(watch::Sender::new(RunState::Idle)),
            scheduler: None,
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn population(&self) -> PopulationSnapshot {
        self.population.snapshot()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.stats.snapshot()
    }

    /// Shared handle on the live aggregator, for custom reporting loops.
    pub fn stats(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.stats)
    }

    /// Validate everything, then begin ramping toward `config.users`.
    ///
    /// Must be called from within a tokio runtime. Only valid while `Idle`; a stopped
    /// run has to be [`reset`](Self::reset) first.
    pub fn start(&mut self, config: &RunConfig) -> Result<(), Error> {
        self.expect_state("start", &[RunState::Idle])?;
        config.validate()?;
        let scenario = Arc::new(self.scenario.load()?);

        tracing::info!(
            "Starting scenario: {} ({} users at {}/s on {} workers)",
            scenario.name,
            config.users,
            config.spawn_rate,
            config.workers
        );
        self.stats.open_window();
        self.state.send_replace(RunState::Ramping);
        let setup = SchedulerSetup {
            scenario,
            stats: Arc::clone(&self.stats),
            population: Arc::clone(&self.population),
            run_state: Arc::clone(&self.state),
            workers: config.workers,
            tick: config.tick,
            seed: config.seed,
        };
        self.scheduler = Some(UserScheduler::spawn(setup, config.ramp_policy()));
        Ok(())
    }

    /// Change the target population mid-run, up or down.
    pub fn ramp(&mut self, target: usize, spawn_rate: f64) -> Result<(), Error> {
        self.expect_state("ramp", &[RunState::Ramping, RunState::Steady])?;
        let policy = RampPolicy::new(target, spawn_rate)?;
        let state = self.state();
        let Some(scheduler) = &self.scheduler else {
            return Err(Error::InvalidState {
                operation: "ramp",
                state,
            });
        };
        // the scheduler flips back to Steady once the new target is reached
        self.state.send_replace(RunState::Ramping);
        if scheduler.ramp(policy) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation: "ramp",
                state,
            })
        }
    }

    /// Signal every user to stop and wait up to `timeout` for them to finish.
    ///
    /// Users still busy at the deadline are terminated and counted in
    /// [`StopReport::stop_timeouts`]. Returns once the run is `Stopped`.
    pub async fn stop(&mut self, timeout: Duration) -> Result<StopReport, Error> {
        let Some(scheduler) = self.scheduler.take() else {
            return Ok(StopReport::default());
        };
        self.state.send_replace(RunState::Stopping);
        let report = scheduler.stop(timeout).await;

        self.stats.close_window();
        self.state.send_replace(RunState::Stopped);
        let report = report?;
        tracing::info!("Done running scenario: {}!", self.scenario.name);
        Ok(report)
    }

    /// Clear statistics and counters so the controller can be started again.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.expect_state("reset", &[RunState::Idle, RunState::Stopped])?;
        self.stats.reset();
        self.population.reset();
        self.state.send_replace(RunState::Idle);
        Ok(())
    }

    /// Start, hold for `config.run_time`, stop, and return the final snapshot.
    ///
    /// Logs a one-line summary every `config.report_interval` while running.
    pub async fn run(&mut self, config: &RunConfig) -> Result<Snapshot, Error> {
        let run_time = config
            .run_time
            .ok_or_else(|| Error::config("run_time is required for a timed run"))?;
        self.start(config)?;

        let deadline = tokio::time::sleep(run_time);
        tokio::pin!(deadline);
        match config.report_interval {
            Some(period) => {
                let first = tokio::time::Instant::now() + period;
                let mut reports = tokio::time::interval_at(first, period);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        _ = reports.tick() => {
                            let pop = self.population();
                            tracing::info!(
                                "[{:?}] {} users running | {}",
                                self.state(),
                                pop.running,
                                self.snapshot().summary()
                            );
                        }
                    }
                }
            }
            None => deadline.await,
        }

        let report = self.stop(config.stop_timeout).await?;
        if report.stop_timeouts > 0 {
            tracing::warn!("{} users had to be terminated.", report.stop_timeouts);
        }
        Ok(self.snapshot())
    }

    fn expect_state(&self, operation: &'static str, allowed: &[RunState]) -> Result<(), Error> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        // dropping the handle closes the command channel; the scheduler then
        // takes every user down on its own
        if self.scheduler.is_some() {
            tracing::warn!("Run controller dropped while running, users are being terminated.");
        }
    }
}
