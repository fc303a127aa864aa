//! User Scheduler: grows and shrinks the virtual-user population.
//!
//! The scheduler is a single tokio task that owns every user handle. It wakes every
//! `tick`, works out how many users to add or retire this tick with
//! [`calc_spawn_batch`] (counted from the start of the ramp, so `spawn_rate` holds for
//! any tick length), and moves the population one batch closer to the target.
//!
//! Users are polled by a fixed pool of worker contexts (see `worker`). A new user goes
//! to the least-loaded worker and ramp-down retires users from the most-loaded one,
//! so no worker ever holds more than `ceil(active / workers)` users.
//!
//! # Stopping
//!
//! Stop is two-phase: every user gets its stop flag raised and is given until the
//! shared deadline to finish its current task and `on_stop` hook. Users still running
//! at the deadline are aborted (dropping their client) and counted as stop timeouts.

mod ramp;
mod worker;

use std::{sync::Arc, time::Duration};

use futures::{
    FutureExt,
    future::{AbortHandle, Abortable},
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::{
    controller::RunState,
    scenario::{LoadedScenario, ProfileRotation},
    stats::StatsAggregator,
    user::{Population, UserState, UserStatus, VirtualUser},
};
use worker::WorkerContext;

pub use ramp::RampPolicy;
#[cfg(feature = "internals")]
pub use ramp::{MAX_BATCH, calc_spawn_batch};
#[cfg(not(feature = "internals"))]
use ramp::calc_spawn_batch;

/// Time given to worker contexts to drop their users once every user has stopped or
/// been aborted.
const WORKER_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a stop request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Users that reached `Stopped` on their own before the deadline.
    pub stopped: usize,
    /// Users that were forcibly terminated at the deadline.
    pub stop_timeouts: usize,
}

pub(crate) enum Command {
    Ramp(RampPolicy),
    Stop {
        timeout: Duration,
        reply: oneshot::Sender<StopReport>,
    },
}

/// Controller-side handle on a running scheduler task.
pub(crate) struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub(crate) fn ramp(&self, policy: RampPolicy) -> bool {
        self.commands.send(Command::Ramp(policy)).is_ok()
    }

    pub(crate) async fn stop(
        self,
        timeout: Duration,
    ) -> Result<StopReport, tokio::task::JoinError> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::Stop { timeout, reply });
        match response.await {
            Ok(report) => {
                self.task.await?;
                Ok(report)
            }
            // the scheduler went away without answering: surface its panic, if any
            Err(_) => self.task.await.map(|()| StopReport::default()),
        }
    }
}

/// Everything the scheduler needs from the controller.
pub(crate) struct SchedulerSetup {
    pub scenario: Arc<LoadedScenario>,
    pub stats: Arc<StatsAggregator>,
    pub population: Arc<Population>,
    pub run_state: Arc<watch::Sender<RunState>>,
    pub workers: usize,
    pub tick: Duration,
    pub seed: Option<u64>,
}

struct UserHandle {
    id: usize,
    worker: usize,
    status: Arc<UserStatus>,
    stop: watch::Sender<bool>,
    abort: AbortHandle,
}

impl UserHandle {
    fn is_live(&self) -> bool {
        self.status.current() != UserState::Stopped
    }
}

pub(crate) struct UserScheduler {
    scenario: Arc<LoadedScenario>,
    stats: Arc<StatsAggregator>,
    population: Arc<Population>,
    run_state: Arc<watch::Sender<RunState>>,
    seed: Option<u64>,
    rotation: ProfileRotation,
    workers: Vec<WorkerContext>,
    /// Users counted toward the target, including ones that failed to start.
    users: Vec<UserHandle>,
    /// Users asked to stop by a ramp-down that have not finished yet.
    retiring: Vec<UserHandle>,
    policy: RampPolicy,
    ramping: bool,
    /// When the current ramp began, and how many users it has added or retired.
    ramp_started: Instant,
    ramp_done: usize,
    ticker: Interval,
    next_id: usize,
}

impl UserScheduler {
    /// Spawn the scheduler task and its worker contexts, ramping toward `policy`.
    pub(crate) fn spawn(setup: SchedulerSetup, policy: RampPolicy) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self::new(setup, policy);
        SchedulerHandle {
            commands: tx,
            task: tokio::spawn(scheduler.run(rx)),
        }
    }

    fn new(setup: SchedulerSetup, policy: RampPolicy) -> Self {
        let SchedulerSetup {
            scenario,
            stats,
            population,
            run_state,
            workers,
            tick,
            seed,
        } = setup;
        tracing::info!("Spawning {workers} worker contexts...");
        let workers = (0..workers.max(1)).map(WorkerContext::spawn).collect();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            rotation: scenario.rotation(),
            scenario,
            stats,
            population,
            run_state,
            seed,
            workers,
            users: Vec::new(),
            retiring: Vec::new(),
            policy,
            ramping: true,
            ramp_started: Instant::now(),
            ramp_done: 0,
            ticker,
            next_id: 1,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // the first tick completes immediately
        self.ticker.tick().await;
        self.ramp_started = Instant::now();
        self.tick();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Ramp(policy)) => self.retarget(policy),
                    Some(Command::Stop { timeout, reply }) => {
                        let report = self.stop_all(timeout).await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        // controller dropped without stopping: take everyone down now
                        self.stop_all(Duration::ZERO).await;
                        return;
                    }
                },
                _ = self.ticker.tick(), if self.ramping => self.tick(),
            }
        }
    }

    fn retarget(&mut self, policy: RampPolicy) {
        tracing::info!(
            "Ramping from {} to {} users at {}/s.",
            self.users.len(),
            policy.target,
            policy.spawn_rate
        );
        self.policy = policy;
        self.ramping = true;
        self.ramp_started = Instant::now();
        self.ramp_done = 0;
        self.ticker.reset();
        self.run_state.send_if_modified(|state| {
            if *state == RunState::Steady {
                *state = RunState::Ramping;
                true
            } else {
                false
            }
        });
        // a target equal to the current size is reached immediately
        self.settle();
    }

    fn tick(&mut self) {
        let elapsed = self.ramp_started.elapsed();
        self.retiring.retain(UserHandle::is_live);

        let current = self.users.len();
        let target = self.policy.target;
        if current != target {
            let batch = calc_spawn_batch(self.policy.spawn_rate, elapsed, self.ramp_done);
            let count = batch.min(current.abs_diff(target));
            self.ramp_done += count;
            if current < target {
                self.spawn_users(count);
            } else {
                self.retire_users(count);
            }
        }
        self.settle();
    }

    /// Switch to `Steady` once the population matches the target.
    fn settle(&mut self) {
        if self.users.len() != self.policy.target {
            return;
        }
        self.ramping = false;
        let reached = self.run_state.send_if_modified(|state| {
            if *state == RunState::Ramping {
                *state = RunState::Steady;
                true
            } else {
                false
            }
        });
        if reached {
            tracing::info!("Ramp complete: {} users.", self.users.len());
        }
    }

    /// Live users per worker context, including ones still retiring.
    fn worker_loads(&self) -> Vec<usize> {
        self.loads_of(self.users.iter().chain(&self.retiring))
    }

    fn loads_of<'a>(&self, handles: impl Iterator<Item = &'a UserHandle>) -> Vec<usize> {
        let mut loads = vec![0; self.workers.len()];
        for handle in handles.filter(|h| h.is_live()) {
            loads[handle.worker] += 1;
        }
        loads
    }

    fn spawn_users(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let mut loads = self.worker_loads();
        for _ in 0..count {
            let worker = least_loaded(&loads);
            loads[worker] += 1;
            self.spawn_user(worker);
        }
        tracing::debug!("Spawned {count} users ({} total).", self.users.len());
    }

    fn spawn_user(&mut self, worker: usize) {
        let id = self.next_id;
        self.next_id += 1;

        let (stop_tx, stop_rx) = watch::channel(false);
        let status = UserStatus::new(Arc::clone(&self.population));
        let user = VirtualUser {
            id,
            profile: self.rotation.next(),
            host: Arc::clone(&self.scenario.host),
            connector: Arc::clone(&self.scenario.connector),
            stats: Arc::clone(&self.stats),
            status: Arc::clone(&status),
            stop: stop_rx,
            seed: self.seed,
            request_timeout: self.scenario.request_timeout,
        };
        let (abort, registration) = AbortHandle::new_pair();
        let future = Abortable::new(user.run(), registration)
            .map(|_| ())
            .boxed();

        if self.workers[worker].assign(future).is_err() {
            tracing::error!("Worker {worker} is gone, user {id} never ran.");
            self.population.start_failed();
            status.advance(UserState::Stopped);
        }
        self.users.push(UserHandle {
            id,
            worker,
            status,
            stop: stop_tx,
            abort,
        });
    }

    fn retire_users(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        for _ in 0..count {
            let Some(index) = self.pick_retiree() else {
                break;
            };
            let handle = self.users.remove(index);
            let _ = handle.stop.send(true);
            if handle.is_live() {
                self.retiring.push(handle);
            }
        }
        tracing::debug!("Retiring users, {} remain.", self.users.len());
    }

    /// Prefer users that already stopped (failed starts), then the newest user on the
    /// most-loaded worker.
    fn pick_retiree(&self) -> Option<usize> {
        if let Some(index) = self.users.iter().rposition(|h| !h.is_live()) {
            return Some(index);
        }
        // retiring users are already on their way out
        let loads = self.loads_of(self.users.iter());
        let busiest = most_loaded(&loads);
        self.users
            .iter()
            .rposition(|h| h.worker == busiest)
            .or_else(|| self.users.len().checked_sub(1))
    }

    async fn stop_all(mut self, timeout: Duration) -> StopReport {
        let deadline = Instant::now() + timeout;
        let handles: Vec<UserHandle> = self
            .users
            .drain(..)
            .chain(self.retiring.drain(..))
            .collect();
        tracing::info!("Stopping {} users (timeout {timeout:?})...", handles.len());
        for handle in &handles {
            let _ = handle.stop.send(true);
        }

        let mut report = StopReport::default();
        for handle in handles {
            let mut state = handle.status.subscribe();
            let finished = tokio::time::timeout_at(
                deadline,
                state.wait_for(|s| *s == UserState::Stopped),
            )
            .await
            .is_ok();

            if finished {
                report.stopped += 1;
            } else {
                tracing::warn!("User {} did not stop in time, terminating it.", handle.id);
                handle.abort.abort();
                handle.status.advance(UserState::Stopped);
                self.population.stop_timed_out();
                report.stop_timeouts += 1;
            }
        }

        for worker in self.workers.drain(..) {
            worker.shutdown(WORKER_DRAIN_GRACE).await;
        }
        tracing::info!(
            "All users stopped ({} cleanly, {} terminated).",
            report.stopped,
            report.stop_timeouts
        );
        report
    }
}

fn least_loaded(loads: &[usize]) -> usize {
    loads
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| **load)
        .map_or(0, |(i, _)| i)
}

fn most_loaded(loads: &[usize]) -> usize {
    loads
        .iter()
        .enumerate()
        .max_by_key(|(_, load)| **load)
        .map_or(0, |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        error::ActionResult,
        scenario::{Scenario, UserProfile},
        task::{TaskSetSpec, TaskSpec},
        test_support::MockConnector,
        user::UserContext,
        wait::WaitPolicy,
    };

    fn browse(ctx: &mut UserContext) -> BoxFuture<'_, ActionResult> {
        Box::pin(async move {
            ctx.request("GET /", crate::client::Request::get("/")).await?;
            Ok(())
        })
    }

    fn setup(workers: usize) -> (SchedulerSetup, Arc<Population>, watch::Receiver<RunState>) {
        let scenario = Scenario::builder()
            .name("sched")
            .host("http://h")
            .profiles(vec![
                UserProfile::new(
                    "browser",
                    TaskSetSpec::weighted().task(TaskSpec::new("GET /", browse)),
                )
                .with_wait(WaitPolicy::constant(1.0).unwrap()),
            ])
            .connector(Arc::new(MockConnector::ok()))
            .build();
        let population = Arc::new(Population::new());
        let run_state = Arc::new(watch::Sender::new(RunState::Ramping));
        let state_rx = run_state.subscribe();
        let setup = SchedulerSetup {
            scenario: Arc::new(scenario.load().unwrap()),
            stats: Arc::new(StatsAggregator::new()),
            population: Arc::clone(&population),
            run_state,
            workers,
            tick: Duration::from_millis(100),
            seed: Some(7),
        };
        (setup, population, state_rx)
    }

    fn assert_balanced(scheduler: &UserScheduler) {
        let loads = scheduler.worker_loads();
        let total: usize = loads.iter().sum();
        let bound = total.div_ceil(loads.len());
        assert!(loads.iter().all(|&l| l <= bound), "{loads:?} exceeds {bound}");
    }

    #[test]
    fn least_and_most_loaded_break_ties_deterministically() {
        assert_eq!(least_loaded(&[2, 1, 1]), 1);
        assert_eq!(most_loaded(&[3, 1, 3]), 2);
        assert_eq!(least_loaded(&[]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_stay_balanced_through_ramps() {
        let (setup, population, _state) = setup(3);
        let mut scheduler = UserScheduler::new(setup, RampPolicy::new(10, f64::INFINITY).unwrap());

        scheduler.tick();
        assert_eq!(scheduler.users.len(), 10);
        assert_balanced(&scheduler);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(population.snapshot().running, 10);

        scheduler.retarget(RampPolicy::new(4, f64::INFINITY).unwrap());
        scheduler.tick();
        assert_eq!(scheduler.users.len(), 4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.tick();
        assert_balanced(&scheduler);
        assert_eq!(population.snapshot().running, 4);

        scheduler.retarget(RampPolicy::new(11, f64::INFINITY).unwrap());
        scheduler.tick();
        assert_balanced(&scheduler);

        let report = scheduler.stop_all(Duration::from_secs(5)).await;
        assert_eq!(report.stopped, 11);
        assert_eq!(population.snapshot().stopped, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn each_tick_spawns_the_users_due_in_its_window() {
        let (setup, _population, _state) = setup(2);
        let mut scheduler = UserScheduler::new(setup, RampPolicy::new(10, 5.0).unwrap());
        let mut sizes = Vec::new();
        for _ in 0..21 {
            scheduler.tick();
            sizes.push(scheduler.users.len());
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        // the tick at 0.9s already holds the fifth user, the one at 1.9s the tenth
        assert_eq!(sizes[0], 0);
        assert_eq!(sizes[9], 5);
        assert_eq!(sizes[19], 10);
        assert!(!scheduler.ramping);

        scheduler.retarget(RampPolicy::new(4, 2.0).unwrap());
        tokio::time::advance(Duration::from_millis(500)).await;
        scheduler.tick();
        assert_eq!(scheduler.users.len(), 9);
        scheduler.stop_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reaches_steady_at_target() {
        let (setup, population, mut state) = setup(2);
        let handle = UserScheduler::spawn(setup, RampPolicy::new(6, 10.0).unwrap());

        state.wait_for(|s| *s == RunState::Steady).await.unwrap();
        let pop = population.snapshot();
        assert_eq!(pop.starting + pop.running, 6);

        let report = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.stopped, 6);
        assert_eq!(report.stop_timeouts, 0);
    }
}
