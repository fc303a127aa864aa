//! Virtual users: one simulated client each.
//!
//! A virtual user connects (one [`RequestClient`] of its own), runs its profile's
//! `on_start` hook once, then loops: pick the next task, run it, draw a pause from the
//! wait policy, suspend. Stopping is cooperative: the stop flag is checked at the top
//! of every iteration and while pausing, never in the middle of a task.
//!
//! Lifecycle transitions only move forward (`Starting → Running → Stopping →
//! Stopped`) and are mirrored into the shared [`Population`] counters.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};

use crate::{
    client::{Connector, Request, RequestClient, Response, TransportError},
    error::ActionError,
    metric::RequestOutcome,
    scenario::LoadedProfile,
    stats::StatsAggregator,
    task::TaskCursor,
    wait::pause,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserState {
    /// Connecting and running `on_start`.
    Starting,
    /// Inside the task loop.
    Running,
    /// Finishing the current task, then running `on_stop`.
    Stopping,
    Stopped,
}

/// Live head-count of virtual users per lifecycle state, plus failure tallies.
#[derive(Debug, Default)]
pub struct Population {
    starting: AtomicUsize,
    running: AtomicUsize,
    stopping: AtomicUsize,
    stopped: AtomicUsize,
    start_failures: AtomicUsize,
    stop_timeouts: AtomicUsize,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, state: UserState) -> &AtomicUsize {
        match state {
            UserState::Starting => &self.starting,
            UserState::Running => &self.running,
            UserState::Stopping => &self.stopping,
            UserState::Stopped => &self.stopped,
        }
    }

    fn shift(&self, from: UserState, to: UserState) {
        self.counter(from).fetch_sub(1, Ordering::AcqRel);
        self.counter(to).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn start_failed(&self) {
        self.start_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stop_timed_out(&self) {
        self.stop_timeouts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.starting,
            &self.running,
            &self.stopping,
            &self.stopped,
            &self.start_failures,
            &self.stop_timeouts,
        ] {
            counter.store(0, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> PopulationSnapshot {
        PopulationSnapshot {
            starting: self.starting.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
            stopping: self.stopping.load(Ordering::Acquire),
            stopped: self.stopped.load(Ordering::Acquire),
            start_failures: self.start_failures.load(Ordering::Acquire),
            stop_timeouts: self.stop_timeouts.load(Ordering::Acquire),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub start_failures: usize,
    pub stop_timeouts: usize,
}

impl PopulationSnapshot {
    /// Users that have not reached `Stopped` yet.
    pub fn active(&self) -> usize {
        self.starting + self.running + self.stopping
    }
}

/// Observable lifecycle state of one user.
///
/// Shared between the user itself and the scheduler, which may force it to `Stopped`
/// after a stop timeout. Updates are atomic with the population counters.
#[derive(Debug)]
pub(crate) struct UserStatus {
    state: watch::Sender<UserState>,
    population: Arc<Population>,
}

impl UserStatus {
    pub(crate) fn new(population: Arc<Population>) -> Arc<Self> {
        population.starting.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            state: watch::Sender::new(UserState::Starting),
            population,
        })
    }

    /// Move forward to `to`; backward or repeated transitions are ignored.
    pub(crate) fn advance(&self, to: UserState) -> bool {
        let population = &self.population;
        self.state.send_if_modified(|current| {
            if to <= *current {
                return false;
            }
            population.shift(*current, to);
            *current = to;
            true
        })
    }

    pub(crate) fn current(&self) -> UserState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<UserState> {
        self.state.subscribe()
    }

    pub(crate) fn population(&self) -> &Population {
        &self.population
    }
}

/// Per-user mutable state handed to every action.
///
/// Owned by exactly one virtual user. Holds the user's request client, a scratch store
/// for values captured along the way (tokens, ids), and the user's own RNG for payload
/// generation.
pub struct UserContext {
    user_id: usize,
    profile: String,
    host: Arc<str>,
    client: Box<dyn RequestClient>,
    stats: Arc<StatsAggregator>,
    store: HashMap<String, Box<dyn Any + Send + Sync>>,
    rng: StdRng,
    task_label: String,
    default_timeout: Option<Duration>,
}

impl UserContext {
    pub(crate) fn new(
        user_id: usize,
        profile: &LoadedProfile,
        host: Arc<str>,
        client: Box<dyn RequestClient>,
        stats: Arc<StatsAggregator>,
        seed: Option<u64>,
        default_timeout: Option<Duration>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(user_id as u64)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            user_id,
            profile: profile.name.clone(),
            host,
            client,
            stats,
            store: HashMap::new(),
            rng,
            task_label: String::new(),
            default_timeout,
        }
    }

    /// 1-based, unique within a run.
    pub fn user_id(&self) -> usize {
        self.user_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Label of the task currently executing (`on_start` / `on_stop` inside hooks).
    pub fn task_label(&self) -> &str {
        &self.task_label
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.store.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.store.get(key)?.downcast_ref()
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.store.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                // wrong type requested: keep the value where it was
                self.store.insert(key.to_owned(), value);
                None
            }
        }
    }

    /// Send `request` and record it under `label` with the default rule: 2xx is a
    /// success, anything else a failure, transport errors are failures too.
    pub async fn request(
        &self,
        label: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        self.request_checked(label, request, |res| {
            if res.is_success() {
                Ok(())
            } else {
                Err(format!("HTTP {}", res.status))
            }
        })
        .await
    }

    /// Send `request` and let `check` classify the response.
    ///
    /// `Ok(())` records a success whatever the status; `Err(msg)` records a failure
    /// with `msg` as its error detail. Transport errors are always failures.
    pub async fn request_checked<F>(
        &self,
        label: &str,
        request: Request,
        check: F,
    ) -> Result<Response, TransportError>
    where
        F: FnOnce(&Response) -> Result<(), String>,
    {
        let label = if label.is_empty() {
            self.task_label.as_str()
        } else {
            label
        };
        let start = Instant::now();
        match self.exchange(request).await {
            Ok(response) => {
                let outcome = match check(&response) {
                    Ok(()) => {
                        RequestOutcome::success(label, response.elapsed, response.body.len())
                    }
                    Err(detail) => RequestOutcome::failure(
                        label,
                        response.elapsed,
                        response.body.len(),
                        detail,
                    ),
                };
                self.stats.record(outcome);
                Ok(response)
            }
            Err(err) => {
                self.stats.record(RequestOutcome::failure(
                    label,
                    start.elapsed(),
                    0,
                    format!("transport: {}", err.message),
                ));
                Err(err)
            }
        }
    }

    /// Record an outcome measured by the action itself (non-HTTP work, custom timing).
    pub fn record(&self, outcome: RequestOutcome) {
        self.stats.record(outcome);
    }

    async fn exchange(&self, mut request: Request) -> Result<Response, TransportError> {
        if !request.is_absolute() {
            request.url = format!("{}{}", self.host.trim_end_matches('/'), request.url);
        }
        match request.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, self.client.request(request))
                .await
                .unwrap_or_else(|_| Err(TransportError::timeout(limit))),
            None => self.client.request(request).await,
        }
    }
}

/// How a user's run ended (forced terminations never get to report).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserExit {
    Completed,
    StartFailed,
}

/// Everything one user needs to run, moved into its future.
pub(crate) struct VirtualUser {
    pub id: usize,
    pub profile: Arc<LoadedProfile>,
    pub host: Arc<str>,
    pub connector: Arc<dyn Connector>,
    pub stats: Arc<StatsAggregator>,
    pub status: Arc<UserStatus>,
    pub stop: watch::Receiver<bool>,
    pub seed: Option<u64>,
    pub request_timeout: Option<Duration>,
}

impl VirtualUser {
    pub(crate) async fn run(self) -> UserExit {
        let VirtualUser {
            id,
            profile,
            host,
            connector,
            stats,
            status,
            mut stop,
            seed,
            request_timeout,
        } = self;
        tracing::debug!("User {id} ({}) starting.", profile.name);

        let client = match connector.connect() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!("User {id} could not acquire a client: {err}");
                return start_failed(&status);
            }
        };
        let mut ctx = UserContext::new(id, &profile, host, client, stats, seed, request_timeout);

        if let Some(hook) = &profile.on_start {
            ctx.task_label = "on_start".to_owned();
            match hook.execute(&mut ctx).await {
                Ok(()) => {}
                Err(ActionError::FatalStart(reason)) => {
                    tracing::warn!("User {id} failed to start: {reason}");
                    return start_failed(&status);
                }
                Err(err) => tracing::warn!("User {id} on_start error (continuing): {err}"),
            }
        }

        status.advance(UserState::Running);
        tracing::debug!("User {id} running.");

        let mut cursor = TaskCursor::new(Arc::clone(&profile.model));
        loop {
            if *stop.borrow() {
                break;
            }
            let task = cursor.next_step(&mut ctx.rng);
            ctx.task_label.clone_from(&task.label);
            if let Err(err) = task.action.execute(&mut ctx).await {
                tracing::debug!("User {id} task `{}` errored: {err}", task.label);
            }

            let wait = profile.wait.sample(&mut ctx.rng);
            if !pause(wait, &mut stop).await {
                break;
            }
        }

        status.advance(UserState::Stopping);
        if let Some(hook) = &profile.on_stop {
            ctx.task_label = "on_stop".to_owned();
            if let Err(err) = hook.execute(&mut ctx).await {
                tracing::warn!("User {id} on_stop error: {err}");
            }
        }
        // releases the client before reporting Stopped
        drop(ctx);
        status.advance(UserState::Stopped);
        tracing::debug!("User {id} stopped.");
        UserExit::Completed
    }
}

fn start_failed(status: &UserStatus) -> UserExit {
    status.population().start_failed();
    status.advance(UserState::Stopped);
    UserExit::StartFailed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ActionResult,
        scenario::UserProfile,
        task::{TaskSetSpec, TaskSpec},
        test_support::MockConnector,
        wait::WaitPolicy,
    };
    use futures::future::BoxFuture;

    fn list_products(ctx: &mut UserContext) -> BoxFuture<'_, ActionResult> {
        Box::pin(async move {
            ctx.request("GET /api/products", Request::get("/api/products"))
                .await?;
            Ok(())
        })
    }

    fn authenticate(ctx: &mut UserContext) -> BoxFuture<'_, ActionResult> {
        Box::pin(async move {
            let res = ctx
                .request_checked("POST /api/authenticate", Request::post("/api/authenticate"), |r| {
                    if r.status == 200 {
                        Ok(())
                    } else {
                        Err(format!("Auth failed: {}", r.status))
                    }
                })
                .await?;
            if res.status != 200 {
                return Err(ActionError::FatalStart(format!("status {}", res.status)));
            }
            ctx.insert("jwt", "token-123".to_string());
            Ok(())
        })
    }

    fn create_order(ctx: &mut UserContext) -> BoxFuture<'_, ActionResult> {
        Box::pin(async move {
            let jwt = ctx.get::<String>("jwt").cloned().unwrap_or_default();
            let req = Request::post("/api/orders")
                .with_header("Authorization", format!("Bearer {jwt}"));
            ctx.request("", req).await?;
            Ok(())
        })
    }

    fn loaded(profile: UserProfile) -> Arc<LoadedProfile> {
        Arc::new(profile.load().unwrap())
    }

    fn spawn_user(
        profile: Arc<LoadedProfile>,
        connector: MockConnector,
        stats: Arc<StatsAggregator>,
        population: Arc<Population>,
    ) -> (Arc<UserStatus>, watch::Sender<bool>, tokio::task::JoinHandle<UserExit>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let status = UserStatus::new(population);
        let user = VirtualUser {
            id: 1,
            profile,
            host: Arc::from("http://shop.test"),
            connector: Arc::new(connector),
            stats,
            status: Arc::clone(&status),
            stop: stop_rx,
            seed: Some(1),
            request_timeout: None,
        };
        (status, stop_tx, tokio::spawn(user.run()))
    }

    #[test]
    fn scratch_store_is_typed() {
        let profile = UserProfile::new(
            "p",
            TaskSetSpec::sequential().task(TaskSpec::new("t", list_products)),
        )
        .load()
        .unwrap();
        let connector = MockConnector::ok();
        let mut ctx = UserContext::new(
            3,
            &profile,
            Arc::from("http://h"),
            connector.connect().unwrap(),
            Arc::new(StatsAggregator::new()),
            None,
            None,
        );
        ctx.insert("order_id", 42u64);
        assert_eq!(ctx.get::<u64>("order_id"), Some(&42));
        assert_eq!(ctx.get::<String>("order_id"), None);
        assert_eq!(ctx.remove::<String>("order_id"), None);
        assert_eq!(ctx.remove::<u64>("order_id"), Some(42));
        assert!(ctx.get::<u64>("order_id").is_none());
        assert_eq!(ctx.user_id(), 3);
    }

    #[test]
    fn transitions_only_move_forward() {
        let population = Arc::new(Population::new());
        let status = UserStatus::new(Arc::clone(&population));
        assert!(status.advance(UserState::Running));
        assert!(!status.advance(UserState::Starting));
        assert!(!status.advance(UserState::Running));
        assert!(status.advance(UserState::Stopped));
        assert!(!status.advance(UserState::Stopping));

        let snap = population.snapshot();
        assert_eq!(snap.stopped, 1);
        assert_eq!(snap.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_from_on_start_reaches_later_tasks() {
        let stats = Arc::new(StatsAggregator::new());
        let population = Arc::new(Population::new());
        let connector = MockConnector::ok().with_latency(Duration::from_millis(10));
        let profile = loaded(
            UserProfile::new(
                "shopper",
                TaskSetSpec::sequential().task(TaskSpec::new("POST /api/orders", create_order)),
            )
            .with_wait(WaitPolicy::constant(0.5).unwrap())
            .on_start(authenticate),
        );

        let (status, stop, handle) =
            spawn_user(profile, connector.clone(), Arc::clone(&stats), Arc::clone(&population));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(status.current(), UserState::Running);
        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), UserExit::Completed);

        let requests = connector.requests();
        assert_eq!(requests[0].url, "http://shop.test/api/authenticate");
        assert!(requests[1..].iter().all(|r| r
            .headers
            .contains(&("Authorization".to_string(), "Bearer token-123".to_string()))));

        let snap = stats.snapshot();
        assert_eq!(snap.label("POST /api/authenticate").unwrap().count, 1);
        assert!(snap.label("POST /api/orders").unwrap().count >= 3);
        assert_eq!(population.snapshot().stopped, 1);
        assert_eq!(connector.live_clients(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_start_skips_the_loop() {
        let stats = Arc::new(StatsAggregator::new());
        let population = Arc::new(Population::new());
        let connector = MockConnector::with_status(401);
        let profile = loaded(
            UserProfile::new(
                "shopper",
                TaskSetSpec::sequential().task(TaskSpec::new("POST /api/orders", create_order)),
            )
            .on_start(authenticate),
        );

        let (status, _stop, handle) =
            spawn_user(profile, connector.clone(), Arc::clone(&stats), Arc::clone(&population));
        assert_eq!(handle.await.unwrap(), UserExit::StartFailed);
        assert_eq!(status.current(), UserState::Stopped);

        let pop = population.snapshot();
        assert_eq!(pop.start_failures, 1);
        assert_eq!(pop.stopped, 1);
        let auth = stats.snapshot();
        let auth = auth.label("POST /api/authenticate").unwrap();
        assert_eq!(auth.fail_count, 1);
        assert_eq!(auth.error_breakdown["Auth failed: 401"], 1);
        assert!(stats.snapshot().label("POST /api/orders").is_none());
        assert_eq!(connector.live_clients(), 0);
    }

    fn flaky_login(_: &mut UserContext) -> BoxFuture<'_, ActionResult> {
        Box::pin(async { Err(ActionError::Assertion("token missing from body".into())) })
    }

    fn context(connector: &MockConnector, stats: &Arc<StatsAggregator>) -> UserContext {
        let profile = UserProfile::new(
            "p",
            TaskSetSpec::sequential().task(TaskSpec::new("t", list_products)),
        )
        .load()
        .unwrap();
        UserContext::new(
            1,
            &profile,
            Arc::from("http://h"),
            connector.connect().unwrap(),
            Arc::clone(stats),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn check_can_fail_a_2xx_response() {
        let stats = Arc::new(StatsAggregator::new());
        let ctx = context(&MockConnector::ok(), &stats);

        let res = ctx
            .request_checked("POST /api/authenticate", Request::post("/api/authenticate"), |_| {
                Err("no jwtToken in body".to_string())
            })
            .await
            .unwrap();
        assert_eq!(res.status, 200);

        let entry = stats.entry_for("POST /api/authenticate").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.fail_count, 1);
        assert_eq!(entry.errors["no jwtToken in body"], 1);
    }

    #[tokio::test]
    async fn check_can_accept_a_non_2xx_response() {
        let stats = Arc::new(StatsAggregator::new());
        let ctx = context(&MockConnector::with_status(404), &stats);

        let res = ctx
            .request_checked("GET /api/products/9", Request::get("/api/products/9"), |r| {
                if r.status == 404 {
                    Ok(())
                } else {
                    Err(format!("expected 404, got {}", r.status))
                }
            })
            .await
            .unwrap();
        assert_eq!(res.status, 404);

        let entry = stats.entry_for("GET /api/products/9").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.fail_count, 0);
        assert!(entry.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_fatal_on_start_error_still_enters_the_loop() {
        let stats = Arc::new(StatsAggregator::new());
        let population = Arc::new(Population::new());
        let profile = loaded(
            UserProfile::new(
                "browser",
                TaskSetSpec::weighted().task(TaskSpec::new("GET /api/products", list_products)),
            )
            .with_wait(WaitPolicy::constant(1.0).unwrap())
            .on_start(flaky_login),
        );

        let (status, stop, handle) = spawn_user(
            profile,
            MockConnector::ok(),
            Arc::clone(&stats),
            Arc::clone(&population),
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(status.current(), UserState::Running);
        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), UserExit::Completed);

        assert_eq!(population.snapshot().start_failures, 0);
        let products = stats.entry_for("GET /api/products").unwrap();
        assert_eq!(products.count, 3);
        assert_eq!(products.fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_user() {
        let stats = Arc::new(StatsAggregator::new());
        let population = Arc::new(Population::new());
        let connector = MockConnector::with_status(500);
        let profile = loaded(
            UserProfile::new(
                "browser",
                TaskSetSpec::weighted().task(TaskSpec::new("GET /api/products", list_products)),
            )
            .with_wait(WaitPolicy::constant(1.0).unwrap()),
        );

        let (status, stop, handle) =
            spawn_user(profile, connector, Arc::clone(&stats), Arc::clone(&population));
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(status.current(), UserState::Running);
        stop.send(true).unwrap();
        handle.await.unwrap();

        let snap = stats.snapshot();
        let products = snap.label("GET /api/products").unwrap();
        assert_eq!(products.count, 5);
        assert_eq!(products.fail_count, 5);
        assert_eq!(products.error_breakdown["HTTP 500"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_is_a_transport_failure() {
        let stats = Arc::new(StatsAggregator::new());
        let profile = UserProfile::new(
            "slow",
            TaskSetSpec::sequential().task(TaskSpec::new("GET /slow", list_products)),
        )
        .load()
        .unwrap();
        let connector = MockConnector::ok().with_latency(Duration::from_secs(30));
        let ctx = UserContext::new(
            1,
            &profile,
            Arc::from("http://h"),
            connector.connect().unwrap(),
            Arc::clone(&stats),
            None,
            Some(Duration::from_secs(2)),
        );

        let err = ctx.request("GET /slow", Request::get("/slow")).await.unwrap_err();
        assert_eq!(err.kind, crate::client::TransportErrorKind::Timeout);
        let entry = stats.entry_for("GET /slow").unwrap();
        assert_eq!(entry.fail_count, 1);
        assert_eq!(entry.sum_latency, Duration::from_secs(2));
    }
}
