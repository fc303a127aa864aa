//! Stampede: a synthetic load generator built around virtual users.
//!
//! Stampede simulates a population of concurrent users against a target service. Each
//! virtual user runs its own loop of weighted or sequential tasks, pauses between
//! iterations like a real client would, and records every request it makes into a
//! shared, lock-light statistics aggregator. The population is grown and shrunk at a
//! configurable spawn rate while the run is live.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the workload: host, [`UserProfile`]s and the [`Connector`] that
//!   gives each user its own request client.
//! - [`TaskSetSpec`] / [`TaskSpec`]: what a user does. Sets are sequential or weighted and
//!   can be nested; they are validated into an immutable [`TaskModel`].
//! - [`UserContext`]: per-user state handed to every [`Action`]: the client, a typed
//!   scratch store (tokens, ids), the user's RNG.
//! - [`WaitPolicy`]: the pause drawn between two iterations.
//! - [`StatsAggregator`]: concurrent per-label accumulation of [`RequestOutcome`]s into
//!   [`AggregateEntry`]s, with bounded latency reservoirs.
//! - [`RunController`]: start / ramp / stop / reset, and read-only [`Snapshot`]s at any
//!   time. [`Reporter`]s turn snapshots into output.
//!
//! # Runtime model
//!
//! Everything runs on tokio. Users are plain futures polled by a fixed pool of worker
//! contexts (`num_cpus` by default), so tens of thousands of mostly-idle users cost
//! little more than their state. All timing goes through `tokio::time`, which makes runs
//! fully testable under a paused clock.
//!
//! # Feature flags
//! - `macros` (default): the [`macros::action`] attribute for writing actions as `async fn`.
//! - `reqwest` (default): [`ReqwestConnector`], an HTTP adapter over `reqwest`.
//! - `internals`: enable access to internal (and unstable) pacing functions.
//!
//! # Where to start
//!
//! Read the docs for [`Scenario`], [`UserContext`] and [`RunController`], then look at
//! the `ecommerce` demo.

/// Latency reservoirs and per-label aggregates
pub mod aggregate;
/// The transport boundary
pub mod client;
/// Run parameters
pub mod config;
/// Run lifecycle
pub mod controller;
pub mod error;
/// Single request outcomes
pub mod metric;
/// Snapshots and Reporters
pub mod report;
/// Workload definition that glues profiles and transport together
pub mod scenario;
/// Population ramping and worker contexts
pub mod scheduler;
pub mod stats;
pub mod task;
/// Virtual users and their context
pub mod user;
pub mod wait;

#[cfg(test)]
mod test_support;

pub use aggregate::AggregateEntry;
#[cfg(feature = "reqwest")]
pub use client::ReqwestConnector;
pub use client::{Connector, Method, Request, RequestClient, Response, TransportError};
pub use config::RunConfig;
pub use controller::{RunController, RunState};
pub use error::{ActionError, ActionResult, Error};
pub use metric::RequestOutcome;
pub use report::{JsonReporter, LabelReport, Reporter, Snapshot, StdoutReporter};
pub use scenario::{Scenario, UserProfile};
pub use scheduler::{RampPolicy, StopReport};
pub use stats::StatsAggregator;
pub use task::{Action, TaskModel, TaskSetSpec, TaskSpec};
pub use user::{PopulationSnapshot, UserContext, UserState};
pub use wait::WaitPolicy;

/// Return type of actions; re-exported for the `#[action]` attribute.
pub use futures::future::BoxFuture;

#[cfg(feature = "macros")]
pub mod macros {
    pub use stampede_macros::*;
}
