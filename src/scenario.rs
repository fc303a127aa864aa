use std::{fmt, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    client::Connector,
    error::Error,
    task::{Action, TaskModel, TaskSetSpec},
    wait::WaitPolicy,
};

/// One kind of simulated user: its task set, pacing and lifecycle hooks.
///
/// A scenario may mix several profiles; users are assigned to them in proportion to
/// their weights.
#[derive(Clone)]
pub struct UserProfile {
    pub name: String,
    pub weight: u32,
    pub tasks: TaskSetSpec,
    pub wait: WaitPolicy,
    /// Runs once before the task loop. Returning [`ActionError::FatalStart`] turns the
    /// user into a start failure; any other error is logged and ignored.
    ///
    /// [`ActionError::FatalStart`]: crate::ActionError::FatalStart
    pub on_start: Option<Arc<dyn Action>>,
    /// Runs once after the task loop, before the user reports `Stopped`.
    pub on_stop: Option<Arc<dyn Action>>,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, tasks: TaskSetSpec) -> Self {
        Self {
            name: name.into(),
            weight: 1,
            tasks,
            wait: WaitPolicy::none(),
            on_start: None,
            on_stop: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn on_start(mut self, action: impl Action + 'static) -> Self {
        self.on_start = Some(Arc::new(action));
        self
    }

    pub fn on_stop(mut self, action: impl Action + 'static) -> Self {
        self.on_stop = Some(Arc::new(action));
        self
    }

    pub(crate) fn load(&self) -> Result<LoadedProfile, Error> {
        self.wait
            .validate()
            .map_err(|err| Error::config(format!("profile `{}`: {err}", self.name)))?;
        let model = TaskModel::load(&self.tasks)
            .map_err(|err| Error::config(format!("profile `{}`: {err}", self.name)))?;
        Ok(LoadedProfile {
            name: self.name.clone(),
            model: Arc::new(model),
            wait: self.wait,
            on_start: self.on_start.clone(),
            on_stop: self.on_stop.clone(),
        })
    }
}

impl fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfile")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("tasks", &self.tasks)
            .field("wait", &self.wait)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

/// Everything a run needs to know about the workload.
///
/// ```ignore
/// let scenario = Scenario::builder()
///     .name("checkout")
///     .host("http://localhost:3000")
///     .profiles(vec![UserProfile::new("shopper", tasks)])
///     .connector(Arc::new(ReqwestConnector::default()))
///     .build();
/// ```
#[derive(Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    /// Base URL that relative request paths are joined onto.
    #[builder(default, setter(into))]
    pub host: String,
    pub profiles: Vec<UserProfile>,
    pub connector: Arc<dyn Connector>,
    /// Applied to requests that carry no timeout of their own.
    #[builder(default, setter(strip_option))]
    pub request_timeout: Option<Duration>,
}

impl Scenario {
    /// Let `STAMPEDE_HOST` override the configured host.
    pub fn with_env_host(self) -> Self {
        self.with_host_override(std::env::var("STAMPEDE_HOST").ok())
    }

    fn with_host_override(mut self, host: Option<String>) -> Self {
        if let Some(host) = host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            self.host = host.to_owned();
        }
        self
    }

    /// Check every profile without starting anything.
    pub fn validate(&self) -> Result<(), Error> {
        self.load().map(|_| ())
    }

    pub(crate) fn load(&self) -> Result<LoadedScenario, Error> {
        if self.profiles.is_empty() {
            return Err(Error::config(format!(
                "scenario `{}` has no user profiles",
                self.name
            )));
        }
        let mut profiles = Vec::with_capacity(self.profiles.len());
        let mut weights = Vec::with_capacity(self.profiles.len());
        for profile in &self.profiles {
            if profile.weight == 0 {
                return Err(Error::config(format!(
                    "profile `{}` has zero weight",
                    profile.name
                )));
            }
            profiles.push(Arc::new(profile.load()?));
            weights.push(profile.weight);
        }
        Ok(LoadedScenario {
            name: self.name.clone(),
            host: Arc::from(self.host.as_str()),
            connector: Arc::clone(&self.connector),
            request_timeout: self.request_timeout,
            profiles,
            weights,
        })
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("profiles", &self.profiles)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Validated profile, shared by every user assigned to it.
pub(crate) struct LoadedProfile {
    pub name: String,
    pub model: Arc<TaskModel>,
    pub wait: WaitPolicy,
    pub on_start: Option<Arc<dyn Action>>,
    pub on_stop: Option<Arc<dyn Action>>,
}

pub(crate) struct LoadedScenario {
    pub name: String,
    pub host: Arc<str>,
    pub connector: Arc<dyn Connector>,
    pub request_timeout: Option<Duration>,
    profiles: Vec<Arc<LoadedProfile>>,
    weights: Vec<u32>,
}

impl LoadedScenario {
    pub(crate) fn rotation(&self) -> ProfileRotation {
        ProfileRotation::new(self.profiles.clone(), &self.weights)
    }
}

/// Smooth weighted round-robin over profiles.
///
/// Deterministic, and any window of `sum(weights)` consecutive picks contains each
/// profile exactly `weight` times.
pub(crate) struct ProfileRotation {
    profiles: Vec<Arc<LoadedProfile>>,
    weights: Vec<i64>,
    current: Vec<i64>,
    total: i64,
}

impl ProfileRotation {
    fn new(profiles: Vec<Arc<LoadedProfile>>, weights: &[u32]) -> Self {
        let weights: Vec<i64> = weights.iter().map(|&w| i64::from(w)).collect();
        Self {
            current: vec![0; weights.len()],
            total: weights.iter().sum(),
            profiles,
            weights,
        }
    }

    pub(crate) fn next(&mut self) -> Arc<LoadedProfile> {
        let mut best = 0;
        for (i, weight) in self.weights.iter().enumerate() {
            self.current[i] += weight;
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= self.total;
        Arc::clone(&self.profiles[best])
    }
}
