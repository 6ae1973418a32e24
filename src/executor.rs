//! Sequential state-machine executor.
//!
//! Drives registered page states through detect → enter → execute →
//! transition → exit, keeps a bounded history of operation outcomes, and
//! after every execution feeds the recent success rate together with the
//! cascade and network metrics into the behavior scaler. The resulting
//! profile is published into the session context before the next state
//! runs.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::modules::behavior::{BehaviorProfile, BehaviorScaler, DEFAULT_ADJUSTMENT_RATE};
use crate::modules::cascade_metrics::CascadeMetrics;
use crate::modules::events::{Component, DebugDispatcher, DebugSink, FailureRecord};
use crate::modules::network::NetworkRotator;
use crate::states::{RegistryError, SessionContext, State, StateError, StateRegistry, Transition};

/// Result alias used by the executor.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Session-fatal failures.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no registered state detected as active after {attempts} attempts")]
    NoActiveState { attempts: usize },
    #[error("transition to unknown state '{0}'")]
    UnknownState(String),
    #[error("state '{state}' could not choose a transition: {source}")]
    TransitionFailed {
        state: String,
        #[source]
        source: StateError,
    },
    #[error("no states registered")]
    EmptyRegistry,
    #[error("state registration failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Executor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Full detection sweeps before giving up with `NoActiveState`.
    pub max_detection_attempts: usize,
    pub detection_poll_interval: Duration,
    pub history_capacity: usize,
    /// History size required before escalation kicks in.
    pub min_samples: usize,
    /// Number of most recent outcomes the success rate is computed over.
    pub success_window: usize,
    pub adjustment_rate: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_detection_attempts: 3,
            detection_poll_interval: Duration::from_millis(500),
            history_capacity: 100,
            min_samples: 10,
            success_window: 20,
            adjustment_rate: DEFAULT_ADJUSTMENT_RATE,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_detection_attempts(mut self, attempts: usize) -> Self {
        self.max_detection_attempts = attempts.max(1);
        self
    }

    pub fn with_detection_poll_interval(mut self, interval: Duration) -> Self {
        self.detection_poll_interval = interval;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }

    pub fn with_success_window(mut self, window: usize) -> Self {
        self.success_window = window.max(1);
        self
    }

    pub fn with_adjustment_rate(mut self, rate: f64) -> Self {
        self.adjustment_rate = rate.max(0.0);
        self
    }
}

/// Bounded ring buffer of operation outcomes, oldest evicted first.
#[derive(Debug, Clone)]
pub struct OperationHistory {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl OperationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Success share over the `window` most recent outcomes.
    pub fn success_rate(&self, window: usize) -> Option<f64> {
        let take = window.min(self.outcomes.len());
        if take == 0 {
            return None;
        }
        let successes = self.outcomes.iter().rev().take(take).filter(|ok| **ok).count();
        Some(successes as f64 / take as f64)
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Summary of one executor run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// States in the order they were executed.
    pub visited: Vec<String>,
    pub failed_operations: usize,
    pub final_level: f64,
    pub final_profile: BehaviorProfile,
}

/// Sequential executor for one scraping session.
pub struct StateMachineExecutor<D: Send + Sync> {
    registry: StateRegistry<D>,
    config: ExecutorConfig,
    scaler: BehaviorScaler,
    cascade_metrics: CascadeMetrics,
    network: Option<Arc<NetworkRotator>>,
    history: OperationHistory,
    debug: DebugDispatcher,
    current_profile: BehaviorProfile,
}

impl<D: Send + Sync> StateMachineExecutor<D> {
    pub fn builder() -> ExecutorBuilder<D> {
        ExecutorBuilder::new()
    }

    /// Fresh session context wired to this executor's services.
    pub fn new_context(&self, data: D) -> SessionContext<D> {
        SessionContext::new(
            data,
            self.current_profile,
            self.cascade_metrics.clone(),
            self.network.clone(),
            self.debug.clone(),
        )
    }

    pub fn current_profile(&self) -> BehaviorProfile {
        self.current_profile
    }

    pub fn level(&self) -> f64 {
        self.scaler.level()
    }

    pub fn history(&self) -> &OperationHistory {
        &self.history
    }

    pub fn cascade_metrics(&self) -> &CascadeMetrics {
        &self.cascade_metrics
    }

    pub fn registry(&self) -> &StateRegistry<D> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Forget everything learned about the current target, e.g. on a site switch.
    ///
    /// The shared network rotator is left alone; other sessions may rely on it.
    pub fn reset_adaptation(&mut self) {
        self.scaler.reset();
        self.cascade_metrics.reset();
        self.history.clear();
        self.current_profile = self.scaler.get_current_profile();
    }

    /// Run until a state reports `Transition::Complete`, the token is
    /// cancelled, or a session-fatal error occurs.
    pub async fn run(
        &mut self,
        ctx: &mut SessionContext<D>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<RunReport> {
        if self.registry.is_empty() {
            return Err(ExecutorError::EmptyRegistry);
        }

        let mut visited = Vec::new();
        let mut failed_operations = 0usize;
        ctx.profile = self.current_profile;

        let Some(mut current) = self.detect_active(ctx, cancel).await? else {
            return Ok(self.report(RunOutcome::Cancelled, visited, failed_operations));
        };
        log::info!("detected active state '{}'", current);

        let mut previous: Option<String> = None;

        loop {
            // State change.
            if let Some(prev) = previous.take() {
                if !self.exit_state(&prev, ctx).await {
                    failed_operations += 1;
                }
                ctx.previous_state = Some(prev);
            }
            if cancel.is_cancelled() {
                return Ok(self.report(RunOutcome::Cancelled, visited, failed_operations));
            }
            if !self.enter_state(&current, ctx).await {
                failed_operations += 1;
            }

            if cancel.is_cancelled() {
                return self.cancel_in(&current, ctx, visited, failed_operations).await;
            }

            // Execute.
            visited.push(current.clone());
            if !self.execute_state(&current, ctx).await {
                failed_operations += 1;
            }

            // Adapt.
            self.publish_profile(ctx);

            if cancel.is_cancelled() {
                return self.cancel_in(&current, ctx, visited, failed_operations).await;
            }

            // Transition.
            match self.transition_from(&current, ctx).await {
                Ok(Transition::Complete) => {
                    if !self.exit_state(&current, ctx).await {
                        failed_operations += 1;
                    }
                    log::info!("session complete after {} states", visited.len());
                    return Ok(self.report(RunOutcome::Completed, visited, failed_operations));
                }
                Ok(Transition::Next(next)) if !self.registry.contains(&next) => {
                    self.debug.dispatch(FailureRecord::new(
                        Component::Transition,
                        json!({ "from": current, "to": next }),
                        "transition names an unregistered state",
                    ));
                    self.exit_state(&current, ctx).await;
                    log::warn!("state '{}' transitioned to unknown state '{}'", current, next);
                    return Err(ExecutorError::UnknownState(next));
                }
                Ok(Transition::Next(next)) => {
                    log::debug!("transition {} -> {}", current, next);
                    previous = Some(std::mem::replace(&mut current, next));
                }
                Err(source) => {
                    self.debug.dispatch(FailureRecord::new(
                        Component::Transition,
                        json!({ "from": current }),
                        source.to_string(),
                    ));
                    self.exit_state(&current, ctx).await;
                    log::warn!("state '{}' failed to transition: {}", current, source);
                    return Err(ExecutorError::TransitionFailed {
                        state: current,
                        source,
                    });
                }
            }

            if cancel.is_cancelled() {
                // `current` is the next state now; the previous one still needs its exit.
                if let Some(prev) = previous.take() {
                    if !self.exit_state(&prev, ctx).await {
                        failed_operations += 1;
                    }
                }
                return Ok(self.report(RunOutcome::Cancelled, visited, failed_operations));
            }
        }
    }

    async fn detect_active(
        &self,
        ctx: &SessionContext<D>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<Option<String>> {
        let attempts = self.config.max_detection_attempts.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            for name in self.registry.priority() {
                let Some(state) = self.registry.get(name) else {
                    continue;
                };
                match state.detect(ctx).await {
                    Ok(true) => return Ok(Some(name.clone())),
                    Ok(false) => {}
                    Err(err) => self.debug.dispatch(FailureRecord::new(
                        Component::Detection,
                        json!({ "state": name, "attempt": attempt }),
                        err.to_string(),
                    )),
                }
            }

            if attempt < attempts {
                log::debug!(
                    "no active state on attempt {}/{}, polling again",
                    attempt,
                    attempts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = sleep(self.config.detection_poll_interval) => {}
                }
            }
        }

        self.debug.dispatch(FailureRecord::new(
            Component::Detection,
            json!({ "states": self.registry.priority(), "attempts": attempts }),
            "no state detected as active",
        ));
        log::warn!("no active state after {} detection attempts", attempts);
        Err(ExecutorError::NoActiveState { attempts })
    }

    async fn enter_state(&mut self, name: &str, ctx: &mut SessionContext<D>) -> bool {
        let result = match self.registry.get_mut(name) {
            Some(state) => state.enter(ctx).await,
            None => return false,
        };
        self.settle(name, Component::StateEnter, result, false)
    }

    async fn execute_state(&mut self, name: &str, ctx: &mut SessionContext<D>) -> bool {
        let result = match self.registry.get_mut(name) {
            Some(state) => state.execute(ctx).await,
            None => return false,
        };
        self.settle(name, Component::StateExecute, result, true)
    }

    async fn exit_state(&mut self, name: &str, ctx: &mut SessionContext<D>) -> bool {
        let result = match self.registry.get_mut(name) {
            Some(state) => state.exit(ctx).await,
            None => return false,
        };
        self.settle(name, Component::StateExit, result, false)
    }

    async fn transition_from(
        &mut self,
        name: &str,
        ctx: &SessionContext<D>,
    ) -> Result<Transition, StateError> {
        match self.registry.get_mut(name) {
            Some(state) => state.transition(ctx).await,
            None => Err(StateError::Other(format!("state '{name}' disappeared"))),
        }
    }

    /// Record an operation outcome. Successful enter/exit calls are not
    /// part of the history; failures of any kind are.
    fn settle(
        &mut self,
        name: &str,
        component: Component,
        result: Result<(), StateError>,
        record_success: bool,
    ) -> bool {
        match result {
            Ok(()) => {
                if record_success {
                    self.history.push(true);
                }
                true
            }
            Err(err) => {
                log::debug!("{} failed in state '{}': {}", component, name, err);
                self.history.push(false);
                self.debug.dispatch(FailureRecord::new(
                    component,
                    json!({ "state": name }),
                    err.to_string(),
                ));
                false
            }
        }
    }

    fn publish_profile(&mut self, ctx: &mut SessionContext<D>) {
        if self.history.len() < self.config.min_samples {
            return;
        }
        let Some(success_rate) = self.history.success_rate(self.config.success_window) else {
            return;
        };

        let cascade = self.cascade_metrics.get_metrics();
        let network = self.network.as_ref().map(|rotator| rotator.get_metrics());
        let cascade = (cascade.sample_count > 0).then_some(cascade);

        let profile = self.scaler.escalate(
            success_rate,
            cascade.as_ref(),
            network.as_ref(),
            self.config.adjustment_rate,
        );
        self.current_profile = profile;
        ctx.profile = profile;
        ctx.success_rate = Some(success_rate);
    }

    async fn cancel_in(
        &mut self,
        current: &str,
        ctx: &mut SessionContext<D>,
        visited: Vec<String>,
        mut failed_operations: usize,
    ) -> ExecutorResult<RunReport> {
        log::info!("session cancelled in state '{}'", current);
        if !self.exit_state(current, ctx).await {
            failed_operations += 1;
        }
        Ok(self.report(RunOutcome::Cancelled, visited, failed_operations))
    }

    fn report(&self, outcome: RunOutcome, visited: Vec<String>, failed_operations: usize) -> RunReport {
        RunReport {
            outcome,
            visited,
            failed_operations,
            final_level: self.scaler.level(),
            final_profile: self.current_profile,
        }
    }
}

/// Fluent builder for [`StateMachineExecutor`].
pub struct ExecutorBuilder<D: Send + Sync> {
    states: Vec<Box<dyn State<D>>>,
    priority: Option<Vec<String>>,
    config: ExecutorConfig,
    scaler: BehaviorScaler,
    cascade_metrics: Option<CascadeMetrics>,
    network: Option<Arc<NetworkRotator>>,
    debug: DebugDispatcher,
}

impl<D: Send + Sync> ExecutorBuilder<D> {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            priority: None,
            config: ExecutorConfig::default(),
            scaler: BehaviorScaler::default(),
            cascade_metrics: None,
            network: None,
            debug: DebugDispatcher::with_logging(),
        }
    }

    /// Register a state. Detection priority follows registration order
    /// unless [`ExecutorBuilder::with_priority`] overrides it.
    pub fn with_state<S>(mut self, state: S) -> Self
    where
        S: State<D> + 'static,
    {
        self.states.push(Box::new(state));
        self
    }

    pub fn with_boxed_state(mut self, state: Box<dyn State<D>>) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_priority<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority = Some(order.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_behavior_scaler(mut self, scaler: BehaviorScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn with_cascade_metrics(mut self, metrics: CascadeMetrics) -> Self {
        self.cascade_metrics = Some(metrics);
        self
    }

    pub fn with_network_rotator(mut self, rotator: Arc<NetworkRotator>) -> Self {
        self.network = Some(rotator);
        self
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug.register_sink(sink);
        self
    }

    /// Replace the default dispatcher (which logs through `log`).
    pub fn with_debug_dispatcher(mut self, debug: DebugDispatcher) -> Self {
        self.debug = debug;
        self
    }

    pub fn build(self) -> ExecutorResult<StateMachineExecutor<D>> {
        let mut registry = StateRegistry::new();
        for state in self.states {
            registry.register(state)?;
        }
        if registry.is_empty() {
            return Err(ExecutorError::EmptyRegistry);
        }
        if let Some(order) = self.priority {
            registry.set_priority(order);
        }

        let current_profile = self.scaler.get_current_profile();
        Ok(StateMachineExecutor {
            registry,
            history: OperationHistory::new(self.config.history_capacity),
            config: self.config,
            scaler: self.scaler,
            cascade_metrics: self.cascade_metrics.unwrap_or_default(),
            network: self.network,
            debug: self.debug,
            current_profile,
        })
    }
}

impl<D: Send + Sync> Default for ExecutorBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}
