//! Page-state contract consumed by the executor.
//!
//! Each concrete state represents one page context (login form, search
//! results, rate-limit interstitial...). The executor only ever calls the
//! five methods of [`State`]; everything page-specific lives in the
//! integrator's implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::cascade::{CascadeExecutor, CascadeSelector};
use crate::modules::behavior::BehaviorProfile;
use crate::modules::cascade_metrics::CascadeMetrics;
use crate::modules::events::DebugDispatcher;
use crate::modules::network::{NetworkError, NetworkRotator, ProxyConfig, RotationTrigger};

/// Recoverable failure of a single state operation.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("required element not found: {0}")]
    ElementNotFound(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Other(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// What a state wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    Complete,
}

impl Transition {
    pub fn to(name: impl Into<String>) -> Self {
        Transition::Next(name.into())
    }
}

/// Typed per-session context passed to every state call.
///
/// The executor owns the adaptive fields (`profile`, `success_rate`,
/// `previous_state`); states read them and keep their own data in `data`.
pub struct SessionContext<D> {
    pub profile: BehaviorProfile,
    pub success_rate: Option<f64>,
    pub previous_state: Option<String>,
    pub current_proxy: Option<ProxyConfig>,
    pub data: D,
    cascade_metrics: CascadeMetrics,
    network: Option<Arc<NetworkRotator>>,
    debug: DebugDispatcher,
}

impl<D> SessionContext<D> {
    pub(crate) fn new(
        data: D,
        profile: BehaviorProfile,
        cascade_metrics: CascadeMetrics,
        network: Option<Arc<NetworkRotator>>,
        debug: DebugDispatcher,
    ) -> Self {
        Self {
            profile,
            success_rate: None,
            previous_state: None,
            current_proxy: None,
            data,
            cascade_metrics,
            network,
            debug,
        }
    }

    pub fn cascade_metrics(&self) -> &CascadeMetrics {
        &self.cascade_metrics
    }

    pub fn network(&self) -> Option<&Arc<NetworkRotator>> {
        self.network.as_ref()
    }

    /// Cascade executor recording into this session's metrics window.
    pub fn cascade(&self, selectors: Vec<CascadeSelector>) -> CascadeExecutor {
        CascadeExecutor::new(selectors, self.cascade_metrics.clone()).with_debug(self.debug.clone())
    }

    /// Lease the best proxy from the shared rotator and remember it.
    pub fn acquire_proxy(&mut self) -> StateResult<Option<ProxyConfig>> {
        let Some(network) = &self.network else {
            return Ok(None);
        };
        let proxy = network.get_proxy()?;
        self.current_proxy = Some(proxy.clone());
        Ok(Some(proxy))
    }

    pub fn report_proxy_success(&self) -> StateResult<()> {
        if let (Some(network), Some(proxy)) = (&self.network, &self.current_proxy) {
            network.report_success(proxy)?;
        }
        Ok(())
    }

    /// Report a failure on the leased proxy and release the lease.
    pub fn report_proxy_failure(&mut self, trigger: RotationTrigger) -> StateResult<()> {
        if let (Some(network), Some(proxy)) = (&self.network, self.current_proxy.take()) {
            network.report_failure(&proxy, trigger)?;
        }
        Ok(())
    }
}

impl<D: fmt::Debug> fmt::Debug for SessionContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("profile", &self.profile)
            .field("success_rate", &self.success_rate)
            .field("previous_state", &self.previous_state)
            .field("current_proxy", &self.current_proxy)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// The five-method capability set every page state implements.
#[async_trait]
pub trait State<D: Send + Sync>: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this state is the one currently shown.
    async fn detect(&self, ctx: &SessionContext<D>) -> StateResult<bool>;

    async fn enter(&mut self, _ctx: &mut SessionContext<D>) -> StateResult<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut SessionContext<D>) -> StateResult<()>;

    async fn transition(&mut self, ctx: &SessionContext<D>) -> StateResult<Transition>;

    async fn exit(&mut self, _ctx: &mut SessionContext<D>) -> StateResult<()> {
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("state '{0}' is already registered")]
    Duplicate(String),
}

/// Name-keyed table of states plus their detection priority.
pub struct StateRegistry<D: Send + Sync> {
    states: HashMap<String, Box<dyn State<D>>>,
    priority: Vec<String>,
}

impl<D: Send + Sync> StateRegistry<D> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            priority: Vec::new(),
        }
    }

    /// Register a state; detection priority follows registration order.
    pub fn register(&mut self, state: Box<dyn State<D>>) -> Result<(), RegistryError> {
        let name = state.name().to_string();
        if self.states.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.priority.push(name.clone());
        self.states.insert(name, state);
        Ok(())
    }

    /// Reorder detection priority. Names not listed keep their relative
    /// order after the listed ones; unknown names are ignored.
    pub fn set_priority<I, S>(&mut self, order: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::with_capacity(self.priority.len());
        for name in order.into_iter().map(Into::into) {
            if self.states.contains_key(&name) && !ordered.contains(&name) {
                ordered.push(name);
            }
        }
        for name in &self.priority {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }
        self.priority = ordered;
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    pub fn contains(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn State<D>> {
        self.states.get(name).map(|state| state.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn State<D> + 'static)> {
        self.states.get_mut(name).map(|state| state.as_mut())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<D: Send + Sync> Default for StateRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Send + Sync> fmt::Debug for StateRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("priority", &self.priority)
            .finish()
    }
}
