//! # statescraper-rs
//!
//! Adaptive resilience core for state-machine driven scrapers.
//!
//! A scraping session is modelled as a set of page states (login, search,
//! results...). The executor detects which state is active, runs it, and
//! follows its transitions. Around that loop sit the pieces that keep a
//! session alive when the target pushes back:
//!
//! - Page detection by URL, DOM and text evidence, with cascading and
//!   composite detectors
//! - Selector cascades (XPath → CSS → text → visual) that record which
//!   strategy finally matched
//! - A rolling cascade metrics window that exposes selector drift
//! - A shared proxy rotator with quarantine for rate limits, captchas and blocks
//! - A behavior scaler that moves the session from machine-like to
//!   human-like pacing when success rates drop
//!
//! Browser automation itself is out of scope: states and selector
//! resolvers are implemented by the integrator on top of whatever driver
//! they use.
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use statescraper_rs::{
//!     SessionContext, State, StateMachineExecutor, StateResult, Transition,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Landing;
//!
//! #[async_trait]
//! impl State<()> for Landing {
//!     fn name(&self) -> &str {
//!         "landing"
//!     }
//!
//!     async fn detect(&self, _ctx: &SessionContext<()>) -> StateResult<bool> {
//!         Ok(true)
//!     }
//!
//!     async fn execute(&mut self, ctx: &mut SessionContext<()>) -> StateResult<()> {
//!         tokio::time::sleep(ctx.profile.min_delay()).await;
//!         Ok(())
//!     }
//!
//!     async fn transition(&mut self, _ctx: &SessionContext<()>) -> StateResult<Transition> {
//!         Ok(Transition::Complete)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut executor = StateMachineExecutor::<()>::builder()
//!         .with_state(Landing)
//!         .build()?;
//!     let mut ctx = executor.new_context(());
//!     let report = executor.run(&mut ctx, &CancellationToken::new()).await?;
//!     println!("visited {:?}", report.visited);
//!     Ok(())
//! }
//! ```

pub mod cascade;
pub mod detection;
pub mod executor;
pub mod modules;
pub mod states;

pub use crate::cascade::{
    CascadeExecution,
    CascadeExecutor,
    CascadeResult,
    CascadeSelector,
    ResolutionError,
    SelectorResolver,
    SelectorType,
    create_cascade,
};

pub use crate::detection::{
    CascadeDetector,
    CompositeDetector,
    DetectionLogic,
    DetectionResult,
    Detector,
    DomElementDetector,
    Observations,
    TextContentDetector,
    UrlPatternDetector,
};

pub use crate::executor::{
    ExecutorBuilder,
    ExecutorConfig,
    ExecutorError,
    ExecutorResult,
    OperationHistory,
    RunOutcome,
    RunReport,
    StateMachineExecutor,
};

pub use crate::states::{
    RegistryError,
    SessionContext,
    State,
    StateError,
    StateRegistry,
    StateResult,
    Transition,
};

pub use crate::modules::{
    BehaviorProfile,
    BehaviorScaler,
    CascadeMetrics,
    CascadeMetricsSnapshot,
    Clock,
    DebugDispatcher,
    DebugSink,
    FailureRecord,
    NetworkError,
    NetworkMetricsSnapshot,
    NetworkRotator,
    ProxyConfig,
    RotationTrigger,
    RotatorConfig,
};

/// Crate version, for log lines and debug records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
