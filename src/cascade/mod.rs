//! Cascading selector execution.
//!
//! A cascade is an ordered list of selector strategies, cheapest and most
//! specific first. The executor tries them one by one until the DOM
//! collaborator resolves one; a miss or a resolver error simply moves on to
//! the next strategy. The outcome carries the position that succeeded so the
//! metrics aggregator can tell primary hits from late fallbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::modules::cascade_metrics::CascadeMetrics;
use crate::modules::events::{Component, DebugDispatcher, FailureRecord};

/// Kind of selector strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    XPath,
    Css,
    Text,
    Visual,
}

impl SelectorType {
    /// Text and visual strategies are last-resort fallbacks.
    pub fn is_fallback(self) -> bool {
        matches!(self, SelectorType::Text | SelectorType::Visual)
    }
}

impl fmt::Display for SelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectorType::XPath => "xpath",
            SelectorType::Css => "css",
            SelectorType::Text => "text",
            SelectorType::Visual => "visual",
        })
    }
}

/// One strategy in a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSelector {
    pub selector: String,
    pub selector_type: SelectorType,
    pub order: usize,
    #[serde(default)]
    pub description: String,
}

impl CascadeSelector {
    pub fn new(selector: impl Into<String>, selector_type: SelectorType, order: usize) -> Self {
        Self {
            selector: selector.into(),
            selector_type,
            order,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Outcome of one cascade invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeResult {
    pub selector: Option<CascadeSelector>,
    /// Index of the winning selector, or the cascade length on exhaustion.
    pub position: usize,
    pub selector_type: Option<SelectorType>,
    pub success: bool,
}

impl CascadeResult {
    fn exhausted(length: usize) -> Self {
        Self {
            selector: None,
            position: length,
            selector_type: None,
            success: false,
        }
    }
}

/// Cascade result paired with whatever the resolver produced.
#[derive(Debug, Clone)]
pub struct CascadeExecution<T> {
    pub result: CascadeResult,
    pub value: Option<T>,
}

impl<T> CascadeExecution<T> {
    pub fn is_success(&self) -> bool {
        self.result.success
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("selector is not supported by the driver: {0}")]
    Unsupported(String),
    #[error("selector is malformed: {0}")]
    InvalidSelector(String),
    #[error("driver error: {0}")]
    Driver(String),
}

/// Resolves a selector against the current page.
///
/// `Ok(None)` means "not found" and is the normal way a strategy misses.
#[async_trait]
pub trait SelectorResolver: Send + Sync {
    type Output: Send;

    async fn resolve(&self, selector: &CascadeSelector) -> Result<Option<Self::Output>, ResolutionError>;
}

/// Runs an ordered list of selectors until one resolves.
#[derive(Debug, Clone)]
pub struct CascadeExecutor {
    selectors: Vec<CascadeSelector>,
    metrics: CascadeMetrics,
    debug: DebugDispatcher,
}

impl CascadeExecutor {
    /// Selectors are sorted by their `order` field; ties keep list order.
    pub fn new(mut selectors: Vec<CascadeSelector>, metrics: CascadeMetrics) -> Self {
        selectors.sort_by_key(|selector| selector.order);
        Self {
            selectors,
            metrics,
            debug: DebugDispatcher::new(),
        }
    }

    pub fn with_debug(mut self, debug: DebugDispatcher) -> Self {
        self.debug = debug;
        self
    }

    pub fn selectors(&self) -> &[CascadeSelector] {
        &self.selectors
    }

    pub fn metrics(&self) -> &CascadeMetrics {
        &self.metrics
    }

    /// Try every selector in order and report the outcome to the metrics window once.
    pub async fn execute<R>(&self, resolver: &R) -> CascadeExecution<R::Output>
    where
        R: SelectorResolver + ?Sized,
    {
        let length = self.selectors.len();

        for (position, selector) in self.selectors.iter().enumerate() {
            let reason = match resolver.resolve(selector).await {
                Ok(Some(value)) => {
                    if position > 0 {
                        log::debug!(
                            "cascade resolved by fallback #{} ({} '{}')",
                            position,
                            selector.selector_type,
                            selector.selector
                        );
                    }
                    self.metrics
                        .record_success(position, selector.selector_type, length);
                    return CascadeExecution {
                        result: CascadeResult {
                            selector: Some(selector.clone()),
                            position,
                            selector_type: Some(selector.selector_type),
                            success: true,
                        },
                        value: Some(value),
                    };
                }
                Ok(None) => "selector not found".to_string(),
                Err(err) => err.to_string(),
            };

            log::debug!(
                "cascade miss at #{} ({} '{}'): {}",
                position,
                selector.selector_type,
                selector.selector,
                reason
            );
            self.debug.dispatch(FailureRecord::new(
                Component::Cascade,
                json!({
                    "position": position,
                    "selector": selector.selector,
                    "selector_type": selector.selector_type,
                    "description": selector.description,
                }),
                reason,
            ));
        }

        self.metrics.record_failure();
        CascadeExecution {
            result: CascadeResult::exhausted(length),
            value: None,
        }
    }
}

/// Build an executor from `(selector, type, description)` tuples in priority order.
pub fn create_cascade<I, S, D>(selectors: I, metrics: CascadeMetrics) -> CascadeExecutor
where
    I: IntoIterator<Item = (S, SelectorType, D)>,
    S: Into<String>,
    D: Into<String>,
{
    let selectors = selectors
        .into_iter()
        .enumerate()
        .map(|(order, (selector, selector_type, description))| {
            CascadeSelector::new(selector, selector_type, order).with_description(description)
        })
        .collect();
    CascadeExecutor::new(selectors, metrics)
}
