//! State detection.
//!
//! A detector looks at a driver-supplied [`Observations`] snapshot of the
//! current page and reports whether some page state is active, with a
//! confidence score and a human-readable reason. Leaf detectors inspect one
//! kind of evidence; [`CascadeDetector`] and [`CompositeDetector`] combine
//! them.

mod combinators;
mod detectors;

pub use combinators::{CascadeDetector, CompositeDetector, DetectionLogic};
pub use detectors::{DomElementDetector, TextContentDetector, UrlPatternDetector};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::Url;

/// Page evidence collected by the automation driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observations {
    pub url: Option<Url>,
    pub page_text: Option<String>,
    /// Selectors the driver found present on the page.
    pub present_selectors: HashSet<String>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_page_text(mut self, text: impl Into<String>) -> Self {
        self.page_text = Some(text.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.present_selectors.insert(selector.into());
        self
    }

    pub fn has_selector(&self, selector: &str) -> bool {
        self.present_selectors.contains(selector)
    }
}

/// Verdict of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detected: bool,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub reasoning: Option<String>,
}

impl DetectionResult {
    pub fn new(detected: bool, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            detected,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: Some(reasoning.into()),
        }
    }

    pub fn detected(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self::new(true, confidence, reasoning)
    }

    pub fn not_detected(reasoning: impl Into<String>) -> Self {
        Self::new(false, 0.0, reasoning)
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "detected={} confidence={:.2}",
            self.detected, self.confidence
        )?;
        if let Some(reasoning) = &self.reasoning {
            write!(f, " ({reasoning})")?;
        }
        Ok(())
    }
}

/// Pluggable detection strategy.
pub trait Detector: Send + Sync + fmt::Debug {
    fn evaluate(&self, observations: &Observations) -> DetectionResult;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        (**self).evaluate(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(DetectionResult::detected(1.7, "over").confidence, 1.0);
        assert_eq!(DetectionResult::new(false, -0.2, "under").confidence, 0.0);
    }

    #[test]
    fn display_includes_reasoning() {
        let result = DetectionResult::detected(0.9, "login form present");
        assert_eq!(
            result.to_string(),
            "detected=true confidence=0.90 (login form present)"
        );
    }
}
