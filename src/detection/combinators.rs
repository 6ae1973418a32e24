//! Cascade and composite detectors.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{DetectionResult, Detector, Observations};
use crate::modules::events::{Component, DebugDispatcher, FailureRecord};

/// Tries sub-detectors in order and stops at the first confident verdict.
///
/// When no sub-detector reaches `min_confidence`, the most confident result
/// seen is returned instead of failing.
#[derive(Debug)]
pub struct CascadeDetector {
    detectors: Vec<Box<dyn Detector>>,
    min_confidence: f64,
    debug: DebugDispatcher,
}

impl CascadeDetector {
    pub fn new(detectors: Vec<Box<dyn Detector>>, min_confidence: f64) -> Self {
        Self {
            detectors,
            min_confidence: min_confidence.clamp(0.0, 1.0),
            debug: DebugDispatcher::new(),
        }
    }

    pub fn with_debug(mut self, debug: DebugDispatcher) -> Self {
        self.debug = debug;
        self
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }
}

impl Detector for CascadeDetector {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        let mut best: Option<DetectionResult> = None;

        for detector in &self.detectors {
            let result = detector.evaluate(observations);
            if result.confidence >= self.min_confidence {
                return result;
            }
            if best
                .as_ref()
                .is_none_or(|current| result.confidence > current.confidence)
            {
                best = Some(result);
            }
        }

        let best = best.unwrap_or_else(|| DetectionResult::not_detected("empty detector cascade"));
        if !self.debug.is_empty() {
            self.debug.dispatch(FailureRecord::new(
                Component::Detection,
                json!({
                    "detectors": self.detectors.len(),
                    "min_confidence": self.min_confidence,
                    "url": observations.url.as_ref().map(|url| url.as_str()),
                }),
                format!(
                    "no detector reached {:.2}; best was {}",
                    self.min_confidence, best
                ),
            ));
        }
        best
    }
}

/// How a [`CompositeDetector`] folds its sub-verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionLogic {
    And,
    Or,
}

/// Evaluates every sub-detector and combines the verdicts.
#[derive(Debug)]
pub struct CompositeDetector {
    detectors: Vec<Box<dyn Detector>>,
    logic: DetectionLogic,
}

impl CompositeDetector {
    pub fn new(detectors: Vec<Box<dyn Detector>>, logic: DetectionLogic) -> Self {
        Self { detectors, logic }
    }

    pub fn all(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self::new(detectors, DetectionLogic::And)
    }

    pub fn any(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self::new(detectors, DetectionLogic::Or)
    }
}

impl Detector for CompositeDetector {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        let results: Vec<DetectionResult> = self
            .detectors
            .iter()
            .map(|detector| detector.evaluate(observations))
            .collect();

        if results.is_empty() {
            return DetectionResult::not_detected("empty composite detector");
        }

        let confidences = results.iter().map(|result| result.confidence);
        let (detected, confidence) = match self.logic {
            DetectionLogic::And => (
                results.iter().all(|result| result.detected),
                confidences.fold(f64::INFINITY, f64::min),
            ),
            DetectionLogic::Or => (
                results.iter().any(|result| result.detected),
                confidences.fold(f64::NEG_INFINITY, f64::max),
            ),
        };

        let reasoning = results
            .iter()
            .filter_map(|result| result.reasoning.as_deref())
            .collect::<Vec<_>>()
            .join("; ");

        DetectionResult::new(detected, confidence, reasoning)
    }
}
