//! Rolling statistics over selector cascade executions.
//!
//! Frequent fallbacks to late cascade positions or to text/visual selectors
//! usually mean the markup changed or the site started serving a degraded
//! page to suspected bots. The snapshot produced here is one of the signals
//! fed into behavior escalation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cascade::SelectorType;

pub const DEFAULT_CASCADE_WINDOW: usize = 200;

/// Read projection over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CascadeMetricsSnapshot {
    /// Mean normalized success position, 0.0 = always primary, 1.0 = always last.
    pub avg_position: f64,
    /// Share of successes that came from text or visual selectors.
    pub text_fallback_rate: f64,
    /// Share of successes that came from visual selectors alone.
    pub visual_fallback_rate: f64,
    /// Share of executions resolved by the primary selector.
    pub primary_success_rate: f64,
    pub success_rate: f64,
    pub sample_count: usize,
}

impl Default for CascadeMetricsSnapshot {
    fn default() -> Self {
        Self {
            avg_position: 0.0,
            text_fallback_rate: 0.0,
            visual_fallback_rate: 0.0,
            primary_success_rate: 1.0,
            success_rate: 1.0,
            sample_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CascadeSample {
    Success {
        position: usize,
        selector_type: SelectorType,
        cascade_length: usize,
    },
    Failure,
}

impl CascadeSample {
    fn normalized_position(position: usize, cascade_length: usize) -> f64 {
        let span = cascade_length.saturating_sub(1).max(1);
        (position as f64 / span as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
struct CascadeWindow {
    samples: VecDeque<CascadeSample>,
    capacity: usize,
}

impl CascadeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: CascadeSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn snapshot(&self) -> CascadeMetricsSnapshot {
        let total = self.samples.len();
        if total == 0 {
            return CascadeMetricsSnapshot::default();
        }

        let mut successes = 0usize;
        let mut primary = 0usize;
        let mut position_sum = 0.0;
        let mut text_or_visual = 0usize;
        let mut visual = 0usize;

        for sample in &self.samples {
            if let CascadeSample::Success {
                position,
                selector_type,
                cascade_length,
            } = *sample
            {
                successes += 1;
                if position == 0 {
                    primary += 1;
                }
                position_sum += CascadeSample::normalized_position(position, cascade_length);
                if selector_type.is_fallback() {
                    text_or_visual += 1;
                }
                if selector_type == SelectorType::Visual {
                    visual += 1;
                }
            }
        }

        let per_success = |count: usize| {
            if successes == 0 {
                0.0
            } else {
                count as f64 / successes as f64
            }
        };

        CascadeMetricsSnapshot {
            avg_position: if successes == 0 {
                0.0
            } else {
                position_sum / successes as f64
            },
            text_fallback_rate: per_success(text_or_visual),
            visual_fallback_rate: per_success(visual),
            primary_success_rate: primary as f64 / total as f64,
            success_rate: successes as f64 / total as f64,
            sample_count: total,
        }
    }
}

/// Thread-safe cascade metrics aggregator.
///
/// Cloning yields another handle onto the same window, so an executor and
/// all the cascades it hands out record into one place.
#[derive(Clone, Debug)]
pub struct CascadeMetrics {
    inner: Arc<Mutex<CascadeWindow>>,
}

impl CascadeMetrics {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_CASCADE_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CascadeWindow::new(window.max(1)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CascadeWindow> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, position: usize, selector_type: SelectorType, cascade_length: usize) {
        self.lock().push(CascadeSample::Success {
            position,
            selector_type,
            cascade_length,
        });
    }

    /// Record a cascade where every selector failed.
    pub fn record_failure(&self) {
        self.lock().push(CascadeSample::Failure);
    }

    pub fn get_metrics(&self) -> CascadeMetricsSnapshot {
        self.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every sample, e.g. when switching target sites.
    pub fn reset(&self) {
        self.lock().samples.clear();
    }
}

impl Default for CascadeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_optimistic() {
        let metrics = CascadeMetrics::new();
        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.sample_count, 0);
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.avg_position, 0.0);
    }

    #[test]
    fn normalizes_positions_and_counts_fallbacks() {
        let metrics = CascadeMetrics::new();
        metrics.record_success(0, SelectorType::XPath, 3);
        metrics.record_success(2, SelectorType::Text, 3);
        metrics.record_failure();

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.sample_count, 3);
        assert!((snapshot.avg_position - 0.5).abs() < 1e-9);
        assert!((snapshot.text_fallback_rate - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.visual_fallback_rate, 0.0);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.primary_success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn visual_hits_count_as_both_fallback_kinds() {
        let metrics = CascadeMetrics::new();
        metrics.record_success(3, SelectorType::Visual, 4);
        metrics.record_success(1, SelectorType::Css, 4);

        let snapshot = metrics.get_metrics();
        assert!((snapshot.text_fallback_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.visual_fallback_rate - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.primary_success_rate, 0.0);
    }

    #[test]
    fn single_selector_cascade_counts_as_primary_position() {
        let metrics = CascadeMetrics::new();
        metrics.record_success(0, SelectorType::Css, 1);
        assert_eq!(metrics.get_metrics().avg_position, 0.0);
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let metrics = CascadeMetrics::with_window(4);
        for _ in 0..4 {
            metrics.record_failure();
        }
        for _ in 0..4 {
            metrics.record_success(0, SelectorType::Css, 2);
        }

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.sample_count, 4);
        assert_eq!(snapshot.success_rate, 1.0);

        metrics.reset();
        assert!(metrics.is_empty());
    }

    #[test]
    fn clones_share_one_window() {
        let metrics = CascadeMetrics::new();
        let handle = metrics.clone();
        handle.record_success(1, SelectorType::Visual, 2);
        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.sample_count, 1);
        assert_eq!(snapshot.visual_fallback_rate, 1.0);
        assert_eq!(snapshot.avg_position, 1.0);
    }
}
