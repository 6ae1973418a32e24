//! Adaptive behavior scaling between machine-like and human-like interaction.
//!
//! A behavior level in `[0, 1]` selects a point between two endpoint
//! profiles. Sessions start machine-like (fast) and drift towards human-like
//! (slow, jittery, with mouse and scroll simulation) when success rates drop,
//! cascades fall back to weak selectors, or the network layer reports
//! captchas and blocks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::cascade_metrics::CascadeMetricsSnapshot;
use super::network::NetworkMetricsSnapshot;

pub const DEFAULT_ADJUSTMENT_RATE: f64 = 0.1;

const HIGH_SUCCESS_THRESHOLD: f64 = 0.95;
const LOW_SUCCESS_THRESHOLD: f64 = 0.7;
const TEXT_FALLBACK_THRESHOLD: f64 = 0.3;
const AVG_POSITION_THRESHOLD: f64 = 0.5;
const BOOLEAN_SWITCH_LEVEL: f64 = 0.5;

/// Interaction parameters handed to page states. Ranges are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub delay_range: (f64, f64),
    pub mouse_movement: bool,
    pub scroll_behavior: bool,
    /// Keystroke delay range; `None` means instant text input.
    pub typing_cadence: Option<(f64, f64)>,
    /// Randomness factor in `[0, 1]`.
    pub jitter: f64,
}

impl BehaviorProfile {
    /// Fast and deterministic: no simulated input.
    pub const MACHINE_LIKE: BehaviorProfile = BehaviorProfile {
        delay_range: (0.0, 0.1),
        mouse_movement: false,
        scroll_behavior: false,
        typing_cadence: None,
        jitter: 0.0,
    };

    /// Realistic delays, mouse and scroll simulation, human typing speed.
    pub const HUMAN_LIKE: BehaviorProfile = BehaviorProfile {
        delay_range: (1.0, 3.0),
        mouse_movement: true,
        scroll_behavior: true,
        typing_cadence: Some((0.05, 0.15)),
        jitter: 0.3,
    };

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_range.0.max(0.0))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_range.1.max(self.delay_range.0).max(0.0))
    }
}

impl Default for BehaviorProfile {
    fn default() -> Self {
        Self::MACHINE_LIKE
    }
}

impl fmt::Display for BehaviorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delay={:.2}-{:.2}s mouse={} scroll={} typing=",
            self.delay_range.0, self.delay_range.1, self.mouse_movement, self.scroll_behavior
        )?;
        match self.typing_cadence {
            Some((min, max)) => write!(f, "{min:.2}-{max:.2}s")?,
            None => f.write_str("instant")?,
        }
        write!(f, " jitter={:.2}", self.jitter)
    }
}

/// Signals considered by one escalation step.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalationSignals<'a> {
    pub success_rate: f64,
    pub cascade: Option<&'a CascadeMetricsSnapshot>,
    pub network: Option<&'a NetworkMetricsSnapshot>,
}

impl<'a> EscalationSignals<'a> {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate,
            cascade: None,
            network: None,
        }
    }

    pub fn with_cascade(mut self, cascade: &'a CascadeMetricsSnapshot) -> Self {
        self.cascade = Some(cascade);
        self
    }

    pub fn with_network(mut self, network: &'a NetworkMetricsSnapshot) -> Self {
        self.network = Some(network);
        self
    }

    fn success_delta(&self, rate: f64) -> f64 {
        if self.success_rate > HIGH_SUCCESS_THRESHOLD {
            -rate
        } else if self.success_rate < LOW_SUCCESS_THRESHOLD {
            rate
        } else {
            0.0
        }
    }

    fn cascade_delta(&self, rate: f64) -> f64 {
        match self.cascade {
            Some(cascade)
                if cascade.text_fallback_rate > TEXT_FALLBACK_THRESHOLD
                    || cascade.avg_position > AVG_POSITION_THRESHOLD =>
            {
                rate
            }
            _ => 0.0,
        }
    }

    fn network_delta(&self, rate: f64) -> f64 {
        match self.network {
            Some(network) if network.recent_captchas > 0 || network.recent_blocks > 0 => 2.0 * rate,
            Some(network) if network.overall_success_rate < LOW_SUCCESS_THRESHOLD => rate,
            _ => 0.0,
        }
    }
}

/// Next behavior level given the current one and a set of signals.
///
/// The three deltas are independent and additive; the sum saturates at the
/// `[0, 1]` bounds.
pub fn next_level(current: f64, signals: &EscalationSignals<'_>, adjustment_rate: f64) -> f64 {
    let rate = adjustment_rate.max(0.0);
    let delta =
        signals.success_delta(rate) + signals.cascade_delta(rate) + signals.network_delta(rate);
    (current + delta).clamp(0.0, 1.0)
}

// Exact at both endpoints.
fn lerp(from: f64, to: f64, level: f64) -> f64 {
    from * (1.0 - level) + to * level
}

/// Interpolates between two endpoint profiles and tracks the current level.
#[derive(Debug, Clone)]
pub struct BehaviorScaler {
    min_profile: BehaviorProfile,
    max_profile: BehaviorProfile,
    current_level: f64,
}

impl BehaviorScaler {
    pub fn new(min_profile: BehaviorProfile, max_profile: BehaviorProfile) -> Self {
        Self {
            min_profile,
            max_profile,
            current_level: 0.0,
        }
    }

    pub fn level(&self) -> f64 {
        self.current_level
    }

    pub fn set_level(&mut self, level: f64) {
        self.current_level = level.clamp(0.0, 1.0);
    }

    /// Back to machine-like, e.g. after switching target sites.
    pub fn reset(&mut self) {
        self.current_level = 0.0;
    }

    pub fn scale(&self, level: f64) -> BehaviorProfile {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        let (min, max) = (&self.min_profile, &self.max_profile);

        let delay_range = (
            lerp(min.delay_range.0, max.delay_range.0, level),
            lerp(min.delay_range.1, max.delay_range.1, level),
        );

        let typing_cadence = match (min.typing_cadence, max.typing_cadence) {
            (None, None) => None,
            (None, Some(_)) if level == 0.0 => None,
            (from, to) => {
                let from = from.unwrap_or((0.0, 0.0));
                let to = to.unwrap_or((0.0, 0.0));
                Some((lerp(from.0, to.0, level), lerp(from.1, to.1, level)))
            }
        };

        let human_side = level > BOOLEAN_SWITCH_LEVEL;
        BehaviorProfile {
            delay_range,
            mouse_movement: if human_side { max.mouse_movement } else { min.mouse_movement },
            scroll_behavior: if human_side { max.scroll_behavior } else { min.scroll_behavior },
            typing_cadence,
            jitter: lerp(min.jitter, max.jitter, level),
        }
    }

    /// Adjust the level from the latest signals and return the new profile.
    pub fn escalate(
        &mut self,
        success_rate: f64,
        cascade_metrics: Option<&CascadeMetricsSnapshot>,
        network_metrics: Option<&NetworkMetricsSnapshot>,
        adjustment_rate: f64,
    ) -> BehaviorProfile {
        let signals = EscalationSignals {
            success_rate,
            cascade: cascade_metrics,
            network: network_metrics,
        };
        let previous = self.current_level;
        self.current_level = next_level(previous, &signals, adjustment_rate);
        if self.current_level != previous {
            log::info!(
                "behavior level {:.2} -> {:.2} (success_rate={:.2})",
                previous,
                self.current_level,
                success_rate
            );
        }
        self.scale(self.current_level)
    }

    pub fn get_current_profile(&self) -> BehaviorProfile {
        self.scale(self.current_level)
    }
}

impl Default for BehaviorScaler {
    fn default() -> Self {
        Self::new(BehaviorProfile::MACHINE_LIKE, BehaviorProfile::HUMAN_LIKE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(value: f64, a: f64, b: f64) -> bool {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        value >= lo - 1e-12 && value <= hi + 1e-12
    }

    #[test]
    fn scaled_fields_stay_between_endpoints() {
        let scaler = BehaviorScaler::default();
        let (min, max) = (BehaviorProfile::MACHINE_LIKE, BehaviorProfile::HUMAN_LIKE);
        for step in 0..=100 {
            let level = step as f64 / 100.0;
            let profile = scaler.scale(level);
            assert!(within(profile.delay_range.0, min.delay_range.0, max.delay_range.0));
            assert!(within(profile.delay_range.1, min.delay_range.1, max.delay_range.1));
            assert!(within(profile.jitter, min.jitter, max.jitter));
            if let Some((lo, hi)) = profile.typing_cadence {
                assert!(within(lo, 0.0, 0.05));
                assert!(within(hi, 0.0, 0.15));
            }
        }
    }

    #[test]
    fn endpoints_reproduce_profiles() {
        let scaler = BehaviorScaler::default();
        assert_eq!(scaler.scale(0.0), BehaviorProfile::MACHINE_LIKE);
        assert_eq!(scaler.scale(1.0), BehaviorProfile::HUMAN_LIKE);
        assert_eq!(scaler.scale(7.5), BehaviorProfile::HUMAN_LIKE);
        assert_eq!(scaler.scale(-1.0), BehaviorProfile::MACHINE_LIKE);
    }

    #[test]
    fn booleans_flip_strictly_above_half() {
        let scaler = BehaviorScaler::default();
        assert!(!scaler.scale(0.5).mouse_movement);
        assert!(!scaler.scale(0.5).scroll_behavior);
        assert!(scaler.scale(0.51).mouse_movement);
        assert!(scaler.scale(0.51).scroll_behavior);
    }

    #[test]
    fn typing_cadence_absent_only_at_zero() {
        let scaler = BehaviorScaler::default();
        assert!(scaler.scale(0.0).typing_cadence.is_none());
        let (lo, hi) = scaler.scale(0.5).typing_cadence.unwrap();
        assert!((lo - 0.025).abs() < 1e-12);
        assert!((hi - 0.075).abs() < 1e-12);
    }

    #[test]
    fn maintain_band_is_a_fixed_point() {
        let mut scaler = BehaviorScaler::default();
        scaler.set_level(0.4);
        for rate in [0.7, 0.8, 0.95, 0.72] {
            scaler.escalate(rate, None, None, DEFAULT_ADJUSTMENT_RATE);
            assert_eq!(scaler.level(), 0.4);
        }
    }

    #[test]
    fn success_rate_sequence_moves_level() {
        let mut scaler = BehaviorScaler::default();
        let expected = [(0.98, 0.0), (0.60, 0.1), (0.92, 0.1), (0.99, 0.0)];
        for (rate, level) in expected {
            let profile = scaler.escalate(rate, None, None, 0.1);
            assert!((scaler.level() - level).abs() < 1e-12);
            assert_eq!(profile, scaler.scale(level));
        }
    }

    #[test]
    fn signals_add_up_and_saturate() {
        let cascade = CascadeMetricsSnapshot {
            text_fallback_rate: 0.4,
            ..Default::default()
        };
        let network = NetworkMetricsSnapshot {
            recent_captchas: 1,
            ..Default::default()
        };

        let signals = EscalationSignals::new(0.5)
            .with_cascade(&cascade)
            .with_network(&network);
        assert!((next_level(0.0, &signals, 0.1) - 0.4).abs() < 1e-12);
        assert_eq!(next_level(0.9, &signals, 0.1), 1.0);

        // A high success rate and an active captcha still net out upward.
        let conflicting = EscalationSignals::new(0.99).with_network(&network);
        assert!((next_level(0.5, &conflicting, 0.1) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn weak_network_without_captchas_adds_single_step() {
        let network = NetworkMetricsSnapshot {
            overall_success_rate: 0.5,
            ..Default::default()
        };
        let signals = EscalationSignals::new(0.8).with_network(&network);
        assert!((next_level(0.2, &signals, 0.1) - 0.3).abs() < 1e-12);

        let cascade = CascadeMetricsSnapshot {
            avg_position: 0.5,
            ..Default::default()
        };
        let calm = EscalationSignals::new(0.8).with_cascade(&cascade);
        assert_eq!(next_level(0.2, &calm, 0.1), 0.2);
    }

    #[test]
    fn current_profile_is_a_pure_read() {
        let mut scaler = BehaviorScaler::default();
        scaler.set_level(0.3);
        let first = scaler.get_current_profile();
        let second = scaler.get_current_profile();
        assert_eq!(first, second);
        assert_eq!(scaler.level(), 0.3);
        scaler.reset();
        assert_eq!(scaler.get_current_profile(), BehaviorProfile::MACHINE_LIKE);
    }
}
