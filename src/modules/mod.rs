//! Adaptive services module
//!
//! Shared building blocks the executor and states lean on: behavior
//! scaling, cascade metrics, proxy rotation, failure capture, and time.

pub mod behavior;
pub mod cascade_metrics;
pub mod clock;
pub mod events;
pub mod network;

// Re-export commonly used types
pub use behavior::{
    BehaviorProfile, BehaviorScaler, DEFAULT_ADJUSTMENT_RATE, EscalationSignals, next_level,
};
pub use cascade_metrics::{CascadeMetrics, CascadeMetricsSnapshot, DEFAULT_CASCADE_WINDOW};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{Component, DebugDispatcher, DebugSink, FailureRecord, LoggingSink, MemorySink};
pub use network::{
    DurationRange, GroupStats, NetworkError, NetworkMetricsSnapshot, NetworkResult,
    NetworkRotator, ProxyConfig, ProxyProtocol, ProxyRecord, ProxyStats, QuarantinePolicy,
    RotationTrigger, RotatorConfig,
};
