//! Proxy pool management with success-weighted selection and quarantine.
//!
//! The rotator tracks per-proxy outcomes, quarantines endpoints after
//! rate limits, captchas, and blocks, and always hands out the healthiest
//! eligible proxy. Quarantine expiry is evaluated lazily on every read; no
//! background task is involved. One rotator may be shared by many sessions
//! through an `Arc`; every operation runs under a single pool lock.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::clock::{Clock, SystemClock, saturating_after, saturating_before};
use super::events::{Component, DebugDispatcher, FailureRecord};

const MAX_RECENT_EVENTS: usize = 1024;

/// Transport spoken by a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        })
    }
}

/// A single egress endpoint. Identity is `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: ProxyProtocol::default(),
            region: None,
            provider: None,
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Endpoint URL in the form the automation driver expects.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    fn same_endpoint(&self, other: &ProxyConfig) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())?;
        if let Some(region) = &self.region {
            write!(f, " region={region}")?;
        }
        if let Some(provider) = &self.provider {
            write!(f, " provider={provider}")?;
        }
        Ok(())
    }
}

/// Why a proxy is being rotated away from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    RateLimit,
    Captcha,
    Block,
    Geographic,
    Scheduled,
}

impl RotationTrigger {
    pub fn quarantines(self) -> bool {
        matches!(
            self,
            RotationTrigger::RateLimit | RotationTrigger::Captcha | RotationTrigger::Block
        )
    }
}

/// Inclusive range a quarantine duration is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationRange {
    pub min: Duration,
    pub max: Duration,
}

impl DurationRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: if max < min { min } else { max },
        }
    }

    pub fn fixed(duration: Duration) -> Self {
        Self::new(duration, duration)
    }

    fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64()))
    }
}

/// Quarantine lengths per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinePolicy {
    pub rate_limit: DurationRange,
    pub captcha: DurationRange,
    pub block: DurationRange,
}

impl QuarantinePolicy {
    fn range_for(&self, trigger: RotationTrigger) -> Option<DurationRange> {
        match trigger {
            RotationTrigger::RateLimit => Some(self.rate_limit),
            RotationTrigger::Captcha => Some(self.captcha),
            RotationTrigger::Block => Some(self.block),
            RotationTrigger::Geographic | RotationTrigger::Scheduled => None,
        }
    }
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        Self {
            rate_limit: DurationRange::new(Duration::from_secs(15 * 60), Duration::from_secs(30 * 60)),
            captcha: DurationRange::new(Duration::from_secs(60 * 60), Duration::from_secs(2 * 60 * 60)),
            block: DurationRange::new(
                Duration::from_secs(4 * 60 * 60),
                Duration::from_secs(24 * 60 * 60),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatorConfig {
    pub quarantine: QuarantinePolicy,
    /// Horizon for the recent captcha/block/rate-limit counters.
    pub recent_window: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            quarantine: QuarantinePolicy::default(),
            recent_window: Duration::from_secs(60 * 60),
        }
    }
}

impl RotatorConfig {
    pub fn with_quarantine(mut self, quarantine: QuarantinePolicy) -> Self {
        self.quarantine = quarantine;
        self
    }

    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }
}

/// Mutable per-proxy counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub proxy: ProxyConfig,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_count: u64,
    pub captcha_count: u64,
    pub block_count: u64,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub last_failure_ts: Option<DateTime<Utc>>,
    pub quarantined_until: Option<DateTime<Utc>>,
    pub rotation_due: bool,
}

impl ProxyRecord {
    fn new(proxy: ProxyConfig) -> Self {
        Self {
            proxy,
            total_requests: 0,
            successes: 0,
            failures: 0,
            rate_limit_count: 0,
            captcha_count: 0,
            block_count: 0,
            last_success_ts: None,
            last_failure_ts: None,
            quarantined_until: None,
            rotation_due: false,
        }
    }

    /// Successes over requests; a proxy that has never been used scores 1.0.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.total_requests as f64
        }
    }

    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }

    /// Most recent reported outcome, used for least-recently-used ordering.
    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_success_ts.max(self.last_failure_ts)
    }

    /// Zero the counters. An active quarantine stays in force.
    fn clear_counters(&mut self) {
        let quarantined_until = self.quarantined_until;
        *self = Self::new(self.proxy.clone());
        self.quarantined_until = quarantined_until;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyStats {
    pub proxy: ProxyConfig,
    pub success_rate: f64,
    pub total_requests: u64,
    pub rate_limits: u64,
    pub captchas: u64,
    pub blocks: u64,
    pub quarantined: bool,
    pub quarantined_until: Option<DateTime<Utc>>,
    pub rotation_due: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub requests: u64,
    pub successes: u64,
    pub success_rate: f64,
}

impl GroupStats {
    fn add(&mut self, record: &ProxyRecord) {
        self.requests += record.total_requests;
        self.successes += record.successes;
    }

    fn finish(&mut self) {
        self.success_rate = if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        };
    }
}

/// Aggregated pool health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetricsSnapshot {
    pub overall_success_rate: f64,
    pub recent_captchas: u64,
    pub recent_blocks: u64,
    pub recent_rate_limits: u64,
    pub quarantined_count: usize,
    pub per_proxy: Vec<ProxyStats>,
    pub per_region: BTreeMap<String, GroupStats>,
    pub per_provider: BTreeMap<String, GroupStats>,
}

impl Default for NetworkMetricsSnapshot {
    fn default() -> Self {
        Self {
            overall_success_rate: 1.0,
            recent_captchas: 0,
            recent_blocks: 0,
            recent_rate_limits: 0,
            quarantined_count: 0,
            per_proxy: Vec::new(),
            per_region: BTreeMap::new(),
            per_provider: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("proxy pool is empty")]
    EmptyPool,
    #[error("every proxy is quarantined (earliest release: {next_release:?})")]
    PoolExhausted { next_release: Option<DateTime<Utc>> },
    #[error("no proxy registered for region '{0}'")]
    NoProxyInRegion(String),
    #[error("proxy {0} is not registered")]
    UnknownProxy(String),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug)]
struct PoolState {
    records: Vec<ProxyRecord>,
    recent_events: VecDeque<(DateTime<Utc>, RotationTrigger)>,
}

impl PoolState {
    fn position(&self, proxy: &ProxyConfig) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.proxy.same_endpoint(proxy))
    }

    fn record_mut(&mut self, proxy: &ProxyConfig) -> NetworkResult<&mut ProxyRecord> {
        let index = self
            .position(proxy)
            .ok_or_else(|| NetworkError::UnknownProxy(proxy.identity()))?;
        Ok(&mut self.records[index])
    }

    fn select<F>(&self, now: DateTime<Utc>, filter: F) -> Option<Result<usize, NetworkError>>
    where
        F: Fn(&ProxyRecord) -> bool,
    {
        let candidates: Vec<(usize, &ProxyRecord)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| filter(record))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let eligible: Vec<(usize, &ProxyRecord)> = candidates
            .iter()
            .copied()
            .filter(|(_, record)| !record.is_quarantined(now))
            .collect();
        if eligible.is_empty() {
            let next_release = candidates
                .iter()
                .filter_map(|(_, record)| record.quarantined_until)
                .min();
            return Some(Err(NetworkError::PoolExhausted { next_release }));
        }

        let fresh: Vec<(usize, &ProxyRecord)> = eligible
            .iter()
            .copied()
            .filter(|(_, record)| !record.rotation_due)
            .collect();
        let pool = if fresh.is_empty() { &eligible } else { &fresh };

        pool.iter()
            .copied()
            .min_by(selection_order)
            .map(|(index, _)| Ok(index))
    }

    fn prune_events(&mut self, horizon: DateTime<Utc>) {
        while let Some((ts, _)) = self.recent_events.front() {
            if *ts < horizon || self.recent_events.len() > MAX_RECENT_EVENTS {
                self.recent_events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Highest success rate first, then least recently used, then registration order.
fn selection_order(a: &(usize, &ProxyRecord), b: &(usize, &ProxyRecord)) -> Ordering {
    b.1.success_rate()
        .partial_cmp(&a.1.success_rate())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.1.last_used().cmp(&b.1.last_used()))
        .then_with(|| a.0.cmp(&b.0))
}

/// Success-weighted proxy rotator with trigger-specific quarantine.
#[derive(Debug)]
pub struct NetworkRotator {
    config: RotatorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
    debug: DebugDispatcher,
}

impl NetworkRotator {
    pub fn new(config: RotatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RotatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(PoolState {
                records: Vec::new(),
                recent_events: VecDeque::with_capacity(64),
            }),
            debug: DebugDispatcher::new(),
        }
    }

    /// Send a failure record whenever a report puts a proxy in quarantine.
    pub fn with_debug(mut self, debug: DebugDispatcher) -> Self {
        self.debug = debug;
        self
    }

    /// Build a rotator over an initial pool.
    pub fn from_proxies<I>(proxies: I) -> Self
    where
        I: IntoIterator<Item = ProxyConfig>,
    {
        let rotator = Self::default();
        rotator.load(proxies);
        rotator
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    pub fn load<I>(&self, proxies: I)
    where
        I: IntoIterator<Item = ProxyConfig>,
    {
        for proxy in proxies {
            self.add_proxy(proxy);
        }
    }

    /// Register a proxy. Returns false when the endpoint is already pooled.
    pub fn add_proxy(&self, proxy: ProxyConfig) -> bool {
        let mut state = self.lock();
        if state.position(&proxy).is_some() {
            return false;
        }
        log::debug!("registered proxy {}", proxy);
        state.records.push(ProxyRecord::new(proxy));
        true
    }

    /// Remove a proxy and its record. Returns false when it was not pooled.
    pub fn remove_proxy(&self, proxy: &ProxyConfig) -> bool {
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|record| !record.proxy.same_endpoint(proxy));
        before != state.records.len()
    }

    pub fn proxies(&self) -> Vec<ProxyConfig> {
        self.lock()
            .records
            .iter()
            .map(|record| record.proxy.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, proxy: &ProxyConfig) -> Option<ProxyRecord> {
        let state = self.lock();
        state.position(proxy).map(|index| state.records[index].clone())
    }

    /// Best eligible proxy across the whole pool.
    pub fn get_proxy(&self) -> NetworkResult<ProxyConfig> {
        let state = self.lock();
        let now = self.clock.now();
        match state.select(now, |_| true) {
            Some(Ok(index)) => Ok(state.records[index].proxy.clone()),
            Some(Err(err)) => Err(err),
            None => Err(NetworkError::EmptyPool),
        }
    }

    /// Best eligible proxy among those tagged with `region`.
    pub fn get_proxy_in_region(&self, region: &str) -> NetworkResult<ProxyConfig> {
        let state = self.lock();
        let now = self.clock.now();
        match state.select(now, |record| record.proxy.region.as_deref() == Some(region)) {
            Some(Ok(index)) => Ok(state.records[index].proxy.clone()),
            Some(Err(err)) => Err(err),
            None => Err(NetworkError::NoProxyInRegion(region.to_string())),
        }
    }

    pub fn report_success(&self, proxy: &ProxyConfig) -> NetworkResult<()> {
        let mut state = self.lock();
        let now = self.clock.now();
        let record = state.record_mut(proxy)?;
        record.total_requests += 1;
        record.successes += 1;
        record.last_success_ts = Some(now);
        record.rotation_due = false;
        Ok(())
    }

    /// Record a failed request and apply the trigger's quarantine.
    pub fn report_failure(&self, proxy: &ProxyConfig, trigger: RotationTrigger) -> NetworkResult<()> {
        let quarantine = self
            .config
            .quarantine
            .range_for(trigger)
            .map(|range| range.sample());

        // Events must be pushed in time order, so read the clock under the lock.
        let mut state = self.lock();
        let now = self.clock.now();
        let horizon = saturating_before(now, self.config.recent_window);
        let mut applied = None;
        let record = state.record_mut(proxy)?;
        record.total_requests += 1;
        record.failures += 1;
        record.last_failure_ts = Some(now);
        match trigger {
            RotationTrigger::RateLimit => record.rate_limit_count += 1,
            RotationTrigger::Captcha => record.captcha_count += 1,
            RotationTrigger::Block => record.block_count += 1,
            RotationTrigger::Geographic | RotationTrigger::Scheduled => {}
        }

        match quarantine {
            Some(duration) => {
                let until = saturating_after(now, duration);
                // A shorter penalty never shortens an active quarantine.
                let until = match record.quarantined_until {
                    Some(existing) if existing > until => existing,
                    _ => until,
                };
                record.quarantined_until = Some(until);
                applied = Some((record.proxy.identity(), until));
                log::info!(
                    "quarantined proxy {} for {:.0}s after {:?}",
                    record.proxy.identity(),
                    duration.as_secs_f64(),
                    trigger
                );
            }
            None => {
                record.rotation_due = true;
                log::debug!("proxy {} marked for rotation ({:?})", record.proxy.identity(), trigger);
            }
        }

        if trigger.quarantines() {
            state.recent_events.push_back((now, trigger));
        }
        state.prune_events(horizon);
        drop(state);

        if let Some((identity, until)) = applied {
            self.debug.dispatch(
                FailureRecord::new(
                    Component::Network,
                    json!({
                        "proxy": identity,
                        "trigger": trigger,
                        "quarantined_until": until.to_rfc3339(),
                    }),
                    format!("proxy quarantined after {trigger:?}"),
                )
                .at(now),
            );
        }
        Ok(())
    }

    /// Exclude a proxy for an explicit duration.
    pub fn quarantine(&self, proxy: &ProxyConfig, duration: Duration) -> NetworkResult<()> {
        let mut state = self.lock();
        let until = saturating_after(self.clock.now(), duration);
        state.record_mut(proxy)?.quarantined_until = Some(until);
        Ok(())
    }

    /// Lift a quarantine immediately.
    pub fn release(&self, proxy: &ProxyConfig) -> NetworkResult<()> {
        let mut state = self.lock();
        state.record_mut(proxy)?.quarantined_until = None;
        Ok(())
    }

    /// Reset counters for one proxy, or for the whole pool when `proxy` is `None`.
    ///
    /// Active quarantines are kept; use [`NetworkRotator::release`] to lift them.
    pub fn reset_metrics(&self, proxy: Option<&ProxyConfig>) -> NetworkResult<()> {
        let mut state = self.lock();
        match proxy {
            Some(proxy) => state.record_mut(proxy)?.clear_counters(),
            None => {
                state.records.iter_mut().for_each(ProxyRecord::clear_counters);
                state.recent_events.clear();
            }
        }
        Ok(())
    }

    pub fn get_metrics(&self) -> NetworkMetricsSnapshot {
        let state = self.lock();
        let now = self.clock.now();
        let horizon = saturating_before(now, self.config.recent_window);

        let mut snapshot = NetworkMetricsSnapshot::default();
        let mut total_requests = 0u64;
        let mut total_successes = 0u64;

        for record in &state.records {
            let quarantined = record.is_quarantined(now);
            if quarantined {
                snapshot.quarantined_count += 1;
            }
            snapshot.per_proxy.push(ProxyStats {
                proxy: record.proxy.clone(),
                success_rate: record.success_rate(),
                total_requests: record.total_requests,
                rate_limits: record.rate_limit_count,
                captchas: record.captcha_count,
                blocks: record.block_count,
                quarantined,
                quarantined_until: record.quarantined_until.filter(|_| quarantined),
                rotation_due: record.rotation_due,
            });

            total_requests += record.total_requests;
            total_successes += record.successes;

            if let Some(region) = &record.proxy.region {
                snapshot.per_region.entry(region.clone()).or_default().add(record);
            }
            if let Some(provider) = &record.proxy.provider {
                snapshot.per_provider.entry(provider.clone()).or_default().add(record);
            }
        }

        snapshot.per_region.values_mut().for_each(GroupStats::finish);
        snapshot.per_provider.values_mut().for_each(GroupStats::finish);

        if total_requests > 0 {
            snapshot.overall_success_rate = total_successes as f64 / total_requests as f64;
        }

        for (_, trigger) in state.recent_events.iter().filter(|(ts, _)| *ts >= horizon) {
            match trigger {
                RotationTrigger::Captcha => snapshot.recent_captchas += 1,
                RotationTrigger::Block => snapshot.recent_blocks += 1,
                RotationTrigger::RateLimit => snapshot.recent_rate_limits += 1,
                RotationTrigger::Geographic | RotationTrigger::Scheduled => {}
            }
        }

        snapshot
    }
}

impl Default for NetworkRotator {
    fn default() -> Self {
        Self::new(RotatorConfig::default())
    }
}
