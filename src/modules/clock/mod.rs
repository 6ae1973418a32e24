//! Time sources for quarantine expiry and recent-event windows.
//!
//! Everything time-dependent in the crate reads the clock through [`Clock`]
//! so tests can advance time explicitly instead of sleeping.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `from + duration`, saturating at the latest representable instant.
pub(crate) fn saturating_after(from: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    from.checked_add_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `from - duration`, saturating at the earliest representable instant.
pub(crate) fn saturating_before(from: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    from.checked_sub_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Source of "now".
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock. Time only moves when [`ManualClock::advance`] or
/// [`ManualClock::set`] is called.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = saturating_after(*guard, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
