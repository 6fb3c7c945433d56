//! Failed-attempt tracking per identity with lockout.
//!
//! ```text
//! Clean --failure--> Warned(1) --failure--> ... Warned(n) --n == max--> Locked(until)
//!   ^                                                                      |
//!   +------------------- success / lockout expiry / window expiry --------+
//! ```
//!
//! State lives in an injected [`AttemptStore`]; every transition is a single
//! `update` call on the store, so a request abandoned before its outcome is
//! known leaves the record untouched.
//!
//! The store holds at most `max_records` identities. A failure for a new
//! identity in a full store first evicts expired records, then records that
//! are not locked.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use store::{AttemptLedger, AttemptStore, FileAttemptStore, MemoryAttemptStore};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    failures: u32,
    first_failure: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    fn first(now: DateTime<Utc>) -> Self {
        Self {
            failures: 0,
            first_failure: now,
            locked_until: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn first_failure(&self) -> DateTime<Utc> {
        self.first_failure
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// A record stops mattering once its lockout is over, or, when it never
    /// locked, once its first failure falls out of the window.
    fn is_expired(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        match self.locked_until {
            Some(until) => until <= now,
            None => now - self.first_failure >= window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Clean,
    Warned { failures: u32 },
    Locked { until: DateTime<Utc> },
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
    pub window: Duration,
    pub max_records: usize,
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout: Duration::from_secs(300),
            window: Duration::from_secs(3600),
            max_records: 10_000,
        }
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::days(36_500))
}

fn short(identity: &str) -> &str {
    identity.get(..8).unwrap_or(identity)
}

#[derive(Clone)]
pub struct AttemptLimiter {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    policy: LimiterPolicy,
}

impl AttemptLimiter {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>, policy: LimiterPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// In-memory limiter on the system clock.
    pub fn in_memory(policy: LimiterPolicy) -> Self {
        Self::new(
            Arc::new(MemoryAttemptStore::default()),
            Arc::new(SystemClock),
            policy,
        )
    }

    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    pub fn state(&self, identity: &str) -> Result<AttemptState> {
        let now = self.clock.now();
        let window = delta(self.policy.window);
        Ok(match self.store.get(identity)? {
            None => AttemptState::Clean,
            Some(record) if record.is_locked(now) => AttemptState::Locked {
                until: record.locked_until.unwrap_or(now),
            },
            Some(record) if record.is_expired(now, window) || record.failures == 0 => {
                AttemptState::Clean
            }
            Some(record) => AttemptState::Warned {
                failures: record.failures,
            },
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] while the identity is locked out.
    pub fn check_allowed(&self, identity: &str) -> Result<()> {
        if let AttemptState::Locked { until } = self.state(identity)? {
            let retry_after = (until - self.clock.now()).to_std().unwrap_or_default();
            warn!(
                identity = short(identity),
                retry_after_secs = retry_after.as_secs(),
                "attempt refused, identity locked"
            );
            return Err(Error::RateLimited { retry_after });
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::Busy`] when the store is full of locked identities and
    /// `identity` is not among them.
    pub fn record_failure(&self, identity: &str) -> Result<AttemptState> {
        if self.store.get(identity)?.is_none() {
            self.make_room()?;
        }

        let now = self.clock.now();
        let window = delta(self.policy.window);
        let lockout = delta(self.policy.lockout);
        let max_attempts = self.policy.max_attempts.max(1);

        let updated = self.store.update(identity, &mut |current| {
            let mut record = match current {
                Some(record) if !record.is_expired(now, window) => record,
                _ => AttemptRecord::first(now),
            };
            record.failures = record.failures.saturating_add(1);
            if record.failures >= max_attempts && record.locked_until.is_none() {
                record.locked_until =
                    Some(now.checked_add_signed(lockout).unwrap_or(DateTime::<Utc>::MAX_UTC));
            }
            Some(record)
        })?;

        let state = match updated {
            Some(AttemptRecord {
                locked_until: Some(until),
                ..
            }) => {
                warn!(identity = short(identity), %until, "identity locked out");
                AttemptState::Locked { until }
            }
            Some(record) => {
                info!(
                    identity = short(identity),
                    failures = record.failures,
                    "failed attempt recorded"
                );
                AttemptState::Warned {
                    failures: record.failures,
                }
            }
            None => AttemptState::Clean,
        };
        Ok(state)
    }

    pub fn record_success(&self, identity: &str) -> Result<()> {
        self.store.update(identity, &mut |_| None)?;
        Ok(())
    }

    /// Drop records whose lockout or window has passed.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let window = delta(self.policy.window);
        self.store.retain(&mut |record| !record.is_expired(now, window))
    }

    fn make_room(&self) -> Result<()> {
        let limit = self.policy.max_records.max(1);
        if self.store.count()? < limit {
            return Ok(());
        }

        let expired = self.evict_expired()?;
        if self.store.count()? < limit {
            debug!(expired, "attempt store full, expired records evicted");
            return Ok(());
        }

        let now = self.clock.now();
        let unlocked = self.store.retain(&mut |record| record.is_locked(now))?;
        warn!(expired, unlocked, "attempt store full, unlocked records evicted");
        if self.store.count()? >= limit {
            warn!(records = limit, "attempt store full of locked identities");
            return Err(Error::Busy);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use super::Clock;

    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new() -> Self {
            Self(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()))
        }

        pub fn advance(&self, seconds: i64) {
            let mut now = self.0.lock().unwrap();
            *now += TimeDelta::seconds(seconds);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}
