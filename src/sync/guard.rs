use std::time::Duration;

use super::semaphore::{CooperativeLock, NamedSemaphore};
use crate::error::{BridgeError, BridgeResult};

/// Longest time a single acquire attempt blocks the request path.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
/// Added to the error counter for every missed acquire.
pub const FAILURE_PENALTY: u32 = 10;
/// Taken off the error counter for every successful acquire.
pub const SUCCESS_CREDIT: u32 = 1;
/// Counter value at which the guard gives up.
pub const FAILURE_CEILING: u32 = 1000;

/// Result of booking one failed acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Tolerated,
    /// The counter just reached the ceiling. Reported once per crossing.
    Exhausted,
}

/// Error counter that tolerates occasional contention but not starvation.
///
/// Ten successes pay for one miss, so a lock that is missed more often than
/// roughly one time in eleven drives the counter up until it exhausts.
#[derive(Debug, Default, Clone)]
pub struct BackoffPolicy {
    error_counter: u32,
    exhausted: bool,
}

impl BackoffPolicy {
    pub fn error_counter(&self) -> u32 {
        self.error_counter
    }

    pub fn record_failure(&mut self) -> Escalation {
        self.error_counter = self.error_counter.saturating_add(FAILURE_PENALTY);
        if self.error_counter >= FAILURE_CEILING && !self.exhausted {
            self.exhausted = true;
            return Escalation::Exhausted;
        }
        Escalation::Tolerated
    }

    pub fn record_success(&mut self) {
        self.error_counter = self.error_counter.saturating_sub(SUCCESS_CREDIT);
        if self.error_counter < FAILURE_CEILING {
            self.exhausted = false;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Serialises register access with other processes sharing the store.
pub struct AccessGuard {
    lock: Box<dyn CooperativeLock>,
    policy: BackoffPolicy,
}

impl AccessGuard {
    /// Open (or with `force`, reuse) the named semaphore with one token.
    pub fn open(name: &str, force: bool, mode: u32) -> BridgeResult<Self> {
        let semaphore = NamedSemaphore::open(name, 1, force, mode)?;
        log::info!("Guarding register access with semaphore '{}'", semaphore.name());
        Ok(Self::with_lock(Box::new(semaphore)))
    }

    pub fn with_lock(lock: Box<dyn CooperativeLock>) -> Self {
        Self {
            lock,
            policy: BackoffPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_held()
    }

    /// Try to take the lock before a reply is computed.
    ///
    /// `Ok(false)` means the attempt timed out and the caller proceeds
    /// unguarded. Only a crossing of the failure ceiling is an error.
    pub fn acquire(&mut self) -> BridgeResult<bool> {
        if self.lock.try_acquire(ACQUIRE_TIMEOUT)? {
            self.policy.record_success();
            return Ok(true);
        }
        log::warn!("Failed to acquire semaphore '{}'", self.lock.name());
        match self.policy.record_failure() {
            Escalation::Tolerated => Ok(false),
            Escalation::Exhausted => Err(BridgeError::LockStarved {
                name: self.lock.name().to_string(),
            }),
        }
    }

    /// Hand the token back; a no-op when the last acquire missed.
    pub fn release(&mut self) -> BridgeResult<()> {
        self.lock.release()
    }

    pub fn reset(&mut self) {
        self.policy.reset();
    }
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("name", &self.lock.name())
            .field("held", &self.lock.is_held())
            .field("policy", &self.policy)
            .finish()
    }
}
