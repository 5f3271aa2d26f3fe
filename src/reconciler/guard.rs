//! In-flight and retry guards for the reconciler's periodic work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// At most one tick of an activity runs at a time; later ticks are dropped, not queued.
#[derive(Debug, Default)]
pub struct TickGuard {
    busy: AtomicBool,
}

impl TickGuard {
    pub fn try_enter(&self) -> Option<TickPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop, including when the tick's future is cancelled.
#[derive(Debug)]
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginDenied {
    /// `max_attempts` used up for this outage. `first` is true only on the first refusal.
    Exhausted { attempts: u32, first: bool },
    CoolingDown { remaining: Duration },
}

/// Bounded automatic sign-in: `max_attempts` per outage, `cooldown` apart.
#[derive(Debug)]
pub struct LoginGuard {
    max_attempts: u32,
    cooldown: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
    exhaustion_reported: bool,
}

impl LoginGuard {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
            attempts: 0,
            last_attempt: None,
            exhaustion_reported: false,
        }
    }

    /// Claim an attempt at `now`, returning its 1-based number.
    pub fn try_begin(&mut self, now: Instant) -> Result<u32, LoginDenied> {
        if self.attempts >= self.max_attempts {
            let first = !self.exhaustion_reported;
            self.exhaustion_reported = true;
            return Err(LoginDenied::Exhausted {
                attempts: self.attempts,
                first,
            });
        }
        if let Some(last) = self.last_attempt {
            let ready_at = last + self.cooldown;
            if now < ready_at {
                return Err(LoginDenied::CoolingDown {
                    remaining: ready_at - now,
                });
            }
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        Ok(self.attempts)
    }

    /// Connectivity is back (or a manual sign-in worked): start a fresh budget.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
        self.exhaustion_reported = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
