//! Adaptive concurrency limiter.
//!
//! A semaphore sized to `concurrency_limit` gates every generation call. When
//! a call is rate limited the limiter retires one permit (never going below
//! one); after `GROW_AFTER` consecutive successes it hands one back, up to the
//! configured limit. A permit that is held when a shrink happens is retired
//! when it is released, so the number of outstanding permits never exceeds the
//! current target for long and never exceeds the configured limit at all.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Consecutive successes needed before restoring one permit.
pub const GROW_AFTER: usize = 8;

#[derive(Debug)]
struct State {
    target: usize,
    /// Permits to retire as soon as they are released.
    debt: usize,
    streak: usize,
}

#[derive(Debug)]
pub struct AdaptiveLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    adaptive: bool,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl AdaptiveLimiter {
    pub fn new(limit: usize, adaptive: bool) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            adaptive,
            state: Mutex::new(State {
                target: limit,
                debt: 0,
                streak: 0,
            }),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<LimiterPermit, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(LimiterPermit {
            permit: Some(permit),
            limiter: Arc::clone(self),
        })
    }

    /// Current effective concurrency.
    pub fn target(&self) -> usize {
        self.state().target
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Shrink by one permit. Returns the new target if it changed.
    pub fn on_rate_limited(&self) -> Option<usize> {
        if !self.adaptive {
            return None;
        }
        let mut st = self.state();
        st.streak = 0;
        if st.target <= 1 {
            return None;
        }
        st.target -= 1;
        match self.semaphore.try_acquire() {
            Ok(p) => p.forget(),
            Err(_) => st.debt += 1,
        }
        Some(st.target)
    }

    /// Count a success; every `GROW_AFTER` in a row restores one permit.
    /// Returns the new target if it changed.
    pub fn on_success(&self) -> Option<usize> {
        if !self.adaptive {
            return None;
        }
        let mut st = self.state();
        if st.target >= self.limit {
            st.streak = 0;
            return None;
        }
        st.streak += 1;
        if st.streak < GROW_AFTER {
            return None;
        }
        st.streak = 0;
        st.target += 1;
        if st.debt > 0 {
            st.debt -= 1;
        } else {
            self.semaphore.add_permits(1);
        }
        Some(st.target)
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut st = self.state();
        if st.debt > 0 {
            st.debt -= 1;
            permit.forget();
        }
    }
}

/// Held for the duration of one generation call.
#[derive(Debug)]
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    limiter: Arc<AdaptiveLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        if let Some(p) = self.permit.take() {
            self.limiter.release(p);
        }
    }
}
