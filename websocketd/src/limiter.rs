use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
#[error("fork not allowed, too many concurrent sessions")]
pub struct ForkNotAllowed;

/// Global admission control for concurrent child processes.
///
/// A bounded counting semaphore: one token per running session, acquired at
/// upgrade admission and returned when the [`ForkGuard`] drops. Capacity 0
/// means unlimited.
#[derive(Debug)]
pub struct ForkLimiter {
    semaphore: Option<Arc<Semaphore>>,
}

impl ForkLimiter {
    pub fn new(max_forks: usize) -> Self {
        let semaphore = (max_forks > 0).then(|| Arc::new(Semaphore::new(max_forks)));
        Self { semaphore }
    }

    /// Non-blocking: a token or an immediate refusal.
    pub fn try_acquire(&self) -> Result<ForkGuard, ForkNotAllowed> {
        match &self.semaphore {
            None => Ok(ForkGuard { _permit: None }),
            Some(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .map(|permit| ForkGuard {
                    _permit: Some(permit),
                })
                .map_err(|_| ForkNotAllowed),
        }
    }
}

/// One occupied slot; dropping it frees the slot exactly once.
#[derive(Debug)]
pub struct ForkGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_past_capacity_and_recovers_on_release() {
        let limiter = ForkLimiter::new(2);

        let first = limiter.try_acquire().expect("slot 1");
        let _second = limiter.try_acquire().expect("slot 2");
        assert!(limiter.try_acquire().is_err(), "third acquire must be refused");

        drop(first);
        let _third = limiter.try_acquire().expect("slot freed by release");
        assert!(limiter.try_acquire().is_err(), "pool is full again");
    }

    #[tokio::test]
    async fn zero_capacity_is_unlimited() {
        let limiter = ForkLimiter::new(0);
        let guards: Vec<_> = (0..1000).map(|_| limiter.try_acquire().expect("unlimited")).collect();
        assert_eq!(guards.len(), 1000);
    }
}
