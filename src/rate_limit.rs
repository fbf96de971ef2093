//! Shared per-endpoint rate limiting.
//!
//! A GCRA token bucket from `governor` bounds the permit rate. Waiters queue on
//! a fair tokio mutex so acquisition is FIFO and no worker starves.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit wait for {endpoint} exceeded {waited:?}")]
    Timeout { endpoint: String, waited: Duration },
    #[error("rate budget for {0} must be greater than zero")]
    ZeroBudget(String),
}

/// Token bucket for one external endpoint, shared by all workers.
pub struct EndpointLimiter {
    endpoint: String,
    limiter: DirectLimiter,
    queue: Mutex<()>,
    max_wait: Duration,
}

impl EndpointLimiter {
    /// `budget` permits per second with up to `burst` permits at once.
    pub fn new(
        endpoint: impl Into<String>,
        budget: u32,
        burst: u32,
        max_wait: Duration,
    ) -> Result<Arc<Self>, RateLimitError> {
        let endpoint = endpoint.into();
        let per_second =
            NonZeroU32::new(budget).ok_or_else(|| RateLimitError::ZeroBudget(endpoint.clone()))?;
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Ok(Arc::new(Self {
            endpoint,
            limiter: RateLimiter::direct(quota),
            queue: Mutex::new(()),
            max_wait,
        }))
    }

    /// Block until a permit is available, up to the configured ceiling.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let wait = async {
            let _turn = self.queue.lock().await;
            self.limiter.until_ready().await;
        };

        tokio::time::timeout(self.max_wait, wait)
            .await
            .map_err(|_| {
                debug!(endpoint = %self.endpoint, "Rate limit wait timed out");
                RateLimitError::Timeout {
                    endpoint: self.endpoint.clone(),
                    waited: self.max_wait,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn zero_budget_is_rejected() {
        let err = EndpointLimiter::new("geocode", 0, 1, Duration::from_secs(1)).err();
        assert!(matches!(err, Some(RateLimitError::ZeroBudget(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_stay_within_budget() {
        let budget = 20u32;
        let burst = 1u32;
        let limiter = EndpointLimiter::new("geocode", budget, burst, Duration::from_secs(10)).unwrap();
        let permitted = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            let permitted = Arc::clone(&permitted);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.acquire().await.unwrap();
                    permitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let window = start.elapsed().as_secs_f64();
        let count = permitted.load(Ordering::SeqCst) as f64;

        assert_eq!(count, 30.0);
        // 20ms of slack for clock granularity between governor and Instant.
        assert!(
            count <= burst as f64 + budget as f64 * (window + 0.02),
            "{} permits in {:.3}s exceeds budget",
            count,
            window
        );
    }

    #[tokio::test]
    async fn wait_beyond_ceiling_times_out() {
        let limiter = EndpointLimiter::new("maps", 1, 1, Duration::from_millis(50)).unwrap();
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }
}
