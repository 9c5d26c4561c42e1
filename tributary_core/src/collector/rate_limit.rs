use crate::{Error, Result};
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

#[derive(Debug)]
struct Budget {
    remaining: u64,
    reset_at: Instant,
    /// Last `X-RateLimit-Reset` seen; a larger value means upstream opened a new window.
    upstream_reset: Option<u64>,
}

/// Cost-based request budget shared by every task using one connection.
///
/// `acquire` decrements the budget atomically under the lock; once the next
/// request would overdraw it, callers sleep until the window resets.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u64,
    window: Duration,
    budget: Mutex<Budget>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidInput("rate limit capacity must be > 0".to_string()));
        }
        if window.is_zero() {
            return Err(Error::InvalidInput("rate limit window must be > 0".to_string()));
        }
        Ok(Self {
            capacity: capacity as u64,
            window,
            budget: Mutex::new(Budget {
                remaining: capacity as u64,
                reset_at: Instant::now() + window,
                upstream_reset: None,
            }),
        })
    }

    pub fn per_hour(requests: u32) -> Result<Self> {
        Self::new(requests, Duration::from_secs(3600))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub async fn remaining(&self) -> u64 {
        self.budget.lock().await.remaining
    }

    /// Wait until `cost` units are available, then take them.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn acquire(&self, cost: u32) -> Result<()> {
        let cost = cost as u64;
        if cost == 0 {
            return Ok(());
        }
        if cost > self.capacity {
            return Err(Error::InvalidInput(format!(
                "request cost {cost} exceeds rate limit capacity {}",
                self.capacity
            )));
        }
        loop {
            let wait_until = {
                let mut b = self.budget.lock().await;
                let now = Instant::now();
                if now >= b.reset_at {
                    b.remaining = self.capacity;
                    b.reset_at = now + self.window;
                }
                if b.remaining >= cost {
                    b.remaining -= cost;
                    return Ok(());
                }
                b.reset_at
            };
            tracing::debug!(
                wait_ms = wait_until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "rate limit budget exhausted, waiting for reset"
            );
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Adopt the upstream view of the budget when the response advertises it.
    ///
    /// Within a window the header can only lower the budget: a response that
    /// left upstream before concurrent requests landed reports a stale count.
    pub async fn observe(&self, headers: &HeaderMap) {
        let remaining = header_u64(headers, HEADER_REMAINING);
        let reset_epoch = header_u64(headers, HEADER_RESET);
        if remaining.is_none() && reset_epoch.is_none() {
            return;
        }
        let mut b = self.budget.lock().await;
        let new_window = match (b.upstream_reset, reset_epoch) {
            (Some(prev), Some(epoch)) => epoch > prev,
            _ => false,
        };
        if let Some(r) = remaining {
            b.remaining = if new_window {
                r.min(self.capacity)
            } else {
                b.remaining.min(r)
            };
        }
        if let Some(epoch) = reset_epoch {
            b.upstream_reset = Some(epoch);
            let delta = epoch as i64 - chrono::Utc::now().timestamp();
            if delta > 0 {
                b.reset_at = Instant::now() + Duration::from_secs(delta as u64);
            }
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_budget_within_a_window() {
        let window = Duration::from_secs(60);
        let limiter = Arc::new(RateLimiter::new(3, window).unwrap());
        let start = Instant::now();
        let first_window = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..7 {
            let limiter = limiter.clone();
            let counter = first_window.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                if Instant::now().duration_since(start) < window {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Instant::now().duration_since(start)
            }));
        }
        let mut elapsed = Vec::new();
        for h in handles {
            elapsed.push(h.await.unwrap());
        }
        elapsed.sort();
        assert_eq!(first_window.load(Ordering::SeqCst), 3);
        assert!(elapsed[3] >= window);
        assert!(elapsed[5] < window * 2);
        assert!(elapsed[6] >= window * 2);
    }

    #[tokio::test]
    async fn oversized_cost_is_rejected() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1)).unwrap();
        assert!(matches!(limiter.acquire(3).await, Err(Error::InvalidInput(_))));
        limiter.acquire(0).await.unwrap();
        assert_eq!(limiter.remaining().await, 2);
    }

    #[tokio::test]
    async fn headers_override_local_count() {
        let limiter = RateLimiter::new(100, Duration::from_secs(3600)).unwrap();
        let mut h = HeaderMap::new();
        h.insert(HEADER_REMAINING, HeaderValue::from_static("4"));
        limiter.observe(&h).await;
        assert_eq!(limiter.remaining().await, 4);
    }

    #[tokio::test]
    async fn stale_header_cannot_raise_budget_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60)).unwrap();
        for _ in 0..3 {
            limiter.acquire(1).await.unwrap();
        }
        let reset = (chrono::Utc::now().timestamp() + 60).to_string();
        let mut h = HeaderMap::new();
        h.insert(HEADER_REMAINING, HeaderValue::from_static("2"));
        h.insert(HEADER_RESET, HeaderValue::from_str(&reset).unwrap());
        limiter.observe(&h).await;
        assert_eq!(limiter.remaining().await, 0);

        // same window reported again: still no refill
        limiter.observe(&h).await;
        assert_eq!(limiter.remaining().await, 0);
        let granted = tokio::time::timeout(Duration::from_millis(50), limiter.acquire(1)).await;
        assert!(granted.is_err());

        // a later reset epoch is a fresh upstream window
        let next = (chrono::Utc::now().timestamp() + 3660).to_string();
        h.insert(HEADER_RESET, HeaderValue::from_str(&next).unwrap());
        limiter.observe(&h).await;
        assert_eq!(limiter.remaining().await, 2);
    }
}
