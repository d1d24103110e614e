// =============================================================================
// Token-bucket rate limiter with venue-triggered slowdown
// =============================================================================
//
// The bucket holds up to `burst` tokens and refills continuously at
// requests_per_minute / 60 tokens per second, computed from the wall-clock
// delta on every acquire. When the caller observes a rate-limit response it
// triggers `slowdown`, which halves the effective fill rate until the window
// expires. Acquire sleeps for the token shortfall divided by the effective
// fill rate, then re-acquires; the deadline variant reports would-block
// instead of sleeping past its bound.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

struct Inner {
    tokens: f64,
    last_refill: Instant,
    slowdown_until: Option<Instant>,
    total_requests: u64,
    total_waits: u64,
}

/// Thread-safe token bucket shared by all downloader workers.
pub struct RateLimiter {
    name: String,
    requests_per_minute: u32,
    burst: f64,
    inner: Mutex<Inner>,
}

/// Snapshot of the limiter counters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_waits: u64,
    pub current_tokens: f64,
    pub is_slowed: bool,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        info!(
            limiter = %name,
            requests_per_minute,
            burst,
            "rate limiter initialised"
        );
        Self {
            name,
            requests_per_minute,
            burst: burst as f64,
            inner: Mutex::new(Inner {
                tokens: burst as f64,
                last_refill: Instant::now(),
                slowdown_until: None,
                total_requests: 0,
                total_waits: 0,
            }),
        }
    }

    fn base_fill_rate(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }

    /// Effective fill rate, halved while a slowdown window is active.
    fn effective_fill_rate(&self, inner: &Inner, now: Instant) -> f64 {
        match inner.slowdown_until {
            Some(until) if now < until => self.base_fill_rate() * 0.5,
            _ => self.base_fill_rate(),
        }
    }

    fn refill(&self, inner: &mut Inner, now: Instant) {
        let rate = self.effective_fill_rate(inner, now);
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.last_refill = now;
        inner.tokens = (inner.tokens + elapsed * rate).min(self.burst);
    }

    /// Take `tokens` immediately, or report the sleep needed to afford them.
    fn try_take(&self, tokens: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refill(&mut inner, now);

        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            inner.total_requests += 1;
            return Ok(());
        }

        let shortfall = tokens - inner.tokens;
        let rate = self.effective_fill_rate(&inner, now);
        inner.total_waits += 1;
        Err(Duration::from_secs_f64(shortfall / rate))
    }

    /// Acquire `tokens`, sleeping as long as it takes.
    pub async fn acquire(&self, tokens: f64) {
        loop {
            match self.try_take(tokens) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(limiter = %self.name, wait_secs = wait.as_secs_f64(), "throttling");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Acquire `tokens` but never sleep past `timeout`. Returns `false`
    /// (would-block) when the shortfall cannot be covered within the bound.
    pub async fn acquire_timeout(&self, tokens: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_take(tokens) {
                Ok(()) => return true,
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return false;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Halve the effective fill rate for `duration`. Called by workers that
    /// observe a rate-limit response from the venue.
    pub fn slowdown(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        // Settle accrued tokens at the old rate before the window starts.
        let now = Instant::now();
        self.refill(&mut inner, now);
        inner.slowdown_until = Some(now + duration);
        warn!(
            limiter = %self.name,
            secs = duration.as_secs_f64(),
            "slowdown engaged — fill rate halved"
        );
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refill(&mut inner, now);
        RateLimiterStats {
            total_requests: inner.total_requests,
            total_waits: inner.total_waits,
            current_tokens: inner.tokens,
            is_slowed: matches!(inner.slowdown_until, Some(until) if now < until),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("burst", &self.burst)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_available_without_sleeping() {
        let limiter = RateLimiter::new(60, 5, "test");
        // Five tokens come straight from the burst; zero-timeout acquires
        // must not block for any of them.
        for i in 0..5 {
            assert!(
                limiter.acquire_timeout(1.0, Duration::ZERO).await,
                "token {i} should be free"
            );
        }
        // The sixth would need a refill: would-block.
        assert!(!limiter.acquire_timeout(1.0, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn timeout_shorter_than_shortfall_reports_would_block() {
        // 60 rpm = 1 token/sec; an empty bucket needs ~1 s for the next one.
        let limiter = RateLimiter::new(60, 1, "test");
        assert!(limiter.acquire_timeout(1.0, Duration::ZERO).await);
        assert!(
            !limiter
                .acquire_timeout(1.0, Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn acquire_sleeps_then_succeeds() {
        // 6000 rpm = 100 tokens/sec: draining the burst forces a ~10 ms wait.
        let limiter = RateLimiter::new(6000, 1, "test");
        limiter.acquire(1.0).await;
        let start = Instant::now();
        limiter.acquire(1.0).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn slowdown_halves_the_effective_rate() {
        // 60 rpm: 1 token/sec normally, 0.5 tokens/sec slowed. With an empty
        // bucket the shortfall for one token is ~1 s normally, ~2 s slowed —
        // a 1.2 s budget covers the former but not the latter.
        let limiter = RateLimiter::new(60, 1, "test");
        assert!(limiter.acquire_timeout(1.0, Duration::ZERO).await);

        limiter.slowdown(Duration::from_secs(60));
        assert!(limiter.stats().is_slowed);
        assert!(
            !limiter
                .acquire_timeout(1.0, Duration::from_millis(1200))
                .await
        );
    }

    #[tokio::test]
    async fn tokens_cap_at_burst() {
        let limiter = RateLimiter::new(6000, 3, "test");
        // Plenty of refill time at 100 tokens/sec, but the bucket never
        // exceeds its burst.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = limiter.stats();
        assert!(stats.current_tokens <= 3.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_count_requests_and_waits() {
        let limiter = RateLimiter::new(60, 2, "test");
        limiter.acquire(1.0).await;
        limiter.acquire(1.0).await;
        let _ = limiter.acquire_timeout(1.0, Duration::ZERO).await;

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_waits, 1);
    }
}
