use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use common::{Error, RateConfig, Result};

/// Upstream request class. Queries and orders are throttled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Query,
    Order,
}

/// Classify a broker api-id into a bucket. Order endpoints live in the
/// `kt10xxx` range; everything unknown is treated as a query.
pub fn classify_api_id(api_id: &str) -> RequestKind {
    match api_id {
        // Quote / chart / account queries
        "ka10001" | "ka10004" | "ka10081" | "ka10075" | "ka10076" | "kt00001" | "kt00004" => {
            RequestKind::Query
        }
        // Buy / sell / modify / cancel
        "kt10000" | "kt10001" | "kt10002" | "kt10003" => RequestKind::Order,
        other if other.starts_with("kt10") => RequestKind::Order,
        _ => RequestKind::Query,
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// `None` until the first request: the first acquire is never delayed.
    last_request: Option<Instant>,
}

/// Token bucket with a minimum inter-request spacing enforced even when
/// tokens are available, to defeat upstream burst detection.
struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    min_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(limit: u32, min_interval: Duration) -> Self {
        Self {
            max_tokens: limit as f64,
            refill_rate: limit as f64,
            min_interval,
            state: Mutex::new(BucketState {
                tokens: limit as f64,
                last_refill: Instant::now(),
                last_request: None,
            }),
        }
    }

    /// Wait until both a token and the minimum spacing are available.
    /// Returns the time spent waiting. The lock is only held to inspect
    /// and mutate state; all sleeping happens unlocked.
    async fn acquire(&self, timeout: Option<Duration>) -> Result<Duration> {
        let start = Instant::now();

        loop {
            let wait = {
                let mut state = self.state.lock().await;

                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
                state.last_refill = now;

                let since_last = state
                    .last_request
                    .map(|t| now.duration_since(t))
                    .unwrap_or(self.min_interval);

                if since_last < self.min_interval {
                    self.min_interval - since_last
                } else if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    state.last_request = Some(now);
                    return Ok(start.elapsed());
                } else {
                    Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
                }
            };

            if let Some(limit) = timeout {
                if start.elapsed() + wait > limit {
                    return Err(Error::RateLimited(format!(
                        "rate limit wait exceeded {:.1}s deadline",
                        limit.as_secs_f64()
                    )));
                }
            }

            tokio::time::sleep(wait.min(Duration::from_millis(100))).await;
        }
    }

    async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.max_tokens)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RateLimiterStats {
    pub query_count: u64,
    pub order_count: u64,
    pub total_wait_sec: f64,
}

/// Two independent token buckets, one per request class, with cumulative
/// wait counters for observability.
pub struct RateLimiter {
    query: TokenBucket,
    order: TokenBucket,
    stats: Mutex<RateLimiterStats>,
}

impl RateLimiter {
    pub fn new(config: &RateConfig) -> Self {
        let min_interval = Duration::from_secs_f64(config.min_interval_sec);
        Self {
            query: TokenBucket::new(config.query_per_sec, min_interval),
            order: TokenBucket::new(config.order_per_sec, min_interval),
            stats: Mutex::new(RateLimiterStats::default()),
        }
    }

    /// Acquire a slot for one upstream request, waiting at most `timeout`.
    pub async fn acquire(&self, kind: RequestKind, timeout: Option<Duration>) -> Result<()> {
        let bucket = match kind {
            RequestKind::Query => &self.query,
            RequestKind::Order => &self.order,
        };
        let waited = bucket.acquire(timeout).await?;

        let mut stats = self.stats.lock().await;
        match kind {
            RequestKind::Query => stats.query_count += 1,
            RequestKind::Order => stats.order_count += 1,
        }
        stats.total_wait_sec += waited.as_secs_f64();
        drop(stats);

        if waited > Duration::from_millis(10) {
            debug!(kind = ?kind, waited_ms = waited.as_millis() as u64, "rate limit wait");
        }
        Ok(())
    }

    pub async fn stats(&self) -> RateLimiterStats {
        *self.stats.lock().await
    }

    pub async fn query_tokens_available(&self) -> f64 {
        self.query.available().await
    }

    pub async fn order_tokens_available(&self) -> f64 {
        self.order.available().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RateConfig {
        RateConfig {
            query_per_sec: 5,
            order_per_sec: 5,
            min_interval_sec: 0.05,
            acquire_timeout_sec: 30.0,
        }
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(&fast_config());
        let start = Instant::now();
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn consecutive_acquires_respect_min_interval() {
        let limiter = RateLimiter::new(&fast_config());
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        let start = Instant::now();
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        // min_interval 50ms, allow small scheduling slack
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "spacing was {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let limiter = RateLimiter::new(&fast_config());
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        // An order acquire right after a query must not wait for the query
        // bucket's spacing.
        let start = Instant::now();
        limiter.acquire(RequestKind::Order, None).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn deadline_miss_returns_rate_limited() {
        let limiter = RateLimiter::new(&RateConfig {
            query_per_sec: 1,
            order_per_sec: 1,
            min_interval_sec: 5.0,
            acquire_timeout_sec: 30.0,
        });
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        let err = limiter
            .acquire(RequestKind::Query, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn stats_count_per_kind() {
        let limiter = RateLimiter::new(&fast_config());
        limiter.acquire(RequestKind::Query, None).await.unwrap();
        limiter.acquire(RequestKind::Order, None).await.unwrap();
        let stats = limiter.stats().await;
        assert_eq!(stats.query_count, 1);
        assert_eq!(stats.order_count, 1);
    }

    #[test]
    fn api_id_classification() {
        assert_eq!(classify_api_id("ka10001"), RequestKind::Query);
        assert_eq!(classify_api_id("kt00001"), RequestKind::Query);
        assert_eq!(classify_api_id("kt10000"), RequestKind::Order);
        assert_eq!(classify_api_id("kt10099"), RequestKind::Order);
        // Unknown ids default to the query bucket
        assert_eq!(classify_api_id("zz99999"), RequestKind::Query);
    }
}
