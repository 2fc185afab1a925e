//! Token-bucket rate limiting per (agent, tool).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{BucketLimit, ConfigurationError, RateLimitConfig, ToolCapability};

use super::store::{CallKey, KeyedStore};

/// Outcome of one [`RateLimiter::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// `retry_after` is when the next whole token will be available; `None`
    /// when the bucket never refills.
    Denied { retry_after: Option<Duration> },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Admission control for tool calls.
///
/// The in-process implementation is [`InMemoryRateLimiter`]; a deployment
/// with several workers can supply a shared-store implementation instead.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one token from the bucket for `key`, creating it full if absent.
    async fn try_consume(&self, key: &CallKey, limit: BucketLimit) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    buckets: KeyedStore<Bucket>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the bucket for `key`; it comes back full.
    pub fn evict(&self, key: &CallKey) -> bool {
        self.buckets.evict(key)
    }

    /// Drop buckets idle for at least `idle`. A bucket idle that long under
    /// any positive refill rate is full again, so nothing is lost.
    pub fn evict_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill_at) < idle);
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn try_consume(&self, key: &CallKey, limit: BucketLimit) -> RateDecision {
        let now = Instant::now();
        let max = f64::from(limit.max_tokens);
        let rate = f64::from(limit.refill_rate_per_minute);

        self.buckets.with(
            key,
            || Bucket {
                tokens: max,
                last_refill_at: now,
            },
            |bucket| {
                let elapsed = now.saturating_duration_since(bucket.last_refill_at);
                bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate / 60.0).min(max);
                bucket.last_refill_at = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    RateDecision::Allowed {
                        remaining: bucket.tokens.floor() as u32,
                    }
                } else {
                    let retry_after = (rate > 0.0)
                        .then(|| Duration::from_secs_f64((1.0 - bucket.tokens) * 60.0 / rate));
                    RateDecision::Denied { retry_after }
                }
            },
        )
    }
}

/// Bucket for `tool_name`: its override, else the tightest family default
/// among its capabilities.
pub fn resolve_limit(
    config: &RateLimitConfig,
    tool_name: &str,
    capabilities: &BTreeSet<ToolCapability>,
) -> BucketLimit {
    if let Some(limit) = config.overrides.get(tool_name) {
        return *limit;
    }
    capabilities
        .iter()
        .map(ToolCapability::default_bucket)
        .min_by_key(|b| (b.max_tokens, b.refill_rate_per_minute))
        .unwrap_or_else(|| ToolCapability::Custom(String::new()).default_bucket())
}

/// A bucket that can never admit a call is a deployment mistake.
pub fn validate_limit(tool_name: &str, limit: &BucketLimit) -> Result<(), ConfigurationError> {
    if limit.max_tokens == 0 {
        return Err(ConfigurationError::InvalidRateLimit {
            tool_name: tool_name.to_string(),
            reason: "maxTokens must be at least 1".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_bucket_starts_full() {
        let limiter = InMemoryRateLimiter::new();
        let key = CallKey::new("agent", "read_file");
        let decision = limiter.try_consume(&key, BucketLimit::new(3, 3)).await;
        assert_eq!(decision, RateDecision::Allowed { remaining: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_carries_time_to_next_token() {
        let limiter = InMemoryRateLimiter::new();
        let key = CallKey::new("agent", "bash");
        let limit = BucketLimit::new(1, 6);
        assert!(limiter.try_consume(&key, limit).await.is_allowed());
        let decision = limiter.try_consume(&key, limit).await;
        assert_eq!(
            decision,
            RateDecision::Denied {
                retry_after: Some(Duration::from_secs(10))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refill_never_recovers() {
        let limiter = InMemoryRateLimiter::new();
        let key = CallKey::new("agent", "once");
        let limit = BucketLimit::new(1, 0);
        assert!(limiter.try_consume(&key, limit).await.is_allowed());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(
            limiter.try_consume(&key, limit).await,
            RateDecision::Denied { retry_after: None }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_forgets_quiet_buckets() {
        let limiter = InMemoryRateLimiter::new();
        limiter
            .try_consume(&CallKey::new("a", "t"), BucketLimit::new(5, 5))
            .await;
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter
            .try_consume(&CallKey::new("b", "t"), BucketLimit::new(5, 5))
            .await;
        limiter.evict_idle(Duration::from_secs(60));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_resolve_limit_prefers_override() {
        let mut config = RateLimitConfig::default();
        config
            .overrides
            .insert("bash".into(), BucketLimit::new(2, 2));
        let caps: BTreeSet<_> = [ToolCapability::Shell].into();
        assert_eq!(resolve_limit(&config, "bash", &caps), BucketLimit::new(2, 2));
    }

    #[test]
    fn test_resolve_limit_takes_tightest_family() {
        let config = RateLimitConfig::default();
        let caps: BTreeSet<_> = [ToolCapability::FileRead, ToolCapability::Shell].into();
        assert_eq!(resolve_limit(&config, "run", &caps), BucketLimit::new(10, 10));
        assert_eq!(
            resolve_limit(&config, "custom", &BTreeSet::new()),
            BucketLimit::new(60, 60)
        );
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(validate_limit("bash", &BucketLimit::new(0, 10)).is_err());
        assert!(validate_limit("bash", &BucketLimit::new(1, 0)).is_ok());
    }
}
