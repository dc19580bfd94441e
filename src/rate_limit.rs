//! Rate limits for LLM API calls, written as `10/s` or `100/m`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which a rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPeriod {
    Second,
    Minute,
}

impl RateLimitPeriod {
    /// The length of this period.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Build a [`RateLimiter`] that starts with a full bucket.
    ///
    /// Per-minute limits refill all at once, so two `run`s started back to
    /// back may briefly exceed the limit.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected REQUESTS/PERIOD"))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("request count must be at least 1"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse()?,
            })
        };
        parse(s).with_context(|| format!("failed to parse rate limit: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let rate_limit = RateLimit::from_str("10/s").unwrap();
        assert_eq!(rate_limit.max_requests, 10);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Second);
        assert_eq!(rate_limit.to_string(), "10/s");

        let rate_limit = RateLimit::from_str("100/m").unwrap();
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Minute);
        assert_eq!(rate_limit.to_string(), "100/m");
    }

    #[test]
    fn rejects_malformed_limits() {
        for bad in ["10/h", "10", "0/s", "x/s"] {
            assert!(RateLimit::from_str(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn limiter_starts_full() {
        let limiter = RateLimit::from_str("3/m").unwrap().to_rate_limiter();
        assert!(limiter.try_acquire(3));
        assert!(!limiter.try_acquire(1));
    }
}
