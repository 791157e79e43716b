//! Retry delay computation.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * n`.
    Linear,
    /// `base * 2^(n-1)`.
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Delay policy applied when an attempt fails and a retry remains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max,
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * attempt as f64,
            BackoffStrategy::Exponential => {
                // Cap the exponent so huge attempt counts don't overflow to inf
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
        }
        .min(max_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(10));
    }

    #[test]
    fn zero_attempt_has_no_delay() {
        assert_eq!(BackoffPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn fixed_and_linear() {
        let fixed = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(250));

        let linear = BackoffPolicy {
            strategy: BackoffStrategy::Linear,
            base: Duration::from_secs(2),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(5), "{delay:?}");
            assert!(delay <= Duration::from_secs(15), "{delay:?}");
        }
    }

    #[test]
    fn strategy_parse() {
        assert_eq!("Fixed".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Fixed);
        assert_eq!("exp".parse::<BackoffStrategy>().unwrap(), BackoffStrategy::Exponential);
        assert!("random".parse::<BackoffStrategy>().is_err());
    }
}
