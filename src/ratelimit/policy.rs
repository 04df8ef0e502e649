//! Rate limit policies.
//!
//! A policy is the `(rate, burst, ttl)` triple attached to a route class. Policies are
//! validated when they are built, so an invalid limit is a startup failure and never a
//! per-request one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Validated token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec", into = "PolicySpec")]
pub struct Policy {
    rate: f64,
    burst: u32,
    ttl: Duration,
}

/// Wire form of a policy as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Tokens regenerated per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Idle lifetime of a bucket in seconds
    pub ttl_secs: u64,
}

impl Policy {
    /// Build a policy, rejecting parameters the limiter cannot honour.
    pub fn new(rate: f64, burst: u32, ttl: Duration) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TurnstileError::InvalidPolicy(format!(
                "rate must be a positive number of tokens per second, got {}",
                rate
            )));
        }
        if burst == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "burst must be at least 1".to_string(),
            ));
        }
        if ttl < Duration::from_secs(1) {
            return Err(TurnstileError::InvalidPolicy(format!(
                "ttl must be at least one second, got {:?}",
                ttl
            )));
        }
        Ok(Self { rate, burst, ttl })
    }

    /// Tokens regenerated per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Idle lifetime after which a bucket may be discarded.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry in whole seconds as the store understands it, rounded up.
    pub fn ttl_secs(&self) -> u64 {
        let secs = self.ttl.as_secs();
        if self.ttl.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl TryFrom<PolicySpec> for Policy {
    type Error = TurnstileError;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        Policy::new(spec.rate, spec.burst, Duration::from_secs(spec.ttl_secs))
    }
}

impl From<Policy> for PolicySpec {
    fn from(policy: Policy) -> Self {
        Self {
            rate: policy.rate,
            burst: policy.burst,
            ttl_secs: policy.ttl_secs(),
        }
    }
}
