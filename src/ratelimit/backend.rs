//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::policy::Policy;
use super::store::StoreError;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Tokens left in the bucket after this check
    pub remaining: f64,
    /// How long until a token is available, set when the request was denied
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    /// A denied request that may retry after `retry_after`.
    pub fn deny(remaining: f64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after: Some(retry_after),
        }
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the in-process `LocalLimiter` and the
/// `DistributedLimiter` so the admission middleware can work with either.
/// The policy is passed on every call; backends never cache it.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Refill and conditionally consume one token from the bucket at `key`.
    async fn check(&self, key: &str, policy: &Policy) -> Result<Decision, StoreError>;

    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;
}
