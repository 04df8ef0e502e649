//! Distributed rate limiter backed by a shared bucket store.
//!
//! Every check is one atomic refill-and-take step executed by the store, so processes
//! sharing the store see a single serialized history per key. The call is bounded by a
//! short timeout; the limiter never retries.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{AdmissionBackend, Decision};
use super::bucket::delay_for_token;
use super::policy::Policy;
use super::store::{BucketStore, StoreError, TakeRequest};

/// Prefix applied to every bucket key written to the store.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";
/// Upper bound on one store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// A token bucket limiter whose state lives in a shared store.
pub struct DistributedLimiter {
    /// The store executing the atomic step
    store: Arc<dyn BucketStore>,
    /// Namespace for bucket keys
    key_prefix: String,
    /// Upper bound on one store call
    timeout: Duration,
}

impl DistributedLimiter {
    /// Create a limiter with the default prefix and timeout.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set the bucket key namespace.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the upper bound on one store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one refill-and-take step for `key` under `policy`.
    pub async fn allow(&self, key: &str, policy: &Policy) -> Result<Decision, StoreError> {
        let store_key = format!("{}{}", self.key_prefix, key);
        let request = TakeRequest {
            now_ms: chrono::Utc::now().timestamp_millis(),
            rate: policy.rate(),
            burst: f64::from(policy.burst()),
            ttl_secs: policy.ttl_secs(),
        };

        trace!(
            key = %store_key,
            rate = request.rate,
            burst = request.burst,
            "Checking distributed rate limit"
        );

        let reply = tokio::time::timeout(self.timeout, self.store.refill_and_take(&store_key, request))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        if reply.allowed {
            Ok(Decision::allow(reply.tokens))
        } else {
            debug!(
                key = %store_key,
                tokens = reply.tokens,
                "Distributed rate limit exceeded"
            );
            Ok(Decision::deny(
                reply.tokens,
                delay_for_token(reply.tokens, policy.rate()),
            ))
        }
    }
}

#[async_trait]
impl AdmissionBackend for DistributedLimiter {
    async fn check(&self, key: &str, policy: &Policy) -> Result<Decision, StoreError> {
        self.allow(key, policy).await
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}
