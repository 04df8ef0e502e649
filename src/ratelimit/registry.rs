//! In-process token bucket registry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{AdmissionBackend, Decision};
use super::bucket::TokenBucket;
use super::policy::Policy;
use super::store::StoreError;

type BucketMap = HashMap<String, LimiterHandle>;

/// A handle to one live bucket in a [`LocalRegistry`].
///
/// Handles are cheap to clone and safe to use from many tasks at once; each operation
/// holds the bucket's own lock only for the refill arithmetic.
#[derive(Debug, Clone)]
pub struct LimiterHandle {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl LimiterHandle {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(rate, burst, now))),
        }
    }

    /// Consume one token if one is available now.
    pub fn allow(&self) -> bool {
        self.bucket.lock().try_take(Instant::now())
    }

    /// Time until a token would be available, without consuming one.
    pub fn reserve(&self) -> Duration {
        self.bucket.lock().delay_until_available(Instant::now())
    }

    /// Current token balance.
    pub fn tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens()
    }

    fn last_refill(&self) -> Instant {
        self.bucket.lock().last_refill()
    }
}

/// Owns the live buckets of one process and evicts idle ones.
///
/// The map is guarded by a single mutex; creation, policy updates and sweeping all go
/// through it. A background task sweeps every `ttl / 2` and is stopped when the
/// registry is closed or dropped.
pub struct LocalRegistry {
    buckets: Arc<Mutex<BucketMap>>,
    ttl: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl LocalRegistry {
    /// Create a registry and start its idle sweep. Must be called within a tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        let mut registry = Self::without_sweeper(ttl);
        registry.sweeper = Some(registry.spawn_sweeper());
        registry
    }

    /// Create a registry with no background sweep; call [`LocalRegistry::sweep`] manually.
    pub fn without_sweeper(ttl: Duration) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            sweeper: None,
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        let ttl = self.ttl;
        let period = (ttl / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                sweep_idle(&buckets, ttl, Instant::now());
            }
        })
    }

    /// Get or create the bucket for `key`, updating its limits in place if they changed.
    pub fn get(&self, key: &str, rate: f64, burst: f64) -> LimiterHandle {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        if let Some(handle) = buckets.get(key) {
            let mut bucket = handle.bucket.lock();
            if bucket.rate() != rate || bucket.burst() != burst {
                debug!(
                    key = %key,
                    rate = rate,
                    burst = burst,
                    "Updating bucket limits in place"
                );
                bucket.set_limits(rate, burst, now);
            } else {
                bucket.touch(now);
            }
            return handle.clone();
        }

        trace!(key = %key, rate = rate, burst = burst, "Creating new bucket");
        let handle = LimiterHandle::new(rate, burst, now);
        buckets.insert(key.to_string(), handle.clone());
        handle
    }

    /// Remove buckets idle for longer than the registry ttl.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.buckets, self.ttl, Instant::now())
    }

    /// Idle lifetime of a bucket.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a bucket currently exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.buckets.lock().contains_key(key)
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Stop the background sweep. Buckets stay usable.
    pub fn close(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl Drop for LocalRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn sweep_idle(buckets: &Mutex<BucketMap>, ttl: Duration, now: Instant) -> usize {
    let mut buckets = buckets.lock();
    let before = buckets.len();
    buckets.retain(|_, handle| now.saturating_duration_since(handle.last_refill()) <= ttl);
    let removed = before - buckets.len();

    if removed > 0 {
        debug!(
            removed = removed,
            retained = buckets.len(),
            "Swept idle buckets"
        );
    }
    removed
}

/// Single-node admission backend over a [`LocalRegistry`].
pub struct LocalLimiter {
    registry: LocalRegistry,
}

impl LocalLimiter {
    pub fn new(registry: LocalRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }
}

#[async_trait]
impl AdmissionBackend for LocalLimiter {
    async fn check(&self, key: &str, policy: &Policy) -> Result<Decision, StoreError> {
        let handle = self.registry.get(key, policy.rate(), f64::from(policy.burst()));
        if handle.allow() {
            return Ok(Decision::allow(handle.tokens()));
        }
        Ok(Decision::deny(handle.tokens(), handle.reserve()))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
