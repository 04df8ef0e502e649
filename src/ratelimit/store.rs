//! Shared bucket stores.
//!
//! A [`BucketStore`] performs one refill-and-take step on a bucket as a single
//! indivisible operation. [`RedisStore`] runs the step as a server-side Lua script;
//! [`MemoryStore`] has no scripting and keeps the same contract with a versioned
//! compare-and-swap loop.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use super::bucket::{refill_tokens, take_token};

/// Refill-and-take as one server-side step.
///
/// KEYS[1] = bucket key
/// ARGV[1] = now (ms), ARGV[2] = rate (tokens/s), ARGV[3] = burst, ARGV[4] = ttl (s)
///
/// Tokens are returned as a string so fractional balances survive the reply conversion.
const REFILL_AND_TAKE_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local data = redis.call("HMGET", key, "tokens", "last")
local tokens = tonumber(data[1])
local last = tonumber(data[2])

if not tokens or not last then
  tokens = burst
  last = now
else
  local elapsed = math.max(0, now - last) / 1000.0
  tokens = math.min(burst, tokens + elapsed * rate)
  last = math.max(last, now)
end

local allowed = 0
if tokens >= 1.0 then
  tokens = tokens - 1.0
  allowed = 1
end

redis.call("HSET", key, "tokens", tostring(tokens), "last", last)
redis.call("EXPIRE", key, ttl)
return {allowed, tostring(tokens)}
"#;

/// How many times [`MemoryStore`] retries a conflicting write before giving up.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// [`MemoryStore`] drops expired records once every this many commits.
const PURGE_INTERVAL: u64 = 256;

/// Errors from a bucket store. Every variant is treated as fail-open by callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("store transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// The store did not answer within the allotted time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with a shape the protocol does not produce
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// Concurrent writers kept invalidating the compare-and-swap
    #[error("gave up after {attempts} conflicting compare-and-swap attempts")]
    Contention { attempts: u32 },
}

impl StoreError {
    /// Short label used for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Transport(_) => "transport",
            StoreError::Timeout(_) => "timeout",
            StoreError::Malformed(_) => "malformed",
            StoreError::Contention { .. } => "contention",
        }
    }

    /// Whether the error points at a defect rather than an unavailable store.
    pub fn is_defect(&self) -> bool {
        matches!(self, StoreError::Malformed(_))
    }
}

/// Parameters of one refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeRequest {
    /// Caller wall clock in milliseconds since the Unix epoch
    pub now_ms: i64,
    /// Tokens regenerated per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: f64,
    /// Key expiry in seconds
    pub ttl_secs: u64,
}

/// Outcome of one refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeReply {
    pub allowed: bool,
    /// Balance left after the step
    pub tokens: f64,
}

/// A store that can run the refill-and-take step atomically per key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket at `key`, take one token if available, persist, refresh expiry.
    async fn refill_and_take(&self, key: &str, request: TakeRequest) -> Result<TakeReply, StoreError>;
}

/// Redis-backed store executing the step as a Lua script.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis and verify the connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!(url = %url, "Connected to Redis bucket store");
        Ok(Self::with_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(REFILL_AND_TAKE_LUA),
        }
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn refill_and_take(&self, key: &str, request: TakeRequest) -> Result<TakeReply, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Value = self
            .script
            .key(key)
            .arg(request.now_ms)
            .arg(request.rate)
            .arg(request.burst)
            .arg(request.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, reply = ?reply, "Bucket script reply");
        parse_reply(reply)
    }
}

/// Decode the script reply `{allowed, tokens}`.
///
/// `allowed` may arrive as an integer, a double or a string; so may `tokens`.
pub fn parse_reply(reply: Value) -> Result<TakeReply, StoreError> {
    let items = match reply {
        Value::Array(items) => items,
        other => {
            return Err(StoreError::Malformed(format!(
                "expected a two element array, got {:?}",
                other
            )))
        }
    };
    if items.len() < 2 {
        return Err(StoreError::Malformed(format!(
            "expected a two element array, got {} elements",
            items.len()
        )));
    }

    let allowed = value_as_f64(&items[0])
        .ok_or_else(|| StoreError::Malformed(format!("unreadable allowed flag {:?}", items[0])))?;
    let tokens = value_as_f64(&items[1])
        .filter(|tokens| tokens.is_finite())
        .ok_or_else(|| StoreError::Malformed(format!("unreadable token count {:?}", items[1])))?;

    Ok(TakeReply {
        allowed: allowed as i64 == 1,
        tokens,
    })
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Double(d) => Some(*d),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
        Value::SimpleString(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One versioned bucket record held by [`MemoryStore`].
#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    tokens: f64,
    last_ms: i64,
    expires_at_ms: i64,
    version: u64,
}

/// In-process store for deployments without a scripting store.
///
/// Each step reads a versioned snapshot, computes the new balance off-lock and commits
/// only if no other writer bumped the version in between, retrying otherwise. Expired
/// records are purged every few hundred commits, so the map stays bounded by the
/// keys active within one ttl plus one interval.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every record whose expiry is at or before `now_ms`.
    pub fn purge_expired(&self, now_ms: i64) {
        self.buckets.retain(|_, bucket| bucket.expires_at_ms > now_ms);
    }

    fn snapshot(&self, key: &str, now_ms: i64) -> Option<StoredBucket> {
        self.buckets
            .get(key)
            .map(|entry| *entry.value())
            .filter(|bucket| bucket.expires_at_ms > now_ms)
    }

    /// Commit `next` if the stored version still equals `expected` (`None` = absent or expired).
    fn compare_and_set(&self, key: &str, expected: Option<u64>, next: StoredBucket, now_ms: i64) -> bool {
        let mut entry = self.buckets.entry(key.to_string()).or_insert(StoredBucket {
            version: 0,
            expires_at_ms: i64::MIN,
            ..next
        });
        let current = entry.value();
        let live_version = if current.expires_at_ms > now_ms {
            Some(current.version)
        } else {
            None
        };
        if live_version != expected {
            return false;
        }
        let base_version = current.version;
        *entry.value_mut() = StoredBucket {
            version: base_version + 1,
            ..next
        };
        true
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn refill_and_take(&self, key: &str, request: TakeRequest) -> Result<TakeReply, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let snapshot = self.snapshot(key, request.now_ms);

            let (mut tokens, last_ms) = match snapshot {
                Some(bucket) => {
                    let elapsed = (request.now_ms - bucket.last_ms).max(0) as f64 / 1000.0;
                    (
                        refill_tokens(bucket.tokens, elapsed, request.rate, request.burst),
                        bucket.last_ms.max(request.now_ms),
                    )
                }
                None => (request.burst, request.now_ms),
            };
            let allowed = take_token(&mut tokens);

            let next = StoredBucket {
                tokens,
                last_ms,
                expires_at_ms: request.now_ms + (request.ttl_secs as i64) * 1000,
                version: 0,
            };
            if self.compare_and_set(key, snapshot.map(|b| b.version), next, request.now_ms) {
                let commits = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
                if commits % PURGE_INTERVAL == 0 {
                    self.purge_expired(request.now_ms);
                    trace!(retained = self.buckets.len(), "Purged expired buckets");
                }
                return Ok(TakeReply { allowed, tokens });
            }
            trace!(key = %key, attempt, "Compare-and-swap conflict, retrying");
        }

        Err(StoreError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}
