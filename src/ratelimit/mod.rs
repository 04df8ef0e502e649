//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod distributed;
mod events;
mod key;
mod policy;
mod registry;
mod store;

pub use backend::{AdmissionBackend, Decision};
pub use bucket::retry_after_secs;
pub use distributed::{DistributedLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use events::{
    AdmissionEvents, MetricsEvents, NoopEvents, REJECTIONS_METRIC, STORE_ERRORS_METRIC,
};
pub use key::{extract_identity, normalize_identity, KeyStrategy, RequestDescriptor};
pub use policy::{Policy, PolicySpec};
pub use registry::{LimiterHandle, LocalLimiter, LocalRegistry};
pub use store::{parse_reply, BucketStore, MemoryStore, RedisStore, StoreError, TakeReply, TakeRequest};
