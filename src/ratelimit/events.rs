//! Admission events.
//!
//! The middleware reports rejections and absorbed store failures through an injected
//! [`AdmissionEvents`] sink rather than calling a global registry directly.

use metrics::{counter, describe_counter};

use super::store::StoreError;

pub const REJECTIONS_METRIC: &str = "rate_limit_exceeded_total";
pub const STORE_ERRORS_METRIC: &str = "rate_limit_store_errors_total";

/// Receiver of admission counters.
pub trait AdmissionEvents: Send + Sync {
    /// A request on `route` was rejected with 429.
    fn rejected(&self, route: &str);

    /// A limiter call on `route` failed and the request was let through.
    fn store_failed(&self, route: &str, error: &StoreError);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl AdmissionEvents for NoopEvents {
    fn rejected(&self, _route: &str) {}

    fn store_failed(&self, _route: &str, _error: &StoreError) {}
}

/// Sink forwarding every event to the `metrics` facade.
///
/// Counts land in whichever recorder the process installed; without one they are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEvents;

impl MetricsEvents {
    /// Register help text for the admission counters with the installed recorder.
    pub fn describe() {
        describe_counter!(REJECTIONS_METRIC, "Total requests rejected by rate limiter");
        describe_counter!(
            STORE_ERRORS_METRIC,
            "Limiter store failures absorbed as fail-open"
        );
    }
}

impl AdmissionEvents for MetricsEvents {
    fn rejected(&self, route: &str) {
        counter!(REJECTIONS_METRIC, "route" => route.to_string()).increment(1);
    }

    fn store_failed(&self, _route: &str, error: &StoreError) {
        counter!(STORE_ERRORS_METRIC, "kind" => error.kind()).increment(1);
    }
}
