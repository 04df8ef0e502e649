//! Admission middleware.
//!
//! Every limited request goes through the same steps: skip bypassed routes, derive the
//! limiter key, consult the backend, then either forward the request or answer 429.
//! Limiter failures never reach the client; the request is forwarded instead. Bodies too
//! large or too broken to buffer are forwarded as they are and keyed without an identity.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::rejection::{RateLimited, HEADER_LIMIT, HEADER_REMAINING};
use crate::ratelimit::{
    retry_after_secs, AdmissionBackend, AdmissionEvents, Decision, KeyStrategy, NoopEvents,
    Policy, RequestDescriptor,
};

/// Correlation header read for log events.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

/// Identity established by the authentication layer, if any.
///
/// Only used to correlate log events; it never influences limiter keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity(pub String);

/// One admission policy bound to a limiter backend, cloned into every request.
#[derive(Clone)]
pub struct Admission {
    backend: Arc<dyn AdmissionBackend>,
    strategy: KeyStrategy,
    policy: Policy,
    bypass: Arc<[String]>,
    events: Arc<dyn AdmissionEvents>,
    body_limit: usize,
}

impl Admission {
    /// Create an admission policy with no bypassed routes and no event sink.
    pub fn new(backend: Arc<dyn AdmissionBackend>, strategy: KeyStrategy, policy: Policy) -> Self {
        Self {
            backend,
            strategy,
            policy,
            bypass: Arc::from(Vec::new()),
            events: Arc::new(NoopEvents),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Routes, matched exactly, that skip admission control.
    pub fn with_bypass<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass = routes.into_iter().map(Into::into).collect();
        self
    }

    /// Sink receiving rejection and failure counters.
    pub fn with_events(mut self, events: Arc<dyn AdmissionEvents>) -> Self {
        self.events = events;
        self
    }

    /// Largest body buffered by body-reading key strategies.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn strategy(&self) -> &KeyStrategy {
        &self.strategy
    }

    /// Whether `route` skips admission control.
    pub fn is_bypassed(&self, route: &str) -> bool {
        self.bypass.iter().any(|bypassed| bypassed == route)
    }

    /// Run admission for one request.
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let route = route_of(&request);
        if self.is_bypassed(&route) {
            return next.run(request).await;
        }

        let forwarded_for = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let (request, body) = if self.strategy.reads_body() {
            self.buffer_body(request).await
        } else {
            (request, None)
        };

        let key = self.strategy.derive(&RequestDescriptor {
            forwarded_for: forwarded_for.as_deref(),
            peer,
            route: &route,
            body: body.as_deref(),
        });

        match self.backend.check(&key, &self.policy).await {
            Ok(decision) if decision.allowed => {
                debug!(key = %key, remaining = decision.remaining, "Request admitted");
                let mut response = next.run(request).await;
                self.annotate(&mut response, &decision);
                response
            }
            Ok(decision) => self.reject(&request, &route, &key, &decision),
            Err(err) => {
                self.events.store_failed(&route, &err);
                if err.is_defect() {
                    error!(
                        key = %key,
                        route = %route,
                        backend = self.backend.name(),
                        defect = true,
                        error = %err,
                        "Limiter returned an unexpected reply, admitting request"
                    );
                } else {
                    warn!(
                        key = %key,
                        route = %route,
                        backend = self.backend.name(),
                        error = %err,
                        "Limiter unavailable, admitting request"
                    );
                }
                next.run(request).await
            }
        }
    }

    /// Buffer the body so the key can read it, handing back a request with the same bytes.
    ///
    /// Returns no bytes when the body exceeds the limit or fails mid-stream; the request
    /// then carries the consumed prefix followed by the untouched remainder.
    async fn buffer_body(&self, request: Request) -> (Request, Option<Bytes>) {
        let declared = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if let Some(length) = declared.filter(|length| *length > self.body_limit) {
            debug!(
                declared = length,
                limit = self.body_limit,
                "Declared body exceeds the buffering limit, keying without identity"
            );
            return (request, None);
        }

        let (parts, body) = request.into_parts();
        let mut stream = body.into_data_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut size = 0;

        while let Some(next) = stream.next().await {
            match next {
                Ok(chunk) => {
                    size += chunk.len();
                    chunks.push(chunk);
                    if size > self.body_limit {
                        debug!(
                            limit = self.body_limit,
                            "Body stream exceeds the buffering limit, keying without identity"
                        );
                        let replay = futures::stream::iter(chunks.into_iter().map(Ok));
                        let body = Body::from_stream(replay.chain(stream));
                        return (Request::from_parts(parts, body), None);
                    }
                }
                Err(err) => {
                    debug!(error = %err, "Body stream failed while buffering, keying without identity");
                    let replay = chunks
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(err)));
                    let body = Body::from_stream(futures::stream::iter(replay));
                    return (Request::from_parts(parts, body), None);
                }
            }
        }

        let bytes = Bytes::from(chunks.concat());
        let request = Request::from_parts(parts, Body::from(bytes.clone()));
        (request, Some(bytes))
    }

    fn reject(&self, request: &Request, route: &str, key: &str, decision: &Decision) -> Response {
        let retry_after = retry_after_secs(decision.retry_after.unwrap_or_default());
        self.events.rejected(route);

        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let identity = request
            .extensions()
            .get::<AuthenticatedIdentity>()
            .map(|identity| identity.0.as_str())
            .unwrap_or("anonymous");

        warn!(
            key = %key,
            route = %route,
            request_id = %request_id,
            identity = %identity,
            retry_after = retry_after,
            "Rate limit exceeded"
        );

        RateLimited {
            retry_after_secs: retry_after,
            limit: self.policy.burst(),
            remaining: whole_tokens(decision.remaining),
        }
        .into_response()
    }

    /// Add the limit headers unless an inner admission layer already set them.
    fn annotate(&self, response: &mut Response, decision: &Decision) {
        let headers = response.headers_mut();
        if headers.contains_key(HEADER_LIMIT) {
            return;
        }
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.policy.burst()));
        headers.insert(
            HEADER_REMAINING,
            HeaderValue::from(whole_tokens(decision.remaining)),
        );
    }
}

/// Admission middleware for `axum::middleware::from_fn_with_state`.
pub async fn admission_middleware(
    State(admission): State<Admission>,
    request: Request,
    next: Next,
) -> Response {
    admission.handle(request, next).await
}

/// The matched route template, or the raw path when routing has not matched one.
fn route_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned())
}

fn whole_tokens(tokens: f64) -> u64 {
    tokens.max(0.0).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LocalLimiter, LocalRegistry, MetricsEvents};
    use std::time::Duration;

    fn admission(strategy: KeyStrategy) -> Admission {
        let backend = Arc::new(LocalLimiter::new(LocalRegistry::without_sweeper(
            Duration::from_secs(60),
        )));
        Admission::new(
            backend,
            strategy,
            Policy::new(1.0, 2, Duration::from_secs(60)).unwrap(),
        )
    }

    #[test]
    fn test_bypass_is_exact() {
        let admission = admission(KeyStrategy::ClientRoute).with_bypass(["/health", "/metrics"]);
        assert!(admission.is_bypassed("/health"));
        assert!(admission.is_bypassed("/metrics"));
        assert!(!admission.is_bypassed("/healthz"));
        assert!(!admission.is_bypassed("/v1/health"));
    }

    #[test]
    fn test_builder_sets_fields() {
        let events = Arc::new(MetricsEvents);
        let admission = admission(KeyStrategy::login())
            .with_events(events)
            .with_body_limit(16);
        assert_eq!(admission.strategy(), &KeyStrategy::login());
        assert_eq!(admission.policy().burst(), 2);
        assert_eq!(admission.body_limit, 16);
    }

    #[test]
    fn test_whole_tokens() {
        assert_eq!(whole_tokens(2.9), 2);
        assert_eq!(whole_tokens(0.2), 0);
        assert_eq!(whole_tokens(-0.1), 0);
    }

    #[test]
    fn test_route_of_falls_back_to_path() {
        let request = Request::builder()
            .uri("/v1/users?page=2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(route_of(&request), "/v1/users");
    }

    #[test]
    fn test_annotate_keeps_inner_headers() {
        let admission = admission(KeyStrategy::ClientRoute);
        let mut response = RateLimited {
            retry_after_secs: 5,
            limit: 5,
            remaining: 0,
        }
        .into_response();

        admission.annotate(&mut response, &Decision::allow(7.0));
        assert_eq!(response.headers()[HEADER_LIMIT], "5");
        assert_eq!(response.headers()[HEADER_REMAINING], "0");

        let mut response = Response::new(Body::empty());
        admission.annotate(&mut response, &Decision::allow(1.5));
        assert_eq!(response.headers()[HEADER_LIMIT], "2");
        assert_eq!(response.headers()[HEADER_REMAINING], "1");
    }

    #[tokio::test]
    async fn test_buffer_body_restores_bytes() {
        let admission = admission(KeyStrategy::login());
        let payload = r#"{"email":"a@b.c","password":"pw"}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .body(Body::from(payload))
            .unwrap();

        let (request, body) = admission.buffer_body(request).await;
        assert_eq!(body.as_deref(), Some(payload.as_bytes()));

        let restored = axum::body::to_bytes(request.into_body(), 1024).await.unwrap();
        assert_eq!(restored, payload.as_bytes());
    }

    #[tokio::test]
    async fn test_buffer_body_forwards_oversized_declared_length() {
        let admission = admission(KeyStrategy::login()).with_body_limit(8);
        let payload = "x".repeat(32);
        let request = Request::builder()
            .method("POST")
            .header(header::CONTENT_LENGTH, payload.len())
            .body(Body::from(payload.clone()))
            .unwrap();

        let (request, body) = admission.buffer_body(request).await;
        assert!(body.is_none());
        let untouched = axum::body::to_bytes(request.into_body(), 1024).await.unwrap();
        assert_eq!(untouched, payload.as_bytes());
    }

    #[tokio::test]
    async fn test_buffer_body_replays_oversized_stream() {
        let admission = admission(KeyStrategy::login()).with_body_limit(8);
        let chunks = vec!["abcd", "efgh", "ijkl", "mnop"]
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes())));
        let request = Request::builder()
            .method("POST")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let (request, body) = admission.buffer_body(request).await;
        assert!(body.is_none());
        let replayed = axum::body::to_bytes(request.into_body(), 1024).await.unwrap();
        assert_eq!(replayed, "abcdefghijklmnop".as_bytes());
    }
}
