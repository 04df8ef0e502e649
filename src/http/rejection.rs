//! Structured rejection responses.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";

/// JSON error envelope returned by the admission layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: String,
    /// HTTP reason phrase
    pub error: String,
    /// Human-readable explanation
    pub message: String,
    /// Seconds to wait before retrying
    pub retry_after_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// A request rejected because its bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimited {
    /// Whole seconds until a token is available, at least 1
    pub retry_after_secs: u64,
    /// Bucket capacity
    pub limit: u32,
    /// Whole tokens left
    pub remaining: u64,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: "RATE_LIMITED".to_string(),
            error: "Too Many Requests".to_string(),
            message: format!(
                "Rate limit exceeded. Please retry after {} seconds.",
                self.retry_after_secs
            ),
            retry_after_secs: self.retry_after_secs,
            timestamp: Utc::now(),
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(self.retry_after_secs),
        );
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = RateLimited {
            retry_after_secs: 3,
            limit: 10,
            remaining: 0,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "3");
        assert_eq!(response.headers()[HEADER_LIMIT], "10");
        assert_eq!(response.headers()[HEADER_REMAINING], "0");

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.retry_after_secs, 3);
        assert!(!body.message.is_empty());
    }
}
