//! Demo application routes wired behind admission control.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::admission::{admission_middleware, Admission};

pub const LOGIN_ROUTE: &str = "/v1/auth/login";
pub const USERS_ROUTE: &str = "/v1/users";

/// State shared by the route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handle onto the process-wide Prometheus recorder
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Build the application router.
///
/// `default` limits every route per client and route. `login` additionally limits the
/// credential endpoint per client and submitted identity.
pub fn router(state: AppState, default: Admission, login: Admission) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            LOGIN_ROUTE,
            post(login_handler).route_layer(from_fn_with_state(login, admission_middleware)),
        )
        .route(USERS_ROUTE, get(list_users).post(create_user))
        .route_layer(from_fn_with_state(default, admission_middleware))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn login_handler(Json(request): Json<LoginRequest>) -> impl IntoResponse {
    info!(email = %request.email, "Login attempt");
    Json(json!({ "authenticated": false, "email": request.email }))
}

async fn list_users() -> impl IntoResponse {
    Json(json!({ "users": [] }))
}

async fn create_user(Json(request): Json<CreateUserRequest>) -> impl IntoResponse {
    info!(email = %request.email, "Creating user");
    (StatusCode::CREATED, Json(request))
}
