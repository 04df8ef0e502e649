//! HTTP surface: admission middleware, rejection responses, demo routes and server.

mod admission;
mod rejection;
mod routes;
mod server;

pub use admission::{admission_middleware, Admission, AuthenticatedIdentity, REQUEST_ID_HEADER};
pub use rejection::{ErrorBody, RateLimited, HEADER_LIMIT, HEADER_REMAINING};
pub use routes::{router, AppState, CreateUserRequest, LoginRequest, LOGIN_ROUTE, USERS_ROUTE};
pub use server::HttpServer;
