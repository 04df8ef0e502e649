//! Turnstile - Token-Bucket Admission Control
//!
//! This crate implements per-client rate limiting for HTTP services. Token buckets live
//! either in a shared Redis store, updated atomically by a Lua script, or in an
//! in-process registry. An axum middleware derives a key per request, rejects
//! over-limit requests with 429 and lets requests through when the store is unavailable.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
