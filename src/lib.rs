//! Turnstile - Per-Client Admission Control
//!
//! This crate implements token bucket rate limiting keyed by client identity.
//! Each client (usually a source IP, or a trusted header value) gets its own
//! bucket, held in a bounded cache that forgets idle clients. A tower layer
//! applies the limits in front of any axum or tower HTTP service.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
