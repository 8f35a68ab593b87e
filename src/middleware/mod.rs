//! Middleware for observability.
//!
//! Rate limiting lives in `rate_limit::RateLimiter` and is invoked directly
//! from the orchestrator rather than as an Axum layer, since it keys on
//! both the authenticated user and the client IP together, and the user id
//! is only known after the request body has been parsed.

pub mod logging;

pub use logging::request_logging;
