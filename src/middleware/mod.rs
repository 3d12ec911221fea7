//! Request-level middleware: logging and enrollment rate limiting.

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{EnrollRateLimiter, RateLimitConfig};
