//! Credential and access-control core.
//!
//! Password hashing, signed bearer tokens and request rate limiting, plus
//! the thin service and HTTP handlers that combine them for login and
//! registration.

pub mod handlers;
mod password;
mod rate_limit;
mod service;
mod token;

pub use password::{BcryptHasher, PasswordHasher, MAX_SECRET_BYTES};
pub use rate_limit::{RateLimitConfig, RateLimitPolicy, RateLimiter};
pub use service::AuthService;
pub use token::{Claims, SigningKeyRing, TokenService, MAX_TOKEN_DURATION_MINUTES, MIN_KEY_LENGTH};
