//! auth-proxy - an authenticating reverse proxy for a single backend
//!
//! This library provides an admission gate that:
//! - Answers a fixed health path without authentication or backend contact
//! - Checks HTTP Basic credentials on every other request in constant time
//! - Forwards admitted requests to one configured backend and streams the response back
//! - Refuses everything else with 401 without ever opening a backend connection
//! - Maps backend connect failures to 502 and backend timeouts to 504, without retrying

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod pool;
pub mod proxy;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
