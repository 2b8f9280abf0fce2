//! # Host Bridge Traits
//!
//! Platform abstraction traits that each host (desktop shell, browser build,
//! test harness) implements for the portal session core.
//!
//! ## Overview
//!
//! The session core needs a handful of capabilities it cannot provide itself:
//! a transport to reach the backend, somewhere durable to keep the token pair,
//! a wall-clock, and a way to learn when the host surface is hidden or shown.
//! Each capability is a trait here; concrete adapters live in
//! `bridge-desktop` or in the host application.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP transport
//! - [`SecureStore`](storage::SecureStore) - Durable token persistence
//! - [`Clock`](time::Clock) - Wall-clock source for expiry and idle checks
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to the host
//! - [`VisibilityObserver`](lifecycle::VisibilityObserver) - Foreground/background transitions
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Transport
//! implementations must report "no response received" as
//! [`BridgeError::Network`] or [`BridgeError::Timeout`]; the session core maps
//! those to its network error class and never logs the user out for them.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across async tasks behind `Arc`.

pub mod error;
pub mod http;
pub mod lifecycle;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use lifecycle::{VisibilityChangeStream, VisibilityObserver, VisibilityState};
pub use storage::SecureStore;
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
