//! # Session Components
//!
//! Client-side token lifecycle for the practicum portal.
//!
//! ## Overview
//!
//! This crate holds the pieces a session is built from. Each is usable and
//! testable on its own; `core-service` wires them into a `SessionManager`.
//!
//! - [`TokenStore`]: current access/refresh pair, mirrored to a `SecureStore`
//! - [`ActivityMonitor`]: idle detection driven by the wall clock
//! - [`Pipeline`]: ordered request/response middlewares in front of the
//!   host `HttpClient`
//! - [`RequestInterceptor`] / [`ResponseInterceptor`]: bearer attachment and
//!   401 recovery
//! - [`RefreshCoordinator`]: single-flight refresh with a FIFO pending queue
//! - [`AuthEventBus`]: typed events, `TokenExpired` at most once per session
//! - [`AuthApi`]: login, registration, refresh and logout endpoints
//!
//! ## Features
//!
//! - At most one refresh call in flight
//! - Each request retried at most once after a refresh
//! - Tokens never leave the API origin and never appear in logs

pub mod activity;
pub mod api;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod pipeline;
pub mod refresh;
pub mod token_store;
pub mod types;

pub use activity::{ActivityMonitor, ActivitySignal};
pub use api::{AuthApi, AuthGrant, Credentials, RefreshGrant, RegistrationForm};
pub use error::{AuthError, Result};
pub use events::AuthEventBus;
pub use interceptor::{RequestInterceptor, ResponseInterceptor};
pub use pipeline::{
    classify, Exchange, Pipeline, PipelineBuilder, Replay, ReplayTurn, RequestMiddleware,
    ResponseMiddleware,
};
pub use refresh::{QueuedRefresh, RefreshCoordinator};
pub use token_store::TokenStore;
pub use types::{AuthState, SessionPhase, Token, TokenPair, UserSummary};
