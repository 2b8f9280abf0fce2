//! # Core Runtime Module
//!
//! Ambient runtime infrastructure for the portal session core:
//! - Logging and tracing infrastructure
//! - Session configuration (timeouts, endpoints, injected bridges)
//! - Typed event bus
//!
//! ## Overview
//!
//! The other workspace crates depend on this one for their configuration
//! type, their event vocabulary and their logging conventions. It holds no
//! session state itself.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{Endpoints, SessionConfig, SessionConfigBuilder};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventStream};
