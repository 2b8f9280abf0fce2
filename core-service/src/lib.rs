//! Core service façade.
//!
//! Wires the session components from `core-auth` into a single
//! [`SessionManager`] driven by a [`SessionConfig`]. Desktop hosts enable the
//! `desktop-shims` feature to get the reqwest transport and the OS keychain
//! as default bridges; other hosts inject their own.
//!
//! ```no_run
//! use core_service::{Credentials, SessionConfig, SessionManager};
//!
//! # async fn example() -> core_service::Result<()> {
//! let config = SessionConfig::builder()
//!     .base_url("https://portal.example.edu/api")
//!     .from_env()?
//!     .build()?;
//! let session = SessionManager::new(config)?;
//!
//! session.restore().await?;
//! if !session.state().is_authenticated {
//!     session
//!         .login(&Credentials::new("student@uni.example.edu", "secret"))
//!         .await?;
//! }
//!
//! let placements = session.client().get("/internships/").await?;
//! # let _ = placements;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod session;

pub use client::ApiClient;
pub use error::{CoreError, Result};
pub use session::SessionManager;

pub use core_auth::{
    AuthError, AuthState, Credentials, RegistrationForm, SessionPhase, Token, TokenPair,
    UserSummary,
};
pub use core_runtime::config::{Endpoints, SessionConfig, SessionConfigBuilder};
pub use core_runtime::events::{AuthEvent, CoreEvent, LogoutReason, SessionEvent, SignInFlow};
