//! # Session Configuration Module
//!
//! Provides configuration management for the portal session core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `SessionConfig` instance that holds the host bridges and the session
//! timing knobs. It enforces fail-fast validation so a misconfigured idle
//! policy or a missing transport is reported before any request is sent.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - Transport to the portal backend
//! - `SecureStore` - Durable storage for the token pair
//!
//! ## Optional Dependencies
//!
//! - `Clock` - Wall-clock source (default: `SystemClock`)
//!
//! When the `desktop-shims` feature is enabled, `ReqwestHttpClient` and
//! `KeyringSecureStore` are injected automatically if not provided.
//!
//! ## Environment Overrides
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `PORTAL_API_BASE_URL` | `base_url` |
//! | `PORTAL_IDLE_TIMEOUT_MS` | `idle_timeout` |
//! | `PORTAL_IDLE_WARNING_LEAD_MS` | `warning_lead` |
//! | `PORTAL_TOKEN_LEEWAY_MS` | `expiry_leeway` |
//! | `PORTAL_REFRESH_TIMEOUT_MS` | `refresh_timeout` |
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::builder()
//!     .base_url("https://portal.example.edu/api")
//!     .idle_timeout(Duration::from_secs(15 * 60))
//!     .from_env()?
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, SecureStore, SystemClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_WARNING_LEAD: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_EXPIRY_LEEWAY: Duration = Duration::from_secs(5);
/// Upper bound (exclusive) for `expiry_leeway`.
pub const MAX_EXPIRY_LEEWAY: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_BUFFER: usize = 100;

pub const DEFAULT_ACCESS_TOKEN_KEY: &str = "access_token";
pub const DEFAULT_REFRESH_TOKEN_KEY: &str = "refresh_token";

pub const ENV_BASE_URL: &str = "PORTAL_API_BASE_URL";
pub const ENV_IDLE_TIMEOUT_MS: &str = "PORTAL_IDLE_TIMEOUT_MS";
pub const ENV_WARNING_LEAD_MS: &str = "PORTAL_IDLE_WARNING_LEAD_MS";
pub const ENV_TOKEN_LEEWAY_MS: &str = "PORTAL_TOKEN_LEEWAY_MS";
pub const ENV_REFRESH_TIMEOUT_MS: &str = "PORTAL_REFRESH_TIMEOUT_MS";

/// Paths of the authentication endpoints, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub logout: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login/".to_string(),
            register: "/auth/register/".to_string(),
            refresh: "/auth/token/refresh/".to_string(),
            logout: "/auth/logout/".to_string(),
        }
    }
}

impl Endpoints {
    fn all(&self) -> [(&'static str, &str); 4] {
        [
            ("login", &self.login),
            ("register", &self.register),
            ("refresh", &self.refresh),
            ("logout", &self.logout),
        ]
    }

    fn validate(&self) -> Result<()> {
        let all = self.all();
        for (name, path) in all {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "Endpoint '{}' must be an absolute path starting with '/', got '{}'",
                    name, path
                )));
            }
        }

        for (i, (name, path)) in all.iter().enumerate() {
            if let Some((other, _)) = all[i + 1..].iter().find(|(_, p)| p == path) {
                return Err(Error::Config(format!(
                    "Endpoints '{}' and '{}' share the path '{}'",
                    name, other, path
                )));
            }
        }

        Ok(())
    }
}

/// Configuration for the portal session core.
///
/// Use [`SessionConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct SessionConfig {
    /// Root of the portal REST API, e.g. `https://portal.example.edu/api`
    pub base_url: String,

    /// Authentication endpoint paths
    pub endpoints: Endpoints,

    /// Inactivity after which the session is force-ended
    pub idle_timeout: Duration,

    /// How long before `idle_timeout` the warning is raised
    pub warning_lead: Duration,

    /// Access tokens expiring within this window count as expired
    pub expiry_leeway: Duration,

    /// Upper bound for one refresh round-trip
    pub refresh_timeout: Duration,

    /// Capacity of the broadcast event buffer
    pub event_buffer: usize,

    /// Durable storage key of the access token
    pub access_token_key: String,

    /// Durable storage key of the refresh token
    pub refresh_token_key: String,

    pub http_client: Arc<dyn HttpClient>,
    pub secure_store: Arc<dyn SecureStore>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("base_url", &self.base_url)
            .field("endpoints", &self.endpoints)
            .field("idle_timeout", &self.idle_timeout)
            .field("warning_lead", &self.warning_lead)
            .field("expiry_leeway", &self.expiry_leeway)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("event_buffer", &self.event_buffer)
            .field("access_token_key", &self.access_token_key)
            .field("refresh_token_key", &self.refresh_token_key)
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Absolute URL for an endpoint path.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Base URL is an absolute http(s) URL
    /// - `warning_lead < idle_timeout`
    /// - `expiry_leeway` is below [`MAX_EXPIRY_LEEWAY`]
    /// - Timeouts and buffer sizes are non-zero
    /// - Endpoint paths are absolute and distinct
    /// - Storage keys are non-empty and distinct
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Base URL must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.idle_timeout.is_zero() {
            return Err(Error::Config(
                "Idle timeout must be greater than zero".to_string(),
            ));
        }

        if self.warning_lead >= self.idle_timeout {
            return Err(Error::Config(format!(
                "Idle warning lead ({:?}) must be shorter than the idle timeout ({:?})",
                self.warning_lead, self.idle_timeout
            )));
        }

        if self.expiry_leeway >= MAX_EXPIRY_LEEWAY {
            return Err(Error::Config(format!(
                "Token expiry leeway ({:?}) must be shorter than {:?}",
                self.expiry_leeway, MAX_EXPIRY_LEEWAY
            )));
        }

        if self.refresh_timeout.is_zero() {
            return Err(Error::Config(
                "Refresh timeout must be greater than zero".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(Error::Config(
                "Event buffer must hold at least one event".to_string(),
            ));
        }

        self.endpoints.validate()?;

        if self.access_token_key.is_empty() || self.refresh_token_key.is_empty() {
            return Err(Error::Config("Token storage keys cannot be empty".to_string()));
        }
        if self.access_token_key == self.refresh_token_key {
            return Err(Error::Config(
                "Access and refresh tokens must be stored under different keys".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the portal API. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Other hosts: inject a transport with .http_client()."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required to persist the token pair. \
                 Desktop: enable the 'desktop-shims' feature to use the default KeyringSecureStore. \
                 Shared kiosks: inject bridge_desktop::MemorySecureStore."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new().map_err(|e| Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: format!("Default ReqwestHttpClient could not be created: {}", e),
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::new());
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

/// Builder for constructing [`SessionConfig`] instances.
#[derive(Default)]
pub struct SessionConfigBuilder {
    base_url: Option<String>,
    endpoints: Option<Endpoints>,
    idle_timeout: Option<Duration>,
    warning_lead: Option<Duration>,
    expiry_leeway: Option<Duration>,
    refresh_timeout: Option<Duration>,
    event_buffer: Option<usize>,
    access_token_key: Option<String>,
    refresh_token_key: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionConfigBuilder {
    /// Sets the root URL of the portal API (required).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Overrides the authentication endpoint paths.
    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Default: 30 minutes
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Default: 2 minutes
    pub fn warning_lead(mut self, lead: Duration) -> Self {
        self.warning_lead = Some(lead);
        self
    }

    /// Default: 5 seconds
    pub fn expiry_leeway(mut self, leeway: Duration) -> Self {
        self.expiry_leeway = Some(leeway);
        self
    }

    /// Default: 30 seconds
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    /// Default: 100 events
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    /// Overrides the durable storage keys of the token pair.
    pub fn token_keys(mut self, access: impl Into<String>, refresh: impl Into<String>) -> Self {
        self.access_token_key = Some(access.into());
        self.refresh_token_key = Some(refresh.into());
        self
    }

    /// Sets the HTTP transport.
    ///
    /// If not provided, the desktop default (reqwest-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the durable token storage.
    ///
    /// If not provided, the OS keychain store is used when the
    /// `desktop-shims` feature is enabled.
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Applies the `PORTAL_*` environment overrides on top of the values set
    /// so far.
    pub fn from_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// Unset or blank variables leave the builder untouched; malformed
    /// numbers are rejected.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let read_millis = |name: &str| -> Result<Option<Duration>> {
            read(name)
                .map(|raw| {
                    raw.parse::<u64>().map(Duration::from_millis).map_err(|e| {
                        Error::Config(format!("{} must be a number of milliseconds: {}", name, e))
                    })
                })
                .transpose()
        };

        if let Some(url) = read(ENV_BASE_URL) {
            self.base_url = Some(url);
        }
        if let Some(timeout) = read_millis(ENV_IDLE_TIMEOUT_MS)? {
            self.idle_timeout = Some(timeout);
        }
        if let Some(lead) = read_millis(ENV_WARNING_LEAD_MS)? {
            self.warning_lead = Some(lead);
        }
        if let Some(leeway) = read_millis(ENV_TOKEN_LEEWAY_MS)? {
            self.expiry_leeway = Some(leeway);
        }
        if let Some(timeout) = read_millis(ENV_REFRESH_TIMEOUT_MS)? {
            self.refresh_timeout = Some(timeout);
        }

        Ok(self)
    }

    /// Builds the final `SessionConfig` instance.
    ///
    /// Returns an error if the base URL is missing, a required bridge is
    /// missing and no desktop default is available, or validation fails.
    pub fn build(self) -> Result<SessionConfig> {
        let base_url = self.base_url.ok_or_else(|| {
            Error::Config(format!(
                "Base URL is required. Use .base_url() or set {}.",
                ENV_BASE_URL
            ))
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let config = SessionConfig {
            base_url,
            endpoints: self.endpoints.unwrap_or_default(),
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            warning_lead: self.warning_lead.unwrap_or(DEFAULT_WARNING_LEAD),
            expiry_leeway: self.expiry_leeway.unwrap_or(DEFAULT_EXPIRY_LEEWAY),
            refresh_timeout: self.refresh_timeout.unwrap_or(DEFAULT_REFRESH_TIMEOUT),
            event_buffer: self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER),
            access_token_key: self
                .access_token_key
                .unwrap_or_else(|| DEFAULT_ACCESS_TOKEN_KEY.to_string()),
            refresh_token_key: self
                .refresh_token_key
                .unwrap_or_else(|| DEFAULT_REFRESH_TOKEN_KEY.to_string()),
            http_client,
            secure_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}
