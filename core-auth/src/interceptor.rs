//! Credential middlewares for the request pipeline.
//!
//! [`RequestInterceptor`] attaches the access token to portal API requests.
//! [`ResponseInterceptor`] turns a 401 into a single refresh-and-retry.
//! Both only act on requests addressed to the configured API origin, so a
//! token is never sent to a third-party host.

use async_trait::async_trait;
use bridge_traits::http::HttpRequest;
use bridge_traits::time::Clock;
use core_runtime::config::{Endpoints, SessionConfig};
use core_runtime::events::ExpiryReason;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::error::{AuthError, Result};
use crate::events::AuthEventBus;
use crate::pipeline::{Exchange, Replay, ReplayTurn, RequestMiddleware, ResponseMiddleware};
use crate::refresh::RefreshCoordinator;
use crate::token_store::TokenStore;

/// A set of endpoint paths under the API origin.
#[derive(Debug, Clone)]
struct EndpointSet {
    origin: Option<Origin>,
    paths: Vec<String>,
}

impl EndpointSet {
    fn new(base_url: &str, endpoint_paths: &[&str]) -> Self {
        let base = Url::parse(base_url).ok();
        let base_path = base
            .as_ref()
            .map(|url| url.path().trim_end_matches('/').to_string())
            .unwrap_or_default();

        Self {
            origin: base.map(|url| url.origin()),
            paths: endpoint_paths
                .iter()
                .map(|path| normalize(&format!("{}{}", base_path, path)))
                .collect(),
        }
    }

    /// Parses `raw` and returns it when it targets the API origin.
    fn same_origin(&self, raw: &str) -> Option<Url> {
        let url = Url::parse(raw).ok()?;
        match &self.origin {
            Some(origin) if *origin == url.origin() => Some(url),
            _ => None,
        }
    }

    fn contains(&self, url: &Url) -> bool {
        let path = normalize(url.path());
        self.paths.iter().any(|p| *p == path)
    }
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

/// Attaches `Authorization: Bearer <access>` to protected API requests.
///
/// Login, registration and refresh are sent untouched. For every other API
/// request a caller-provided Authorization header is replaced, or removed
/// when no unexpired access token is available.
pub struct RequestInterceptor {
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    public: EndpointSet,
}

impl RequestInterceptor {
    pub fn new(
        store: Arc<TokenStore>,
        clock: Arc<dyn Clock>,
        leeway: Duration,
        base_url: &str,
        endpoints: &Endpoints,
    ) -> Self {
        Self {
            store,
            clock,
            leeway,
            public: EndpointSet::new(
                base_url,
                &[&endpoints.login, &endpoints.register, &endpoints.refresh],
            ),
        }
    }

    pub fn from_config(config: &SessionConfig, store: Arc<TokenStore>) -> Self {
        Self::new(
            store,
            Arc::clone(&config.clock),
            config.expiry_leeway,
            &config.base_url,
            &config.endpoints,
        )
    }
}

#[async_trait]
impl RequestMiddleware for RequestInterceptor {
    async fn on_request(&self, mut request: HttpRequest) -> Result<HttpRequest> {
        let Some(url) = self.public.same_origin(&request.url) else {
            return Ok(request);
        };
        if self.public.contains(&url) {
            return Ok(request);
        }

        let now = self.clock.now();
        match self
            .store
            .access_token()
            .filter(|token| !token.is_expired_at(now, self.leeway))
        {
            Some(token) => request.set_bearer(token.as_str()),
            None => {
                if request.bearer().is_some() {
                    debug!(request_id = %request.id, "Removing stale Authorization header");
                }
                request.remove_authorization();
            }
        }
        Ok(request)
    }

    fn name(&self) -> &'static str {
        "request-interceptor"
    }
}

/// Recovers from an expired access token by refreshing once and retrying.
///
/// Outcomes for a first-time 401 from a protected endpoint:
///
/// - the stored token changed since the request was sent: retry at once
/// - no refresh token: `TokenExpired`, caller gets `SessionExpired`
/// - otherwise: queue behind the refresh, then retry once
///
/// A retried request that answers 401 again ends the session.
pub struct ResponseInterceptor {
    coordinator: RefreshCoordinator,
    store: Arc<TokenStore>,
    events: AuthEventBus,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    excluded: EndpointSet,
}

impl ResponseInterceptor {
    pub fn new(
        coordinator: RefreshCoordinator,
        store: Arc<TokenStore>,
        events: AuthEventBus,
        clock: Arc<dyn Clock>,
        leeway: Duration,
        base_url: &str,
        endpoints: &Endpoints,
    ) -> Self {
        Self {
            coordinator,
            store,
            events,
            clock,
            leeway,
            excluded: EndpointSet::new(
                base_url,
                &[
                    &endpoints.login,
                    &endpoints.register,
                    &endpoints.refresh,
                    &endpoints.logout,
                ],
            ),
        }
    }

    pub fn from_config(
        config: &SessionConfig,
        coordinator: RefreshCoordinator,
        store: Arc<TokenStore>,
        events: AuthEventBus,
    ) -> Self {
        Self::new(
            coordinator,
            store,
            events,
            Arc::clone(&config.clock),
            config.expiry_leeway,
            &config.base_url,
            &config.endpoints,
        )
    }

    fn should_handle(&self, exchange: &Exchange) -> bool {
        if exchange.response.status != 401 || exchange.retried {
            return false;
        }
        match self.excluded.same_origin(&exchange.request.url) {
            Some(url) => !self.excluded.contains(&url),
            None => false,
        }
    }

    async fn retry(
        &self,
        request: HttpRequest,
        replay: &Replay,
        turn: ReplayTurn,
    ) -> Result<Exchange> {
        let exchange = replay.send_in_turn(request, turn).await?;
        if exchange.response.status == 401 {
            warn!(request_id = %exchange.request.id, "Retried request rejected again");
            self.events
                .emit_token_expired(ExpiryReason::RetryUnauthorized);
            return Err(AuthError::SessionExpired);
        }
        Ok(exchange)
    }
}

#[async_trait]
impl ResponseMiddleware for ResponseInterceptor {
    async fn on_response(&self, exchange: Exchange, replay: &Replay) -> Result<Exchange> {
        if !self.should_handle(&exchange) {
            return Ok(exchange);
        }
        let request = exchange.request;

        let now = self.clock.now();
        if let Some(current) = self
            .store
            .access_token()
            .filter(|token| !token.is_expired_at(now, self.leeway))
        {
            if request.bearer() != Some(current.as_str()) {
                debug!(request_id = %request.id, "Access token changed in flight, retrying");
                return self.retry(request, replay, ReplayTurn::unordered()).await;
            }
        }

        if self.store.refresh_token().is_none() {
            self.events
                .emit_token_expired(ExpiryReason::RefreshTokenMissing);
            return Err(AuthError::SessionExpired);
        }

        debug!(request_id = %request.id, "Access token rejected, waiting for refresh");
        match self.coordinator.wait_for_refresh().await {
            Ok(refreshed) => self.retry(request, replay, refreshed.turn).await,
            Err(AuthError::Cancelled(reason)) => Err(AuthError::Cancelled(reason)),
            Err(e) => {
                debug!(request_id = %request.id, error = %e, "Refresh failed for queued request");
                Err(AuthError::SessionExpired)
            }
        }
    }

    fn name(&self) -> &'static str {
        "response-interceptor"
    }
}
