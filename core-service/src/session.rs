//! # Session Manager
//!
//! Owns the observable [`AuthState`] and drives it from user actions and
//! from the events raised by the session components.
//!
//! ## State machine
//!
//! ```text
//! Unauthenticated ─login─> Authenticating ─ok─> Authenticated <──> Refreshing
//!        ^                      │ failed             │   ^              │
//!        └──────────────────────┘                    v   │ activity     │
//!                                                IdleWarning            │
//!                                                    │ timeout          │ refresh failed
//!                                                    v                  v
//!                                                 LoggedOut <───────────┘
//! ```
//!
//! State is published through a `watch` channel and only changes through
//! [`SessionManager`] transitions; an illegal transition is rejected with
//! [`AuthError::InvalidTransition`].
//!
//! ## Teardown
//!
//! Every way a session can end (user logout, idle timeout, terminal refresh
//! failure) goes through one teardown path that runs at most once per
//! session:
//!
//! 1. reject queued requests
//! 2. clear the token store
//! 3. stop the activity monitor
//! 4. move to `LoggedOut` and emit `SignedOut`

use bridge_traits::lifecycle::{VisibilityObserver, VisibilityState};
use bridge_traits::time::Clock;
use core_auth::{
    ActivityMonitor, ActivitySignal, AuthApi, AuthError, AuthEventBus, AuthGrant, AuthState,
    Credentials, Pipeline, RefreshCoordinator, RegistrationForm, RequestInterceptor,
    ResponseInterceptor, SessionPhase, TokenPair, TokenStore, UserSummary,
};
use core_runtime::config::SessionConfig;
use core_runtime::events::{
    AuthEvent, CoreEvent, EventBus, LogoutReason, Receiver, RecvError, SessionEvent, SignInFlow,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::ApiClient;
use crate::error::{CoreError, Result};

struct Inner {
    api: Arc<AuthApi>,
    store: Arc<TokenStore>,
    events: AuthEventBus,
    coordinator: RefreshCoordinator,
    monitor: ActivityMonitor,
    pipeline: Pipeline,
    base_url: String,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    state: watch::Sender<AuthState>,
    /// `true` while no session is open; teardown flips it back exactly once.
    signed_out: AtomicBool,
    idle_warned: AtomicBool,
    visibility: Mutex<VisibilityState>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.monitor.stop();
    }
}

/// Session façade for host applications.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Wires the session components from `config` and starts the event loop.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CoreError::InitializationFailed(format!("no Tokio runtime: {}", e)))?;

        let events = AuthEventBus::new(EventBus::new(config.event_buffer));
        let store = Arc::new(TokenStore::with_keys(
            Arc::clone(&config.secure_store),
            config.access_token_key.clone(),
            config.refresh_token_key.clone(),
        ));
        let api = Arc::new(AuthApi::from_config(&config));
        let coordinator =
            RefreshCoordinator::from_config(&config, Arc::clone(&api), Arc::clone(&store), events.clone());
        let monitor = ActivityMonitor::new(
            Arc::clone(&config.clock),
            config.idle_timeout,
            config.warning_lead,
        );

        let pipeline = Pipeline::builder(Arc::clone(&config.http_client))
            .request(Arc::new(RequestInterceptor::from_config(
                &config,
                Arc::clone(&store),
            )))
            .response(Arc::new(ResponseInterceptor::from_config(
                &config,
                coordinator.clone(),
                Arc::clone(&store),
                events.clone(),
            )))
            .build();
        debug!(middlewares = ?pipeline.describe(), "Request pipeline assembled");

        let (state, _) = watch::channel(AuthState::unauthenticated());
        let bus_rx = events.subscribe();
        let activity_rx = monitor.subscribe();

        let inner = Arc::new(Inner {
            api,
            store,
            events,
            coordinator,
            monitor,
            pipeline,
            base_url: config.base_url.clone(),
            clock: Arc::clone(&config.clock),
            leeway: config.expiry_leeway,
            state,
            signed_out: AtomicBool::new(true),
            idle_warned: AtomicBool::new(false),
            visibility: Mutex::new(VisibilityState::Visible),
            shutdown: CancellationToken::new(),
        });

        runtime.spawn(run_event_loop(
            Arc::downgrade(&inner),
            bus_rx,
            activity_rx,
            inner.shutdown.clone(),
        ));

        info!(base_url = %config.base_url, "Session manager ready");
        Ok(Self { inner })
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Observer for state changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Typed auth and session events.
    pub fn events(&self) -> Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn client(&self) -> ApiClient {
        ApiClient::new(self.inner.pipeline.clone(), self.inner.base_url.clone())
    }

    /// Resumes a session from durable storage.
    ///
    /// A valid access token resumes directly. An expired one is refreshed when
    /// the refresh token is still usable. Anything else is cleared and the
    /// state stays `Unauthenticated`.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<AuthState> {
        let inner = &self.inner;
        if inner.state.borrow().is_authenticated {
            return Ok(self.state());
        }
        let pair = inner.store.load().await?;
        let now = inner.clock.now();

        if let Some(access) = &pair.access {
            if !access.is_expired_at(now, inner.leeway) {
                inner.open_session(SignInFlow::Restore, pair, None);
                return Ok(self.state());
            }
        }

        if pair.has_usable_refresh(now) {
            inner.transition(SessionPhase::Refreshing, |_| {})?;
            inner.events.begin_session();
            return match inner.coordinator.refresh_or_fail().await {
                Ok(_) => {
                    inner.open_session(SignInFlow::Restore, inner.store.get(), None);
                    Ok(self.state())
                }
                Err(e) => {
                    info!(error = %e, "Stored session could not be renewed");
                    inner.transition(SessionPhase::Unauthenticated, |s| {
                        s.is_authenticated = false;
                        s.tokens = TokenPair::empty();
                    })?;
                    Ok(self.state())
                }
            };
        }

        if !pair.is_empty() {
            debug!("Discarding stored tokens that can no longer be used");
            if let Err(e) = inner.store.clear().await {
                warn!(error = %e, "Failed to discard stale tokens");
            }
        }
        Ok(self.state())
    }

    #[instrument(skip(self, credentials))]
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthState> {
        self.inner.begin_sign_in(SignInFlow::Login)?;
        let result = self.inner.api.login(credentials).await;
        self.inner.finish_sign_in(SignInFlow::Login, result).await?;
        Ok(self.state())
    }

    #[instrument(skip(self, form))]
    pub async fn register(&self, form: &RegistrationForm) -> Result<AuthState> {
        self.inner.begin_sign_in(SignInFlow::Register)?;
        let result = self.inner.api.register(form).await;
        self.inner.finish_sign_in(SignInFlow::Register, result).await?;
        Ok(self.state())
    }

    /// Signs out. The server is told to revoke the refresh token on a
    /// best-effort basis; local teardown always happens.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let inner = &self.inner;
        let pair = inner.store.get();
        if let Some(refresh) = &pair.refresh {
            let now = inner.clock.now();
            let access = pair
                .access
                .as_ref()
                .filter(|token| !token.is_expired_at(now, inner.leeway));
            if let Err(e) = inner.api.logout(access, refresh).await {
                warn!(error = %e, "Server-side logout failed, continuing locally");
            }
        }

        inner.teardown(LogoutReason::UserRequested).await;
        Ok(())
    }

    /// Records a user interaction.
    pub fn record_activity(&self) {
        self.inner.monitor.record_activity();
    }

    /// Dismisses the idle warning.
    pub fn stay_active(&self) {
        self.inner.monitor.stay_active();
    }

    /// Host visibility changed. Becoming visible re-evaluates idle time from
    /// the wall clock.
    pub fn set_visibility(&self, state: VisibilityState) {
        let previous = {
            let mut current = self
                .inner
                .visibility
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, state)
        };
        if previous == state {
            return;
        }

        debug!(?state, "Host visibility changed");
        if state.is_visible() {
            self.inner.monitor.resume();
        }
    }

    pub fn visibility(&self) -> VisibilityState {
        *self
            .inner
            .visibility
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Follows visibility changes reported by the host.
    pub async fn watch_visibility(&self, observer: &dyn VisibilityObserver) -> Result<()> {
        let initial = observer
            .get_state()
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
        self.set_visibility(initial);

        let mut changes = observer
            .subscribe_changes()
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = changes.next() => next,
                };
                let (Some(state), Some(inner)) = (next, weak.upgrade()) else {
                    break;
                };
                SessionManager { inner }.set_visibility(state);
            }
            debug!("Visibility watcher stopped");
        });
        Ok(())
    }

    /// Whether the activity timer is running.
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.is_running()
    }
}

impl Inner {
    fn current_phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    /// Moves to `next`, applying `mutate` to the new state.
    ///
    /// Staying in the same phase is always allowed and only applies `mutate`.
    fn transition(
        &self,
        next: SessionPhase,
        mutate: impl FnOnce(&mut AuthState),
    ) -> std::result::Result<(), AuthError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.phase != next && !state.phase.can_transition_to(next) {
                outcome = Err(AuthError::InvalidTransition {
                    from: state.phase.to_string(),
                    to: next.to_string(),
                });
                return false;
            }
            let mut candidate = state.clone();
            candidate.phase = next;
            mutate(&mut candidate);
            let (candidate, repaired) = candidate.repaired();
            if repaired {
                warn!(phase = %next, "Authenticated state without access token, cleared flag");
            }
            if *state == candidate {
                return false;
            }

            debug!(from = %state.phase, to = %next, "Session transition");
            *state = candidate;
            true
        });
        outcome
    }

    fn begin_sign_in(&self, flow: SignInFlow) -> std::result::Result<(), AuthError> {
        let phase = self.current_phase();
        if !phase.can_transition_to(SessionPhase::Authenticating) {
            return Err(AuthError::InvalidTransition {
                from: phase.to_string(),
                to: SessionPhase::Authenticating.to_string(),
            });
        }
        self.transition(SessionPhase::Authenticating, |s| {
            s.is_authenticated = false;
            s.user = None;
            s.tokens = TokenPair::empty();
        })?;
        self.events.emit(AuthEvent::SigningIn { flow });
        Ok(())
    }

    async fn finish_sign_in(
        &self,
        flow: SignInFlow,
        result: std::result::Result<AuthGrant, AuthError>,
    ) -> std::result::Result<(), AuthError> {
        match result {
            Ok(grant) => {
                if let Err(e) = self.store.set(grant.tokens.clone()).await {
                    warn!(error = %e, "Signed in without durable token storage");
                }
                self.open_session(flow, grant.tokens, grant.user);
                Ok(())
            }
            Err(e) => {
                info!(?flow, error = %e, "Sign-in failed");
                self.transition(SessionPhase::Unauthenticated, |_| {})?;
                self.events.emit(AuthEvent::AuthError {
                    message: e.to_string(),
                    recoverable: true,
                });
                Err(e)
            }
        }
    }

    fn open_session(&self, flow: SignInFlow, tokens: TokenPair, user: Option<UserSummary>) {
        self.events.begin_session();
        self.idle_warned.store(false, Ordering::SeqCst);

        let user_id = user.as_ref().map(|u| u.id.clone());
        if let Err(e) = self.transition(SessionPhase::Authenticated, |s| {
            s.is_authenticated = true;
            s.user = user;
            s.tokens = tokens;
        }) {
            warn!(error = %e, "Could not open session");
            return;
        }

        self.signed_out.store(false, Ordering::SeqCst);
        self.monitor.start();
        info!(?flow, "Session established");
        self.events.emit(AuthEvent::SignedIn { flow, user_id });
    }

    /// Ends the session. Runs once per session; later calls only make sure
    /// no token is left behind.
    async fn teardown(&self, reason: LogoutReason) {
        if self.signed_out.swap(true, Ordering::SeqCst) {
            debug!(%reason, "Session already ended");
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Failed to clear persisted tokens");
            }
            return;
        }

        self.coordinator.cancel_pending("session ended");
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear persisted tokens");
        }
        self.monitor.stop();
        self.idle_warned.store(false, Ordering::SeqCst);

        if let Err(e) = self.transition(SessionPhase::LoggedOut, |s| {
            s.is_authenticated = false;
            s.user = None;
            s.tokens = TokenPair::empty();
        }) {
            warn!(error = %e, "Unexpected phase during teardown");
        }

        info!(%reason, "Session ended");
        self.events.emit(AuthEvent::SignedOut { reason });
    }

    async fn on_auth_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::TokenRefreshing => {
                if self.state.borrow().is_authenticated {
                    let _ = self.transition(SessionPhase::Refreshing, |_| {});
                }
            }
            AuthEvent::TokenRefreshed { .. } => {
                if !self.state.borrow().is_authenticated {
                    return;
                }
                let next = if self.idle_warned.load(Ordering::SeqCst) {
                    SessionPhase::IdleWarning
                } else {
                    SessionPhase::Authenticated
                };
                let tokens = self.store.get();
                let _ = self.transition(next, |s| s.tokens = tokens);
            }
            AuthEvent::TokenExpired { reason } => {
                if self.state.borrow().is_authenticated {
                    info!(%reason, "Ending session after token expiry");
                    self.teardown(LogoutReason::SessionExpired).await;
                }
            }
            _ => {}
        }
    }

    /// Catches up after missed bus events: a session whose access token is
    /// gone has ended even if its `TokenExpired` was dropped.
    async fn reconcile_after_lag(&self) {
        if self.state.borrow().is_authenticated && self.store.access_token().is_none() {
            info!("Tokens cleared while events were missed, ending session");
            self.teardown(LogoutReason::SessionExpired).await;
        }
    }

    async fn on_activity(&self, signal: ActivitySignal) {
        if !self.state.borrow().is_authenticated {
            return;
        }

        match signal {
            ActivitySignal::Warning { time_left } => {
                self.idle_warned.store(true, Ordering::SeqCst);
                let _ = self.transition(SessionPhase::IdleWarning, |_| {});
                self.events.emit_session(SessionEvent::IdleWarning {
                    time_left_ms: time_left.as_millis() as u64,
                });
            }
            ActivitySignal::Resumed => {
                self.idle_warned.store(false, Ordering::SeqCst);
                if self.current_phase() == SessionPhase::IdleWarning {
                    let _ = self.transition(SessionPhase::Authenticated, |_| {});
                }
                self.events.emit_session(SessionEvent::ActivityResumed);
            }
            ActivitySignal::Timeout => {
                self.events.emit_session(SessionEvent::IdleTimeout);
                self.teardown(LogoutReason::IdleTimeout).await;
            }
        }
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut bus: Receiver<CoreEvent>,
    mut activity: broadcast::Receiver<ActivitySignal>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = bus.recv() => match event {
                Ok(CoreEvent::Auth(event)) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_auth_event(event).await;
                }
                Ok(CoreEvent::Session(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event loop lagged behind the event bus");
                    let Some(inner) = inner.upgrade() else { break };
                    inner.reconcile_after_lag().await;
                }
                Err(RecvError::Closed) => break,
            },
            signal = activity.recv() => match signal {
                Ok(signal) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_activity(signal).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event loop lagged behind the activity monitor");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Session event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use bridge_desktop::MemorySecureStore;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
    use core_auth::Token;
    use core_runtime::events::ExpiryReason;

    struct Offline;

    #[async_trait]
    impl HttpClient for Offline {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Ok(HttpResponse::new(503, ""))
        }
    }

    fn token(minutes: i64) -> Token {
        let exp = (chrono::Utc::now() + chrono::Duration::minutes(minutes)).timestamp();
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        Token::new(format!("e30.{}.sig", payload))
    }

    async fn signed_in(event_buffer: usize) -> SessionManager {
        let config = SessionConfig::builder()
            .base_url("https://portal.example.edu/api")
            .http_client(Arc::new(Offline))
            .secure_store(Arc::new(MemorySecureStore::new()))
            .event_buffer(event_buffer)
            .build()
            .unwrap();
        let session = SessionManager::new(config).unwrap();

        let pair = TokenPair::new(token(10), Some(token(60)));
        session.inner.store.set(pair.clone()).await.unwrap();
        session.inner.open_session(SignInFlow::Restore, pair, None);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        session
    }

    #[tokio::test]
    async fn test_dropped_expiry_event_still_ends_session() {
        let session = signed_in(1).await;
        let mut state = session.subscribe();
        let mut events = session.events();

        session.inner.store.clear().await.unwrap();
        // Overflow the one-slot bus before the loop gets to run.
        session
            .inner
            .events
            .emit_token_expired(ExpiryReason::RefreshRejected);
        session.inner.events.emit(AuthEvent::TokenRefreshing);
        session.inner.events.emit(AuthEvent::TokenRefreshing);

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.phase == SessionPhase::LoggedOut),
        )
        .await
        .expect("session still open")
        .unwrap();
        assert!(!session.state().is_authenticated);
        assert!(!session.is_monitoring());

        let mut signed_out = 0;
        loop {
            match events.try_recv() {
                Ok(CoreEvent::Auth(AuthEvent::SignedOut { reason })) => {
                    assert_eq!(reason, LogoutReason::SessionExpired);
                    signed_out += 1;
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        assert_eq!(signed_out, 1);
    }

    #[tokio::test]
    async fn test_lag_with_tokens_in_place_keeps_session() {
        let session = signed_in(1).await;

        for _ in 0..3 {
            session.inner.events.emit(AuthEvent::TokenRefreshing);
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(session.state().is_authenticated);
        assert!(session.inner.store.access_token().is_some());
    }
}
