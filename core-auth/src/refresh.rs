//! # Refresh Coordinator
//!
//! Guarantees at most one refresh call in flight, however many requests
//! discover an expired access token at the same time.
//!
//! ## Flow
//!
//! ```text
//! 401 ─┐
//! 401 ─┼─> wait_for_refresh() ─> pending queue ─┐
//! 401 ─┘                                        │
//!                     refresh task (spawned) ───┴─> resolve waiters (FIFO)
//! ```
//!
//! The refresh runs as its own Tokio task so it completes even when the
//! caller that started it is dropped. Callers of [`RefreshCoordinator::refresh_or_fail`]
//! join a shared handle to the same task; callers of
//! [`RefreshCoordinator::wait_for_refresh`] are queued and resolved in
//! arrival order once the task has stored the new token and emitted its
//! event. Each resolved waiter also gets a [`ReplayTurn`], so the retries
//! reach the transport in queue order whatever the runtime flavor. The
//! in-flight marker is cleared together with the queue drain, so a caller
//! either joins the running refresh or starts the next one.
//!
//! A supervisor task watches the refresh task; if it dies, the marker is
//! cleared and the queue rejected even when nobody awaits the shared handle.
//!
//! Any failure of the refresh chain is terminal: tokens are cleared and
//! `TokenExpired` is announced once for the session.

use bridge_traits::time::Clock;
use core_runtime::config::SessionConfig;
use core_runtime::events::{AuthEvent, ExpiryReason};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::api::AuthApi;
use crate::error::{AuthError, Result};
use crate::events::AuthEventBus;
use crate::pipeline::ReplayTurn;
use crate::token_store::TokenStore;
use crate::types::{Token, TokenPair};

type SharedRefresh = Shared<BoxFuture<'static, Result<Token>>>;

/// What a queued request receives once the refresh succeeds.
#[derive(Debug)]
pub struct QueuedRefresh {
    pub token: Token,
    /// The request's place among the retries of this refresh.
    pub turn: ReplayTurn,
}

#[derive(Default)]
struct Flight {
    in_flight: Option<SharedRefresh>,
    queue: VecDeque<oneshot::Sender<Result<QueuedRefresh>>>,
}

struct Failure {
    /// `None` when the refresh was abandoned rather than failed.
    reason: Option<ExpiryReason>,
    error: AuthError,
}

impl Failure {
    fn terminal(reason: ExpiryReason, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            error: AuthError::RefreshFailed(message.into()),
        }
    }
}

struct Inner {
    api: Arc<AuthApi>,
    store: Arc<TokenStore>,
    events: AuthEventBus,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    refresh_timeout: Duration,
    flight: Mutex<Flight>,
    generation: AtomicU64,
}

/// Single-flight token refresh with a FIFO queue of waiting requests.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        api: Arc<AuthApi>,
        store: Arc<TokenStore>,
        events: AuthEventBus,
        clock: Arc<dyn Clock>,
        leeway: Duration,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                events,
                clock,
                leeway,
                refresh_timeout,
                flight: Mutex::new(Flight::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(
        config: &SessionConfig,
        api: Arc<AuthApi>,
        store: Arc<TokenStore>,
        events: AuthEventBus,
    ) -> Self {
        Self::new(
            api,
            store,
            events,
            Arc::clone(&config.clock),
            config.expiry_leeway,
            config.refresh_timeout,
        )
    }

    /// Refreshes the access token, joining a refresh already in flight.
    pub async fn refresh_or_fail(&self) -> Result<Token> {
        let shared = {
            let mut flight = self.inner.lock();
            match &flight.in_flight {
                Some(shared) => {
                    debug!("Joining refresh already in flight");
                    shared.clone()
                }
                None => start_flight(&self.inner, &mut flight),
            }
        };
        shared.await
    }

    /// Queues the caller behind the current refresh, starting one if needed.
    ///
    /// Waiters are resolved in the order they were queued, and their turns
    /// follow the same order.
    pub async fn wait_for_refresh(&self) -> Result<QueuedRefresh> {
        let (tx, rx) = oneshot::channel();
        {
            let mut flight = self.inner.lock();
            flight.queue.push_back(tx);
            if flight.in_flight.is_none() {
                start_flight(&self.inner, &mut flight);
            }
            debug!(queued = flight.queue.len(), "Request queued behind refresh");
        }

        rx.await
            .unwrap_or_else(|_| Err(AuthError::Cancelled("refresh abandoned".to_string())))
    }

    /// Rejects every queued waiter.
    ///
    /// A refresh still in flight finishes but its result is discarded, so it
    /// cannot bring tokens back after logout. Call before clearing the store.
    pub fn cancel_pending(&self, reason: &str) -> usize {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let waiters: Vec<_> = self.inner.lock().queue.drain(..).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(AuthError::Cancelled(reason.to_string())));
        }
        if count > 0 {
            info!(count, reason, "Cancelled queued requests");
        }
        count
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

fn start_flight(inner: &Arc<Inner>, flight: &mut Flight) -> SharedRefresh {
    let generation = inner.generation.load(Ordering::SeqCst);
    let task = tokio::spawn(Arc::clone(inner).run(generation));

    let cleanup = Arc::clone(inner);
    let supervisor = tokio::spawn(async move {
        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(error = %join_error, "Refresh task aborted");
                let err = AuthError::RefreshFailed(join_error.to_string());
                cleanup.finish(&Err(err.clone()));
                Err(err)
            }
        }
    });

    let shared = async move {
        supervisor
            .await
            .unwrap_or_else(|e| Err(AuthError::RefreshFailed(e.to_string())))
    }
    .boxed()
    .shared();

    flight.in_flight = Some(shared.clone());
    shared
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, generation: u64) -> Result<Token> {
        self.events.emit(AuthEvent::TokenRefreshing);

        let result = match self.attempt(generation).await {
            Ok(token) => {
                info!(expires_at = ?token.expires_at(), "Access token refreshed");
                self.events.emit(AuthEvent::TokenRefreshed {
                    expires_at: token.expires_at().map(|at| at.timestamp()),
                });
                Ok(token)
            }
            Err(Failure {
                reason: Some(reason),
                error,
            }) => {
                warn!(%reason, error = %error, "Token refresh failed");
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "Failed to clear persisted tokens after refresh failure");
                }
                self.events.emit_token_expired(reason);
                Err(error)
            }
            Err(Failure {
                reason: None,
                error,
            }) => {
                debug!("Refresh result discarded after cancellation");
                Err(error)
            }
        };

        self.finish(&result);
        result
    }

    async fn attempt(&self, generation: u64) -> std::result::Result<Token, Failure> {
        let Some(refresh) = self.store.refresh_token() else {
            return Err(Failure::terminal(
                ExpiryReason::RefreshTokenMissing,
                "no refresh token stored",
            ));
        };
        if refresh.is_expired_at(self.clock.now(), self.leeway) {
            return Err(Failure::terminal(
                ExpiryReason::RefreshTokenExpired,
                "refresh token expired",
            ));
        }

        let grant = match tokio::time::timeout(self.refresh_timeout, self.api.refresh(&refresh)).await
        {
            Err(_) => {
                return Err(Failure::terminal(
                    ExpiryReason::RefreshFailed,
                    format!("no response within {:?}", self.refresh_timeout),
                ))
            }
            Ok(Err(error)) => {
                let reason = match error {
                    AuthError::Unauthorized(_) | AuthError::Validation { .. } => {
                        ExpiryReason::RefreshRejected
                    }
                    _ => ExpiryReason::RefreshFailed,
                };
                return Err(Failure::terminal(reason, error.to_string()));
            }
            Ok(Ok(grant)) => grant,
        };

        let rotated = grant.refresh.is_some();
        let pair = TokenPair::new(grant.access.clone(), grant.refresh.or(Some(refresh)));
        let current = || self.generation.load(Ordering::SeqCst) == generation;
        match self.store.set_if(pair, current).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(Failure {
                    reason: None,
                    error: AuthError::Cancelled("session ended during refresh".to_string()),
                })
            }
            Err(e) => warn!(error = %e, "Refreshed tokens kept in memory only"),
        }
        debug!(rotated, "Refreshed token pair stored");

        Ok(grant.access)
    }

    /// Clears the in-flight marker and resolves queued waiters in order.
    fn finish(&self, result: &Result<Token>) {
        let waiters = {
            let mut flight = self.lock();
            flight.in_flight = None;
            std::mem::take(&mut flight.queue)
        };
        let count = waiters.len();
        match result {
            Ok(token) => {
                for (waiter, turn) in waiters.into_iter().zip(ReplayTurn::sequence(count)) {
                    let _ = waiter.send(Ok(QueuedRefresh {
                        token: token.clone(),
                        turn,
                    }));
                }
            }
            Err(e) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
        if count > 0 {
            debug!(count, success = result.is_ok(), "Resolved queued requests");
        }
    }
}
