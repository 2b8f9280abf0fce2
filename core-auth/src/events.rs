//! Auth-facing wrapper around the runtime event bus.
//!
//! Adds one rule on top of plain broadcasting: `TokenExpired` is emitted at
//! most once per session epoch, however many requests fail at the same time.

use core_runtime::events::{
    AuthEvent, CoreEvent, EventBus, ExpiryReason, Receiver, SessionEvent,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct AuthEventBus {
    bus: EventBus,
    epoch: Arc<AtomicU64>,
    expired_epoch: Arc<AtomicU64>,
}

impl AuthEventBus {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            epoch: Arc::new(AtomicU64::new(1)),
            expired_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    /// Opens a new session epoch, re-arming `TokenExpired`.
    pub fn begin_session(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: AuthEvent) {
        let _ = self.bus.emit(CoreEvent::Auth(event));
    }

    pub fn emit_session(&self, event: SessionEvent) {
        let _ = self.bus.emit(CoreEvent::Session(event));
    }

    /// Announces that the session can no longer be renewed.
    ///
    /// Returns `false` when this epoch already announced it.
    pub fn emit_token_expired(&self, reason: ExpiryReason) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.expired_epoch.swap(epoch, Ordering::SeqCst) == epoch {
            debug!(%reason, epoch, "Token expiry already announced for this session");
            return false;
        }

        warn!(%reason, epoch, "Session can no longer be refreshed");
        self.emit(AuthEvent::TokenExpired { reason });
        true
    }
}

impl Default for AuthEventBus {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_expired_once_per_epoch() {
        let events = AuthEventBus::default();
        let mut rx = events.subscribe();

        assert!(events.emit_token_expired(ExpiryReason::RefreshRejected));
        assert!(!events.emit_token_expired(ExpiryReason::RetryUnauthorized));

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenExpired {
                reason: ExpiryReason::RefreshRejected
            })
        );
        assert!(rx.try_recv().is_err());

        events.begin_session();
        assert!(events.emit_token_expired(ExpiryReason::RefreshTokenExpired));
    }

    #[tokio::test]
    async fn test_concurrent_expiry_emits_once() {
        let events = AuthEventBus::default();
        let mut rx = events.subscribe();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let events = events.clone();
                tokio::spawn(async move { events.emit_token_expired(ExpiryReason::RefreshFailed) })
            })
            .collect();

        let mut emitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                emitted += 1;
            }
        }

        assert_eq!(emitted, 1);
        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }
}
