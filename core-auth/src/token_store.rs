//! Token Storage
//!
//! Holds the current access/refresh pair in memory and mirrors it into the
//! host `SecureStore` so a restarted client can resume the session.
//!
//! ## Consistency
//!
//! - Memory is updated with a single assignment under a write lock, so a
//!   reader sees either the old pair or the new pair, never a mix.
//! - Writers are serialized across the durable write as well, so the order
//!   of persisted pairs matches the order of in-memory updates.
//! - Once `clear()` has updated memory no reader observes a token, even
//!   while the durable delete is still running.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{Token, TokenPair, TokenStore};
//! use std::sync::Arc;
//! # use bridge_traits::storage::SecureStore;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let store = TokenStore::new(secure_store);
//! store.load().await?;
//!
//! store
//!     .set(TokenPair::new(Token::new("a.b.c"), Some(Token::new("d.e.f"))))
//!     .await?;
//! store.clear().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{Token, TokenPair};
use bridge_traits::storage::SecureStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// In-memory token pair backed by durable storage.
pub struct TokenStore {
    current: RwLock<TokenPair>,
    secure_store: Arc<dyn SecureStore>,
    write_lock: Mutex<()>,
    access_key: String,
    refresh_key: String,
}

impl TokenStore {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self::with_keys(secure_store, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY)
    }

    /// Create a store that persists under custom key names.
    pub fn with_keys(
        secure_store: Arc<dyn SecureStore>,
        access_key: impl Into<String>,
        refresh_key: impl Into<String>,
    ) -> Self {
        Self {
            current: RwLock::new(TokenPair::empty()),
            secure_store,
            write_lock: Mutex::new(()),
            access_key: access_key.into(),
            refresh_key: refresh_key.into(),
        }
    }

    /// Snapshot of the current pair.
    pub fn get(&self) -> TokenPair {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn access_token(&self) -> Option<Token> {
        self.get().access
    }

    pub fn refresh_token(&self) -> Option<Token> {
        self.get().refresh
    }

    pub fn has_usable_refresh(&self, now: DateTime<Utc>) -> bool {
        self.get().has_usable_refresh(now)
    }

    fn replace(&self, pair: TokenPair) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = pair;
    }

    /// Replaces the pair and persists it.
    ///
    /// Memory is updated before the durable write starts. An `Err` means the
    /// new pair is live in memory but could not be persisted.
    pub async fn set(&self, pair: TokenPair) -> Result<()> {
        self.set_if(pair, || true).await.map(|_| ())
    }

    /// Like [`TokenStore::set`], but only when `current()` still holds once
    /// no other writer is active. Returns whether the pair was applied.
    pub async fn set_if<F>(&self, pair: TokenPair, current: F) -> Result<bool>
    where
        F: FnOnce() -> bool + Send,
    {
        let _guard = self.write_lock.lock().await;
        if !current() {
            debug!("Token pair superseded before it was stored");
            return Ok(false);
        }

        self.replace(pair.clone());
        debug!(
            has_access = pair.access.is_some(),
            has_refresh = pair.refresh.is_some(),
            "Token pair updated"
        );

        self.persist(&self.access_key, pair.access.as_ref()).await?;
        self.persist(&self.refresh_key, pair.refresh.as_ref()).await?;
        Ok(true)
    }

    /// Removes both tokens from memory and from durable storage.
    ///
    /// Memory is always cleared; an `Err` only reports a failed durable
    /// delete.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.replace(TokenPair::empty());

        let access = self.persist(&self.access_key, None).await;
        let refresh = self.persist(&self.refresh_key, None).await;
        info!("Tokens cleared");
        access.and(refresh)
    }

    /// Restores the pair from durable storage into memory.
    ///
    /// Entries that are not valid tokens are deleted and treated as absent.
    pub async fn load(&self) -> Result<TokenPair> {
        let _guard = self.write_lock.lock().await;

        let access = self.read_token(&self.access_key).await?;
        let refresh = self.read_token(&self.refresh_key).await?;
        let pair = TokenPair { access, refresh };

        self.replace(pair.clone());
        info!(
            has_access = pair.access.is_some(),
            has_refresh = pair.refresh.is_some(),
            "Tokens restored from storage"
        );
        Ok(pair)
    }

    async fn persist(&self, key: &str, token: Option<&Token>) -> Result<()> {
        let result = match token {
            Some(token) => {
                self.secure_store
                    .set_secret(key, token.as_str().as_bytes())
                    .await
            }
            None => self.secure_store.delete_secret(key).await,
        };

        result.map_err(|e| {
            warn!(key, error = %e, "Failed to persist token");
            AuthError::SecureStorageUnavailable(e.to_string())
        })
    }

    async fn read_token(&self, key: &str) -> Result<Option<Token>> {
        let bytes = self.secure_store.get_secret(key).await.map_err(|e| {
            warn!(key, error = %e, "Failed to read token from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let parsed = String::from_utf8(bytes)
            .map_err(|e| AuthError::TokenMalformed(e.to_string()))
            .and_then(Token::parse);

        match parsed {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupted token");
                if let Err(delete_err) = self.secure_store.delete_secret(key).await {
                    warn!(key, error = %delete_err, "Failed to delete corrupted token");
                }
                Ok(None)
            }
        }
    }
}
