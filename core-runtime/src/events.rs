//! # Event Bus System
//!
//! Typed, process-wide event channel for the portal session core, built on
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: `AuthEvent` for credential transitions and
//!   `SessionEvent` for inactivity signals, wrapped in `CoreEvent`
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  emit   ┌───────────┐
//! │ RefreshCoordinator├───────>│           │  subscribe  ┌────────────────┐
//! └──────────────────┘         │ EventBus  ├────────────>│ SessionManager │
//! ┌──────────────────┐  emit   │ (broadcast│             └────────────────┘
//! │ResponseInterceptor├──────>│  channel) │  subscribe  ┌────────────────┐
//! └──────────────────┘         │           ├────────────>│ UI / router    │
//! ┌──────────────────┐  emit   │           │             └────────────────┘
//! │ SessionManager   ├───────>│           │
//! └──────────────────┘         └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus, LogoutReason};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Auth(AuthEvent::SignedOut {
//!         reason: LogoutReason::IdleTimeout,
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(event.is_terminal());
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber keeps receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. Treat as shutdown.
//!
//! Terminal events may be observed more than once by a consumer that
//! subscribes twice; handling them must be idempotent.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Credential and sign-in transitions
    Auth(AuthEvent),
    /// Inactivity tracking
    Session(SessionEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
            CoreEvent::Session(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::AuthError { .. }) => EventSeverity::Error,
            CoreEvent::Auth(AuthEvent::TokenExpired { .. }) => EventSeverity::Warning,
            CoreEvent::Session(SessionEvent::IdleTimeout) => EventSeverity::Warning,
            CoreEvent::Auth(AuthEvent::SignedIn { .. })
            | CoreEvent::Auth(AuthEvent::SignedOut { .. })
            | CoreEvent::Session(SessionEvent::IdleWarning { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Whether the event ends the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreEvent::Auth(AuthEvent::TokenExpired { .. })
                | CoreEvent::Auth(AuthEvent::SignedOut { .. })
        )
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Authentication Events
// ============================================================================

/// How a session was established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignInFlow {
    Login,
    Register,
    /// Tokens found in durable storage at startup
    Restore,
}

/// Why the refresh chain ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// No refresh token was stored
    RefreshTokenMissing,
    /// The refresh token's own `exp` has passed
    RefreshTokenExpired,
    /// The refresh endpoint rejected the refresh token
    RefreshRejected,
    /// The refresh call failed or timed out
    RefreshFailed,
    /// A request failed authentication again after a successful refresh
    RetryUnauthorized,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExpiryReason::RefreshTokenMissing => "refresh token missing",
            ExpiryReason::RefreshTokenExpired => "refresh token expired",
            ExpiryReason::RefreshRejected => "refresh rejected",
            ExpiryReason::RefreshFailed => "refresh failed",
            ExpiryReason::RetryUnauthorized => "retry unauthorized",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    UserRequested,
    IdleTimeout,
    SessionExpired,
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogoutReason::UserRequested => "user requested",
            LogoutReason::IdleTimeout => "idle timeout",
            LogoutReason::SessionExpired => "session expired",
        };
        f.write_str(s)
    }
}

/// Events related to credentials and sign-in state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// Sign-in request sent.
    SigningIn { flow: SignInFlow },
    /// Session established.
    SignedIn {
        flow: SignInFlow,
        /// Portal user id when the backend returned a profile.
        user_id: Option<String>,
    },
    /// Refresh request in flight.
    TokenRefreshing,
    /// New access token stored.
    TokenRefreshed {
        /// Expiry of the new access token (Unix epoch seconds).
        expires_at: Option<i64>,
    },
    /// The refresh chain ended; the session can no longer be renewed.
    TokenExpired { reason: ExpiryReason },
    /// Session torn down. Emitted once per session.
    SignedOut { reason: LogoutReason },
    /// Non-terminal authentication error surfaced for diagnostics.
    AuthError {
        message: String,
        recoverable: bool,
    },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::SigningIn { .. } => "Authentication in progress",
            AuthEvent::SignedIn { .. } => "User signed in successfully",
            AuthEvent::TokenRefreshing => "Refreshing access token",
            AuthEvent::TokenRefreshed { .. } => "Token refreshed successfully",
            AuthEvent::TokenExpired { .. } => "Session can no longer be refreshed",
            AuthEvent::SignedOut { .. } => "User signed out",
            AuthEvent::AuthError { .. } => "Authentication error",
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Inactivity signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    /// The session ends in `time_left_ms` unless the user interacts.
    IdleWarning { time_left_ms: u64 },
    /// Activity dismissed a pending warning.
    ActivityResumed,
    /// Inactivity reached the idle timeout.
    IdleTimeout,
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::IdleWarning { .. } => "Session about to time out",
            SessionEvent::ActivityResumed => "Activity resumed",
            SessionEvent::IdleTimeout => "Session timed out due to inactivity",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// A subscriber falling behind by more than `capacity` events receives
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if nobody is listening.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let terminal = EventStream::new(event_bus.subscribe()).filter(CoreEvent::is_terminal);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
