use bridge_traits::BridgeError;
use thiserror::Error;

/// Errors surfaced by the session components.
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server rejected the credentials (HTTP 401).
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    /// The refresh chain failed. Always terminal for the session.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// No response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// 4xx other than 401, body passed through verbatim.
    #[error("Request rejected with status {status}: {body}")]
    Validation { status: u16, body: String },

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    /// What callers see once the session has been ended by an auth failure.
    #[error("Session expired")]
    SessionExpired,

    /// A queued request was abandoned, usually by logout.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Token malformed: {0}")]
    TokenMalformed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl AuthError {
    /// Maps a non-success HTTP status to its error class.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 => AuthError::Unauthorized(body),
            500..=599 => AuthError::Server { status, body },
            _ => AuthError::Validation { status, body },
        }
    }

    /// Whether this error ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::RefreshFailed(_) | AuthError::SessionExpired)
    }
}

impl From<BridgeError> for AuthError {
    fn from(e: BridgeError) -> Self {
        AuthError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
