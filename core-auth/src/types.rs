use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AuthError, Result};

/// A bearer credential issued by the portal backend.
///
/// The value is an opaque JWT; only the `exp` claim of its payload is read.
/// Tokens whose payload cannot be decoded are kept but treated as already
/// expired.
///
/// # Security
///
/// The `Debug` implementation never prints the raw value.
///
/// # Examples
///
/// ```
/// use core_auth::Token;
/// use chrono::{TimeZone, Utc};
/// use std::time::Duration;
///
/// // {"exp": 4102444800} (2100-01-01)
/// let token = Token::new("eyJhbGciOiJIUzI1NiJ9.eyJleHAiOjQxMDI0NDQ4MDB9.sig");
/// let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
/// assert!(!token.is_expired_at(now, Duration::from_secs(5)));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    raw: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct Claims {
    exp: f64,
}

impl Token {
    /// Wraps a raw token, decoding its expiry when possible.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let expires_at = decode_expiry(&raw).ok();
        Self { raw, expires_at }
    }

    /// Like [`Token::new`] but rejects values without a decodable expiry.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let expires_at = decode_expiry(&raw)?;
        Ok(Self {
            raw,
            expires_at: Some(expires_at),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is expired at `now`, counting tokens that expire
    /// within `leeway` as expired. A leeway too large to add to `now` counts
    /// every token as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return true;
        };
        chrono::Duration::from_std(leeway)
            .ok()
            .and_then(|leeway| now.checked_add_signed(leeway))
            .map_or(true, |deadline| deadline >= expires_at)
    }

    /// Time left before expiry, `None` once expired or undecodable.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .and_then(|exp| (exp - now).to_std().ok())
            .filter(|left| !left.is_zero())
    }
}

fn decode_expiry(raw: &str) -> Result<DateTime<Utc>> {
    let mut segments = raw.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) if segments.next().is_none() => payload,
        _ => {
            return Err(AuthError::TokenMalformed(
                "expected three dot-separated segments".to_string(),
            ))
        }
    };

    // Some issuers pad the payload segment.
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::TokenMalformed(format!("payload is not base64url: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::TokenMalformed(format!("payload has no usable exp: {}", e)))?;

    Utc.timestamp_opt(claims.exp.trunc() as i64, 0)
        .single()
        .ok_or_else(|| AuthError::TokenMalformed("exp out of range".to_string()))
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The current access/refresh pair.
///
/// A present access token was valid when it was stored; readers re-check
/// expiry before use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: Option<Token>,
    pub refresh: Option<Token>,
}

impl TokenPair {
    pub fn new(access: Token, refresh: Option<Token>) -> Self {
        Self {
            access: Some(access),
            refresh,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }

    /// Whether a refresh token exists and has not expired at `now`.
    pub fn has_usable_refresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh
            .as_ref()
            .is_some_and(|t| !t.is_expired_at(now, Duration::ZERO))
    }
}

/// Profile returned by login and registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "full_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Lifecycle phase of the session.
///
/// ```text
/// Unauthenticated -> Authenticating -> Authenticated <-> Refreshing
///        ^                 |             |    ^             |
///        +-----------------+             v    |             v
///                                     IdleWarning ------> LoggedOut
/// LoggedOut -> Authenticating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionPhase {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    IdleWarning,
    LoggedOut,
}

impl SessionPhase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Unauthenticated, Authenticated)
                | (Unauthenticated, Refreshing)
                | (Authenticating, Authenticated)
                | (Authenticating, Unauthenticated)
                | (Authenticated, Refreshing)
                | (Authenticated, IdleWarning)
                | (Authenticated, LoggedOut)
                | (Refreshing, Authenticated)
                | (Refreshing, IdleWarning)
                | (Refreshing, LoggedOut)
                | (Refreshing, Unauthenticated)
                | (IdleWarning, Authenticated)
                | (IdleWarning, Refreshing)
                | (IdleWarning, LoggedOut)
                | (LoggedOut, Authenticating)
        )
    }

    /// Phases in which requests may carry credentials.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionPhase::Authenticated | SessionPhase::Refreshing | SessionPhase::IdleWarning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::Authenticating => "authenticating",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Refreshing => "refreshing",
            SessionPhase::IdleWarning => "idle_warning",
            SessionPhase::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable authentication state.
///
/// `is_authenticated` implies an access token is present; [`AuthState::repaired`]
/// restores that invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user: Option<UserSummary>,
    pub tokens: TokenPair,
    pub phase: SessionPhase,
}

impl AuthState {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Whether `is_authenticated` is backed by an access token.
    pub fn is_consistent(&self) -> bool {
        !self.is_authenticated || self.tokens.access.is_some()
    }

    /// Returns the state with the authentication flag cleared when no access
    /// token backs it, plus whether a repair happened.
    pub fn repaired(mut self) -> (Self, bool) {
        if self.is_consistent() {
            return (self, false);
        }
        self.is_authenticated = false;
        (self, true)
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::*;

    /// Builds an unsigned JWT whose payload carries `exp`.
    pub fn jwt_expiring_at(exp: DateTime<Utc>) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"user_id":7}}"#, exp.timestamp()));
        format!("{}.{}.signature", header, payload)
    }
}
