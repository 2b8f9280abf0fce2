//! Portal authentication endpoints.
//!
//! Wire format (Django REST + simplejwt style):
//!
//! | Call | Request body | Response body |
//! |------|--------------|---------------|
//! | login | `{"email", "password"}` | `{"access", "refresh", "user"?}` |
//! | register | registration form | same as login |
//! | refresh | `{"refresh"}` | `{"access", "refresh"?}` |
//! | logout | `{"refresh"}` | ignored |
//!
//! `access_token`/`refresh_token` are accepted as aliases. These calls go
//! straight to the transport: they must never trigger the refresh flow
//! themselves.

use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use core_runtime::config::{Endpoints, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{AuthError, Result};
use crate::pipeline::classify;
use crate::types::{Token, TokenPair, UserSummary};

/// Login credentials.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Self-service registration form.
#[derive(Clone, Serialize)]
pub struct RegistrationForm {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl fmt::Debug for RegistrationForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationForm")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("full_name", &self.full_name)
            .field("role", &self.role)
            .finish()
    }
}

/// Tokens and profile returned by login or registration.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub tokens: TokenPair,
    pub user: Option<UserSummary>,
}

/// Result of a refresh call. `refresh` is set when the server rotated it.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access: Token,
    pub refresh: Option<Token>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    access: String,
    #[serde(default, alias = "refresh_token")]
    refresh: Option<String>,
    #[serde(default)]
    user: Option<UserSummary>,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh: &'a str,
}

/// Client for the authentication endpoints.
pub struct AuthApi {
    transport: Arc<dyn HttpClient>,
    base_url: String,
    endpoints: Endpoints,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn HttpClient>, base_url: impl Into<String>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            endpoints,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Arc::clone(&config.http_client),
            config.base_url.clone(),
            config.endpoints.clone(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&Token>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::post(self.url(path))
            .json(body)
            .map_err(|e| AuthError::Serialization(e.to_string()))?;
        if let Some(token) = bearer {
            request.set_bearer(token.as_str());
        }

        // Auth calls change server state; never retried at transport level.
        let response = self
            .transport
            .execute_with_retry(request, RetryPolicy::none())
            .await?;
        classify(response)
    }

    fn parse_grant(response: &HttpResponse) -> Result<AuthGrant> {
        let body: TokenResponse = response
            .json()
            .map_err(|e| AuthError::Serialization(e.to_string()))?;

        Ok(AuthGrant {
            tokens: TokenPair::new(Token::new(body.access), body.refresh.map(Token::new)),
            user: body.user,
        })
    }

    #[instrument(skip(self, credentials))]
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthGrant> {
        let response = self.post(&self.endpoints.login, credentials, None).await?;
        let grant = Self::parse_grant(&response)?;
        info!(
            has_refresh = grant.tokens.refresh.is_some(),
            has_user = grant.user.is_some(),
            "Login succeeded"
        );
        Ok(grant)
    }

    #[instrument(skip(self, form))]
    pub async fn register(&self, form: &RegistrationForm) -> Result<AuthGrant> {
        let response = self.post(&self.endpoints.register, form, None).await?;
        let grant = Self::parse_grant(&response)?;
        info!(has_user = grant.user.is_some(), "Registration succeeded");
        Ok(grant)
    }

    /// Exchanges a refresh token for a new access token.
    #[instrument(skip(self, refresh))]
    pub async fn refresh(&self, refresh: &Token) -> Result<RefreshGrant> {
        let body = RefreshBody {
            refresh: refresh.as_str(),
        };
        let response = self.post(&self.endpoints.refresh, &body, None).await?;
        let body: TokenResponse = response
            .json()
            .map_err(|e| AuthError::Serialization(e.to_string()))?;

        debug!(rotated = body.refresh.is_some(), "Refresh response received");
        Ok(RefreshGrant {
            access: Token::new(body.access),
            refresh: body.refresh.map(Token::new),
        })
    }

    /// Tells the server to revoke the refresh token.
    #[instrument(skip(self, access, refresh))]
    pub async fn logout(&self, access: Option<&Token>, refresh: &Token) -> Result<()> {
        let body = RefreshBody {
            refresh: refresh.as_str(),
        };
        self.post(&self.endpoints.logout, &body, access).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_tokens::jwt_expiring_at;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    struct CannedTransport {
        response: HttpResponse,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl CannedTransport {
        fn new(status: u16, body: String) -> Arc<Self> {
            Arc::new(Self {
                response: HttpResponse::new(status, body),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_body(&self) -> serde_json::Value {
            let seen = self.seen.lock().unwrap();
            let body = seen.last().and_then(|r| r.body.clone()).unwrap();
            serde_json::from_slice(&body).unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for CannedTransport {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(self.response.clone())
        }
    }

    fn api(transport: Arc<CannedTransport>) -> AuthApi {
        AuthApi::new(transport, "https://portal.example.edu/api/", Endpoints::default())
    }

    #[tokio::test]
    async fn test_login_parses_grant() {
        let access = jwt_expiring_at(Utc::now() + Duration::minutes(5));
        let refresh = jwt_expiring_at(Utc::now() + Duration::days(1));
        let transport = CannedTransport::new(
            200,
            format!(
                r#"{{"access":"{}","refresh":"{}","user":{{"id":3,"email":"s@uni.example.edu"}}}}"#,
                access, refresh
            ),
        );

        let grant = api(transport.clone())
            .login(&Credentials::new("s@uni.example.edu", "pw"))
            .await
            .unwrap();

        assert_eq!(grant.tokens.access.as_ref().map(Token::as_str), Some(access.as_str()));
        assert_eq!(grant.tokens.refresh.as_ref().map(Token::as_str), Some(refresh.as_str()));
        assert_eq!(grant.user.unwrap().id, "3");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://portal.example.edu/api/auth/login/");
        assert!(seen[0].bearer().is_none());
    }

    #[tokio::test]
    async fn test_login_accepts_token_aliases() {
        let transport = CannedTransport::new(
            200,
            r#"{"access_token":"a.b.c","refresh_token":"d.e.f"}"#.to_string(),
        );

        let grant = api(transport)
            .login(&Credentials::new("s@uni.example.edu", "pw"))
            .await
            .unwrap();
        assert_eq!(grant.tokens.access.unwrap().as_str(), "a.b.c");
        assert!(grant.user.is_none());
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let transport = CannedTransport::new(401, r#"{"detail":"No active account"}"#.to_string());
        let err = api(transport)
            .login(&Credentials::new("s@uni.example.edu", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(ref body) if body.contains("No active account")));
    }

    #[tokio::test]
    async fn test_register_surfaces_validation_body() {
        let body = r#"{"email":["user with this email already exists."]}"#;
        let transport = CannedTransport::new(400, body.to_string());
        let form = RegistrationForm {
            email: "s@uni.example.edu".to_string(),
            password: "pw".to_string(),
            full_name: Some("Sam".to_string()),
            role: None,
        };

        let err = api(transport.clone()).register(&form).await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Validation {
                status: 400,
                body: body.to_string()
            }
        );
        let sent = transport.last_body();
        assert_eq!(sent["full_name"], "Sam");
        assert!(sent.get("role").is_none());
    }

    #[tokio::test]
    async fn test_refresh_sends_refresh_token_and_reads_rotation() {
        let transport = CannedTransport::new(200, r#"{"access":"n.e.w"}"#.to_string());
        let refresh = Token::new("r.e.f");

        let grant = api(transport.clone()).refresh(&refresh).await.unwrap();

        assert_eq!(grant.access.as_str(), "n.e.w");
        assert!(grant.refresh.is_none());
        assert_eq!(transport.last_body()["refresh"], "r.e.f");
    }

    #[tokio::test]
    async fn test_logout_attaches_bearer() {
        let transport = CannedTransport::new(205, String::new());
        let access = Token::new("a.c.c");

        api(transport.clone())
            .logout(Some(&access), &Token::new("r.e.f"))
            .await
            .unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].bearer(), Some("a.c.c"));
        assert!(seen[0].url.ends_with("/auth/logout/"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let debug = format!("{:?}", Credentials::new("s@uni.example.edu", "hunter2"));
        assert!(!debug.contains("hunter2"));
    }
}
