//! Shared fixtures: an in-process portal backend and token helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bridge_desktop::MemorySecureStore;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use bridge_traits::time::SystemClock;
use chrono::{Duration as ChronoDuration, Utc};
use core_auth::{
    AuthApi, AuthEventBus, Pipeline, RefreshCoordinator, RequestInterceptor, ResponseInterceptor,
    Token, TokenPair, TokenStore,
};
use core_runtime::config::Endpoints;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const BASE_URL: &str = "https://portal.example.edu/api";

/// Unsigned JWT expiring `minutes` from now (negative for the past).
pub fn jwt(minutes: i64) -> String {
    let exp = (Utc::now() + ChronoDuration::minutes(minutes)).timestamp();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"user_id":42}}"#, exp));
    format!("{}.{}.sig{}", header, payload, next_serial())
}

fn next_serial() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub fn url(path: &str) -> String {
    format!("{}{}", BASE_URL, path)
}

/// Portal backend double.
///
/// Protected endpoints accept only `accepted_access`. The refresh endpoint
/// answers with `refresh_status`; on 200 it issues a fresh access token and
/// starts accepting it.
pub struct MockPortal {
    pub accepted_access: Mutex<String>,
    pub refresh_status: Mutex<u16>,
    pub refresh_delay: Mutex<Duration>,
    /// When set, the refresh endpoint answers only once notified.
    pub refresh_gate: Mutex<Option<Arc<Notify>>>,
    pub reject_everything: AtomicBool,
    pub refresh_calls: AtomicUsize,
    pub protected_calls: AtomicUsize,
    pub seen: Mutex<Vec<HttpRequest>>,
    /// When set, the next protected request sees a refresh finish
    /// elsewhere: the store is updated and the request still gets a 401.
    pub rotate_during_next: Mutex<Option<(Arc<TokenStore>, String)>>,
}

impl MockPortal {
    pub fn new(accepted_access: &str) -> Arc<Self> {
        Arc::new(Self {
            accepted_access: Mutex::new(accepted_access.to_string()),
            refresh_status: Mutex::new(200),
            refresh_delay: Mutex::new(Duration::from_millis(20)),
            refresh_gate: Mutex::new(None),
            reject_everything: AtomicBool::new(false),
            refresh_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            rotate_during_next: Mutex::new(None),
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> String {
        self.accepted_access.lock().unwrap().clone()
    }

    pub fn set_refresh_status(&self, status: u16) {
        *self.refresh_status.lock().unwrap() = status;
    }

    /// Paths of protected requests in arrival order, with their bearer.
    pub fn protected_log(&self) -> Vec<(String, Option<String>)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.url.contains("/auth/"))
            .map(|r| (r.url.clone(), r.bearer().map(str::to_string)))
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockPortal {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.seen.lock().unwrap().push(request.clone());

        if request.url.ends_with("/auth/token/refresh/") {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            let gate = self.refresh_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let status = *self.refresh_status.lock().unwrap();
            if status != 200 {
                return Ok(HttpResponse::new(
                    status,
                    r#"{"detail":"Token is invalid or expired"}"#,
                ));
            }
            let access = jwt(5);
            *self.accepted_access.lock().unwrap() = access.clone();
            return Ok(HttpResponse::new(200, format!(r#"{{"access":"{}"}}"#, access)));
        }

        if request.url.ends_with("/auth/logout/") {
            return Ok(HttpResponse::new(205, ""));
        }

        if request.url.starts_with("https://unreachable.example.edu") {
            return Err(BridgeError::Network("connection refused".to_string()));
        }

        self.protected_calls.fetch_add(1, Ordering::SeqCst);

        let rotation = self.rotate_during_next.lock().unwrap().take();
        if let Some((store, rotated)) = rotation {
            *self.accepted_access.lock().unwrap() = rotated.clone();
            let refresh = store.refresh_token();
            store
                .set(TokenPair::new(Token::new(rotated), refresh))
                .await
                .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
            return Ok(HttpResponse::new(401, r#"{"detail":"Token is blacklisted"}"#));
        }

        let authorized = !self.reject_everything.load(Ordering::SeqCst)
            && request.bearer() == Some(self.accepted().as_str());
        if authorized {
            Ok(HttpResponse::new(200, format!(r#"{{"url":"{}"}}"#, request.url)))
        } else {
            Ok(HttpResponse::new(
                401,
                r#"{"detail":"Given token not valid for any token type"}"#,
            ))
        }
    }
}

pub struct Harness {
    pub portal: Arc<MockPortal>,
    pub store: Arc<TokenStore>,
    pub events: AuthEventBus,
    pub coordinator: RefreshCoordinator,
    pub pipeline: Pipeline,
}

pub async fn harness(portal: Arc<MockPortal>, access: Option<String>, refresh: Option<String>) -> Harness {
    let store = Arc::new(TokenStore::new(Arc::new(MemorySecureStore::new())));
    if let Some(access) = access {
        store
            .set(TokenPair::new(Token::new(access), refresh.map(Token::new)))
            .await
            .unwrap();
    }

    let endpoints = Endpoints::default();
    let clock = Arc::new(SystemClock);
    let leeway = Duration::from_secs(5);
    let events = AuthEventBus::default();
    let api = Arc::new(AuthApi::new(portal.clone(), BASE_URL, endpoints.clone()));
    let coordinator = RefreshCoordinator::new(
        api,
        Arc::clone(&store),
        events.clone(),
        clock.clone(),
        leeway,
        Duration::from_secs(30),
    );

    let pipeline = Pipeline::builder(portal.clone())
        .request(Arc::new(RequestInterceptor::new(
            Arc::clone(&store),
            clock.clone(),
            leeway,
            BASE_URL,
            &endpoints,
        )))
        .response(Arc::new(ResponseInterceptor::new(
            coordinator.clone(),
            Arc::clone(&store),
            events.clone(),
            clock,
            leeway,
            BASE_URL,
            &endpoints,
        )))
        .retry_policy(RetryPolicy::none())
        .build();

    Harness {
        portal,
        store,
        events,
        coordinator,
        pipeline,
    }
}
