//! Session fixtures: portal backend double, controllable clock, builders.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bridge_desktop::MemorySecureStore;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::storage::SecureStore;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_service::{AuthEvent, CoreEvent, SessionConfig, SessionManager, SessionPhase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const BASE_URL: &str = "https://portal.example.edu/api";
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const WARNING_LEAD: Duration = Duration::from_secs(2 * 60);

/// Wall clock that follows Tokio time, so paused tests can move it.
pub struct TestClock {
    base: DateTime<Utc>,
    start: Instant,
    skew: Mutex<chrono::Duration>,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Utc::now(),
            start: Instant::now(),
            skew: Mutex::new(chrono::Duration::zero()),
        })
    }

    /// Moves wall time without firing timers, like a suspended laptop.
    pub fn jump(&self, by: Duration) {
        *self.skew.lock().unwrap() += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap();
        self.base + elapsed + *self.skew.lock().unwrap()
    }
}

/// Unsigned JWT expiring `minutes` after `now` (negative for the past).
pub fn jwt_at(now: DateTime<Utc>, minutes: i64) -> String {
    static SERIAL: AtomicUsize = AtomicUsize::new(0);
    let exp = (now + chrono::Duration::minutes(minutes)).timestamp();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"user_id":42}}"#, exp));
    format!("{}.{}.sig{}", header, payload, SERIAL.fetch_add(1, Ordering::SeqCst))
}

/// Portal backend double.
pub struct MockPortal {
    clock: Arc<TestClock>,
    pub accepted_access: Mutex<String>,
    pub refresh_status: Mutex<u16>,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub protected_calls: AtomicUsize,
}

impl MockPortal {
    pub fn new(clock: Arc<TestClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            accepted_access: Mutex::new(String::new()),
            refresh_status: Mutex::new(200),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
        })
    }

    pub fn jwt(&self, minutes: i64) -> String {
        jwt_at(self.clock.now(), minutes)
    }

    pub fn accepted(&self) -> String {
        self.accepted_access.lock().unwrap().clone()
    }

    /// Server-side rotation: the token the client holds stops working.
    pub fn revoke_access(&self) {
        *self.accepted_access.lock().unwrap() = "revoked-elsewhere".to_string();
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn issue_pair(&self) -> (String, String) {
        let access = self.jwt(5);
        *self.accepted_access.lock().unwrap() = access.clone();
        (access, self.jwt(60 * 24))
    }
}

#[async_trait]
impl HttpClient for MockPortal {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let path = request.url.trim_start_matches(BASE_URL).to_string();
        let body: serde_json::Value = request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(serde_json::Value::Null);

        match path.as_str() {
            "/auth/login/" => {
                self.login_calls.fetch_add(1, Ordering::SeqCst);
                if body["password"] != "correct horse" {
                    return Ok(HttpResponse::new(
                        401,
                        r#"{"detail":"No active account found with the given credentials"}"#,
                    ));
                }
                let (access, refresh) = self.issue_pair();
                Ok(HttpResponse::new(
                    200,
                    format!(
                        r#"{{"access":"{}","refresh":"{}","user":{{"id":7,"email":"{}","full_name":"Lan Pham","role":"student"}}}}"#,
                        access, refresh, body["email"].as_str().unwrap_or_default()
                    ),
                ))
            }
            "/auth/register/" => {
                if body["email"] == "taken@uni.example.edu" {
                    return Ok(HttpResponse::new(
                        400,
                        r#"{"email":["user with this email already exists."]}"#,
                    ));
                }
                let (access, refresh) = self.issue_pair();
                Ok(HttpResponse::new(
                    201,
                    format!(
                        r#"{{"access":"{}","refresh":"{}","user":{{"id":"u-19","email":"{}"}}}}"#,
                        access, refresh, body["email"].as_str().unwrap_or_default()
                    ),
                ))
            }
            "/auth/token/refresh/" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let status = *self.refresh_status.lock().unwrap();
                if status != 200 {
                    return Ok(HttpResponse::new(status, r#"{"detail":"Token is invalid or expired"}"#));
                }
                let access = self.jwt(5);
                *self.accepted_access.lock().unwrap() = access.clone();
                Ok(HttpResponse::new(200, format!(r#"{{"access":"{}"}}"#, access)))
            }
            "/auth/logout/" => {
                self.logout_calls.fetch_add(1, Ordering::SeqCst);
                Ok(HttpResponse::new(205, ""))
            }
            _ => {
                self.protected_calls.fetch_add(1, Ordering::SeqCst);
                if request.bearer() == Some(self.accepted().as_str()) {
                    Ok(HttpResponse::new(200, r#"{"results":[]}"#))
                } else {
                    Ok(HttpResponse::new(401, r#"{"detail":"Token not valid"}"#))
                }
            }
        }
    }
}

pub struct Fixture {
    pub clock: Arc<TestClock>,
    pub portal: Arc<MockPortal>,
    pub vault: Arc<MemorySecureStore>,
    pub session: SessionManager,
}

pub fn fixture() -> Fixture {
    fixture_with_vault(Arc::new(MemorySecureStore::new()))
}

pub fn fixture_with_vault(vault: Arc<MemorySecureStore>) -> Fixture {
    let clock = TestClock::new();
    let portal = MockPortal::new(clock.clone());
    let config = SessionConfig::builder()
        .base_url(BASE_URL)
        .idle_timeout(IDLE_TIMEOUT)
        .warning_lead(WARNING_LEAD)
        .http_client(portal.clone())
        .secure_store(vault.clone())
        .clock(clock.clone())
        .build()
        .unwrap();

    Fixture {
        clock,
        portal,
        vault,
        session: SessionManager::new(config).unwrap(),
    }
}

impl Fixture {
    pub async fn stored(&self, key: &str) -> Option<String> {
        self.vault
            .get_secret(key)
            .await
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }

    pub async fn wait_for_phase(&self, phase: SessionPhase) {
        let mut rx = self.session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
            .await
            .unwrap_or_else(|_| panic!("phase {} not reached", phase))
            .unwrap();
    }
}

/// Lets spawned session tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn signed_out_count(events: &[CoreEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CoreEvent::Auth(AuthEvent::SignedOut { .. })))
        .count()
}
