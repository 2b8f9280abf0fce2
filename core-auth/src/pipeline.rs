//! # Request Pipeline
//!
//! Explicit, ordered middleware chain in front of the host `HttpClient`.
//!
//! ```text
//! request ─> RequestMiddleware* ─> HttpClient ─> ResponseMiddleware* ─> classify
//!                  ^                                     │
//!                  └──────────────── Replay ─────────────┘
//! ```
//!
//! Request middlewares rewrite the outgoing request (bearer attachment).
//! Response middlewares inspect the exchange and may re-send the request
//! through [`Replay`], which runs the request stage and the transport only.
//! A replayed request never re-enters the response stage, so a request is
//! retried at most once per response middleware and never recursively.
//! Replays that belong to one group (the requests queued behind a refresh)
//! carry a [`ReplayTurn`] and reach the transport in group order.
//!
//! After the response stage the final status is classified: 2xx/3xx pass,
//! 401 becomes [`AuthError::Unauthorized`], other 4xx become
//! [`AuthError::Validation`] and 5xx become [`AuthError::Server`].

use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::error::{AuthError, Result};

/// Rewrites outgoing requests.
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    async fn on_request(&self, request: HttpRequest) -> Result<HttpRequest>;

    fn name(&self) -> &'static str;
}

/// Inspects a completed exchange and may replace its response.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn on_response(&self, exchange: Exchange, replay: &Replay) -> Result<Exchange>;

    fn name(&self) -> &'static str;
}

/// A request as it went on the wire together with the answer.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: HttpRequest,
    pub response: HttpResponse,
    /// Set once a response middleware has re-sent the request.
    pub retried: bool,
}

/// Place of a replay within an ordered group.
///
/// A replay holding a turn waits until the previous turn of its group has
/// started its transport call, then releases its own turn once its call has
/// started. Dropping a turn releases it.
#[derive(Debug)]
pub struct ReplayTurn {
    after: Option<oneshot::Receiver<()>>,
    started: Option<oneshot::Sender<()>>,
}

impl ReplayTurn {
    /// A turn that waits for nobody.
    pub fn unordered() -> Self {
        Self {
            after: None,
            started: None,
        }
    }

    /// `count` chained turns, first to last.
    pub fn sequence(count: usize) -> Vec<ReplayTurn> {
        let mut turns = Vec::with_capacity(count);
        let mut after = None;
        for _ in 0..count {
            let (started, next) = oneshot::channel();
            turns.push(ReplayTurn {
                after: after.take(),
                started: Some(started),
            });
            after = Some(next);
        }
        turns
    }

    async fn wait(&mut self) {
        if let Some(previous) = self.after.take() {
            // A dropped predecessor counts as started.
            let _ = previous.await;
        }
    }

    fn release(&mut self) {
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
    }
}

/// Sends a request through the request stage and transport only.
#[derive(Clone)]
pub struct Replay {
    request_stage: Arc<[Arc<dyn RequestMiddleware>]>,
    transport: Arc<dyn HttpClient>,
    retry_policy: RetryPolicy,
}

impl Replay {
    pub async fn send(&self, request: HttpRequest) -> Result<Exchange> {
        self.send_in_turn(request, ReplayTurn::unordered()).await
    }

    /// Like [`Replay::send`], but the transport call starts only after the
    /// previous turn's call has.
    pub async fn send_in_turn(
        &self,
        request: HttpRequest,
        mut turn: ReplayTurn,
    ) -> Result<Exchange> {
        turn.wait().await;
        let request = run_request_stage(&self.request_stage, request).await?;

        let mut call = self
            .transport
            .execute_with_retry(request.clone(), self.retry_policy.clone());
        // First poll puts the request on its way; the next turn may go after it.
        let first = futures::poll!(call.as_mut());
        turn.release();
        let response = match first {
            Poll::Ready(response) => response,
            Poll::Pending => call.await,
        }?;

        Ok(Exchange {
            request,
            response,
            retried: true,
        })
    }
}

async fn run_request_stage(
    stage: &[Arc<dyn RequestMiddleware>],
    mut request: HttpRequest,
) -> Result<HttpRequest> {
    for middleware in stage {
        request = middleware.on_request(request).await?;
    }
    Ok(request)
}

/// Maps the final response of an exchange to the error taxonomy.
pub fn classify(response: HttpResponse) -> Result<HttpResponse> {
    if response.status < 400 {
        return Ok(response);
    }
    let body = String::from_utf8_lossy(&response.body).into_owned();
    Err(AuthError::from_status(response.status, body))
}

/// Ordered middleware chain.
#[derive(Clone)]
pub struct Pipeline {
    replay: Replay,
    response_stage: Arc<[Arc<dyn ResponseMiddleware>]>,
}

impl Pipeline {
    pub fn builder(transport: Arc<dyn HttpClient>) -> PipelineBuilder {
        PipelineBuilder {
            transport,
            request_stage: Vec::new(),
            response_stage: Vec::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sends a request and returns the classified final response.
    #[instrument(skip(self, request), fields(request_id = %request.id, method = %request.method))]
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = run_request_stage(&self.replay.request_stage, request).await?;
        let response = self
            .replay
            .transport
            .execute_with_retry(request.clone(), self.replay.retry_policy.clone())
            .await?;

        let mut exchange = Exchange {
            request,
            response,
            retried: false,
        };

        for middleware in self.response_stage.iter() {
            exchange = middleware.on_response(exchange, &self.replay).await?;
        }

        debug!(
            status = exchange.response.status,
            retried = exchange.retried,
            "Request completed"
        );
        classify(exchange.response)
    }

    /// Names of the configured middlewares in execution order.
    pub fn describe(&self) -> Vec<&'static str> {
        self.replay
            .request_stage
            .iter()
            .map(|m| m.name())
            .chain(self.response_stage.iter().map(|m| m.name()))
            .collect()
    }
}

pub struct PipelineBuilder {
    transport: Arc<dyn HttpClient>,
    request_stage: Vec<Arc<dyn RequestMiddleware>>,
    response_stage: Vec<Arc<dyn ResponseMiddleware>>,
    retry_policy: RetryPolicy,
}

impl PipelineBuilder {
    pub fn request(mut self, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.request_stage.push(middleware);
        self
    }

    pub fn response(mut self, middleware: Arc<dyn ResponseMiddleware>) -> Self {
        self.response_stage.push(middleware);
        self
    }

    /// Transport-level retry policy for idempotent requests.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            replay: Replay {
                request_stage: self.request_stage.into(),
                transport: self.transport,
                retry_policy: self.retry_policy,
            },
            response_stage: self.response_stage.into(),
        }
    }
}
