//! Protected request entry point for feature code.

use bridge_traits::http::{HttpRequest, HttpResponse};
use core_auth::{AuthError, Pipeline};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Sends portal API requests through the credential pipeline.
///
/// Relative paths are resolved against the API base URL. Errors keep the
/// session error taxonomy: `SessionExpired` after a terminal auth failure,
/// `Validation`/`Server` with the server's body, `Network` when nothing came
/// back.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Pipeline,
    base_url: String,
}

impl ApiClient {
    pub(crate) fn new(pipeline: Pipeline, base_url: impl Into<String>) -> Self {
        Self {
            pipeline,
            base_url: base_url.into(),
        }
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        Ok(self.pipeline.send(request).await?)
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        self.send(HttpRequest::get(self.url(path))).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        response
            .json()
            .map_err(|e| CoreError::Decode(e.to_string()))
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<HttpResponse> {
        let request = HttpRequest::post(self.url(path))
            .json(body)
            .map_err(|e| AuthError::Serialization(e.to_string()))?;
        self.send(request).await
    }
}
