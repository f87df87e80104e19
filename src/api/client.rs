use super::logging::{debug_payload_enabled, emit_debug_payload};
use crate::config::Config;
use crate::error::PipelineError;
use crate::types::UpstreamRequest;
use crate::util::is_local_endpoint_url;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>;

/// Anything that can open a streaming generation call.
///
/// The production implementation is [`ApiClient`]; tests script responses
/// through [`super::mock_client::MockApiClient`].
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, PipelineError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    anthropic_version: String,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()
            .map_err(|error| PipelineError::Config(format!("cannot build http client: {error}")))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            anthropic_version: config.anthropic_version.clone(),
        })
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    fn build_payload(&self, request: &UpstreamRequest) -> Value {
        build_payload(&self.model, request)
    }
}

#[async_trait]
impl UpstreamSource for ApiClient {
    async fn open_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, PipelineError> {
        let request_url = self.api_url.clone();
        let payload = self.build_payload(request);

        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }

        let mut http_request = self
            .http
            .post(&request_url)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("x-api-key", api_key);
        }
        if !self.anthropic_version.trim().is_empty() {
            http_request = http_request.header("anthropic-version", &self.anthropic_version);
        }

        let response = http_request
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &request_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::upstream(format!(
                "API endpoint '{}' returned HTTP {}: {}",
                request_url,
                status,
                body.trim()
            )));
        }

        tracing::debug!(url = %request_url, model = %self.model, "upstream stream opened");
        let request_url_for_stream = request_url.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_api_request_error(error, &request_url_for_stream))
        });
        Ok(Box::pin(stream))
    }
}

pub(crate) fn build_payload(model: &str, request: &UpstreamRequest) -> Value {
    let mut payload = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": true,
        "messages": request.messages,
    });
    if let Some(payload_object) = payload.as_object_mut() {
        if let Some(system) = request.system.as_ref().filter(|s| !s.trim().is_empty()) {
            payload_object.insert("system".to_string(), json!(system));
        }
        if !request.tools.is_empty() {
            payload_object.insert("tools".to_string(), json!(request.tools));
        }
        if let Some(choice) = &request.tool_choice {
            payload_object.insert("tool_choice".to_string(), json!(choice));
        }
    }
    payload
}

fn map_api_request_error(error: reqwest::Error, request_url: &str) -> PipelineError {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return PipelineError::upstream(format!(
            "cannot reach local API endpoint '{request_url}': {error}. Start your local server or update ANTHROPIC_API_URL."
        ));
    }
    if error.is_connect() {
        return PipelineError::upstream(format!(
            "cannot reach API endpoint '{request_url}': {error}"
        ));
    }
    if error.is_timeout() {
        return PipelineError::upstream(format!(
            "API request to '{request_url}' timed out: {error}"
        ));
    }
    if let Some(status) = error.status() {
        return PipelineError::upstream(format!(
            "API endpoint '{request_url}' returned HTTP {status}: {error}"
        ));
    }
    PipelineError::upstream(format!("API request to '{request_url}' failed: {error}"))
}
