//! Generation clients selectable from the command line.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_exec::{Generation, GenerationClient, GenerationError, GenerationRequest};

/// Offline client: answers with the model name and the prompt's final line.
/// Deterministic, so repeated runs exercise the cache.
pub struct EchoClient;

#[async_trait]
impl GenerationClient for EchoClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<Generation, GenerationError> {
        let last = request.prompt.lines().last().unwrap_or_default().trim();
        let text = format!("[{}] {}", request.model, last);
        Ok(Generation {
            token_count: Some(text.split_whitespace().count() as u32),
            text,
        })
    }
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OllamaReq<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaResp {
    response: String,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<Generation, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaReq {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
                num_predict: request.sampling.max_tokens,
                seed: request.sampling.seed,
                extra: &request.sampling.extra,
            },
        };

        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let detail = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &detail));
        }

        let parsed: OllamaResp = resp
            .json()
            .await
            .map_err(|e| GenerationError::malformed(format!("unreadable response body: {e}")))?;
        if parsed.response.trim().is_empty() {
            return Err(GenerationError::malformed("empty response text"));
        }
        Ok(Generation {
            text: parsed.response,
            token_count: parsed.eval_count,
        })
    }
}

fn classify_send_error(e: reqwest::Error) -> GenerationError {
    if e.is_builder() {
        GenerationError::fatal(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        GenerationError::transient(format!("timed out: {e}"))
    } else {
        GenerationError::transient(format!("request failed: {e}"))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, detail: &str) -> GenerationError {
    let message = if detail.is_empty() {
        format!("endpoint returned {status}")
    } else {
        format!("endpoint returned {status}: {detail}")
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::rate_limited(message, retry_after),
        StatusCode::REQUEST_TIMEOUT => GenerationError::transient(message),
        s if s.is_server_error() => GenerationError::transient(message),
        _ => GenerationError::fatal(message),
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
