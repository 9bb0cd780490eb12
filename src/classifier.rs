use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{ClassificationResult, TokenUsage};
use crate::error::CurateError;
use crate::normalize::normalize_response;
use crate::request::ClassificationRequest;

/// Text answer of the service plus whatever usage data came with it.
#[derive(Debug, Clone)]
pub struct ServiceReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

pub trait Classifier {
    fn classify(&self, request: &ClassificationRequest) -> Result<ServiceReply, CurateError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationOutcome {
    pub raw_response: String,
    pub result: ClassificationResult,
    pub usage: Option<TokenUsage>,
    pub skipped_images: usize,
}

/// Sends one request and normalizes the answer. Service failures become a
/// rejected result carrying the error text; only cancellation is returned as
/// an error.
pub fn classify_request<C: Classifier + ?Sized>(
    classifier: &C,
    request: &ClassificationRequest,
) -> Result<ClassificationOutcome, CurateError> {
    match classifier.classify(request) {
        Ok(reply) => Ok(ClassificationOutcome {
            result: normalize_response(&reply.text, &request.table),
            raw_response: reply.text,
            usage: reply.usage,
            skipped_images: request.skipped.len(),
        }),
        Err(CurateError::Cancelled) => Err(CurateError::Cancelled),
        Err(err) => {
            warn!("classification of {} failed: {err}", request.base_name);
            Ok(ClassificationOutcome {
                raw_response: err.to_string(),
                result: ClassificationResult::rejected(format!("classification failed: {err}")),
                usage: None,
                skipped_images: request.skipped.len(),
            })
        }
    }
}

/// Cooperative cancellation shared between a batch loop and its client.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_retries: usize,
}

#[derive(Clone)]
pub struct GeminiHttpClient {
    client: Client,
    settings: GeminiSettings,
    cancel: CancelFlag,
}

impl GeminiHttpClient {
    pub fn new(settings: GeminiSettings, cancel: CancelFlag) -> Result<Self, CurateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("series-curator/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CurateError::ServiceHttp(err.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
            HeaderValue::from_str(&settings.api_key)
                .map_err(|_| CurateError::InvalidConfig("API key is not a valid header value".to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| CurateError::ServiceHttp(err.to_string()))?;
        Ok(Self {
            client,
            settings,
            cancel,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model
        )
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CurateError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CurateError::Cancelled);
            }
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.settings.max_retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!("retry after status {status} in {delay}ms");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.settings.max_retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!("retry after transport error in {delay}ms: {err}");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(CurateError::ServiceHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, CurateError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "classification request failed".to_string());
        Err(CurateError::ServiceStatus { status, message })
    }
}

impl Classifier for GeminiHttpClient {
    fn classify(&self, request: &ClassificationRequest) -> Result<ServiceReply, CurateError> {
        let body = request_body(request);
        let url = self.url();
        info!(
            "classifying {} ({} images) with {}",
            request.base_name,
            request.payloads.len(),
            self.settings.model
        );

        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let response = Self::handle_status(response)?;
        let text = response
            .text()
            .map_err(|err| CurateError::ServiceHttp(err.to_string()))?;
        let reply = parse_generate_response(&text)?;
        if let Some(usage) = reply.usage {
            debug!("service reported {} tokens", usage.total_tokens);
        }
        Ok(reply)
    }
}

/// `generateContent` body: the instruction text first, then one inline image
/// part per identifier table entry, in table order.
pub fn request_body(request: &ClassificationRequest) -> Value {
    let mut parts = Vec::with_capacity(request.payloads.len() + 1);
    parts.push(json!({ "text": request.instructions }));
    for payload in &request.payloads {
        parts.push(json!({
            "inline_data": {
                "mime_type": payload.mime_type,
                "data": payload.data,
            }
        }));
    }
    json!({ "contents": [{ "role": "user", "parts": parts }] })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

pub fn parse_generate_response(body: &str) -> Result<ServiceReply, CurateError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|err| CurateError::ServiceResponse(err.to_string()))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| CurateError::ServiceResponse("response has no candidates".to_string()))?;

    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let finish = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(CurateError::ServiceResponse(format!(
            "candidate has no text (finish reason: {finish})"
        )));
    }

    let usage = response.usage_metadata.and_then(|usage| {
        usage.total_token_count.map(|total_tokens| TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            response_tokens: usage.candidates_token_count,
            total_tokens,
        })
    });

    Ok(ServiceReply { text, usage })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
