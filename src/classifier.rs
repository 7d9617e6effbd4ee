//! Blocking language-model client used to judge revisions.
//!
//! The model is an unreliable remote dependency: every request has a timeout, retryable failures
//! are retried with exponential backoff, and a final failure is turned into an inline marker
//! string by [`Classifier::classify_or_marker`] so that a single bad call never aborts a batch.
//! Every stage that asks the model goes through it.

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Prefix of the text recorded in place of a judgment when the model could not be reached.
pub const ERROR_MARKER_PREFIX: &str = "Error during API call: ";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Rate limits, timeouts, network failures and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout | LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            LlmError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRequest<'a> {
    pub system: Option<&'a str>,
    pub prompt: &'a str,
}

/// A stateless chat-completion endpoint.
///
/// Implementations are shared by reference between all worker threads.
pub trait ChatClient: Send + Sync {
    /// Send one request and return the (trimmed) text of the reply.
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(120),
            temperature: 0.0,
            max_tokens: Some(300),
        }
    }
}

/// Client for OpenAI compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| LlmError::InvalidResponse(format!("invalid API key format: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Network(format!("failed to create client: {e}")))?;

        Ok(Self {
            http,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl ChatClient for OpenAiClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: request.prompt,
        });

        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self.http.post(&self.url).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else if e.is_connect() {
                LlmError::Network(format!("connection failed: {e}"))
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("failed to parse response: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| LlmError::InvalidResponse("response contains no message".to_string()))
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this fraction of the delay is added at random (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-indexed): `min(base * 2^attempt, max)` plus jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter_factor > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor);
            capped.mul_f64(1.0 + jitter)
        } else {
            capped
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the retries are
    /// used up. A `Retry-After` hint from a rate limit replaces the computed delay, capped at
    /// `max_delay`.
    pub fn call<T>(
        &self,
        mut operation: impl FnMut() -> Result<T, LlmError>,
    ) -> Result<T, LlmError> {
        let mut attempt = 0;

        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.max_retries => return Err(err),
                Err(err) => {
                    let delay = match &err {
                        LlmError::RateLimited {
                            retry_after: Some(retry_after),
                        } => (*retry_after).min(self.max_delay),
                        _ => self.delay_for(attempt),
                    };

                    tracing::warn!(
                        message = "Model call failed, retrying",
                        error = %err,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64
                    );

                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// A shared client together with the retry policy and the system instruction of one stage.
#[derive(Clone, Copy)]
pub struct Classifier<'c> {
    client: &'c dyn ChatClient,
    retry: &'c RetryPolicy,
    system_prompt: Option<&'c str>,
}

impl<'c> Classifier<'c> {
    pub fn new(client: &'c dyn ChatClient, retry: &'c RetryPolicy) -> Self {
        Self {
            client,
            retry,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &'c str) -> Self {
        self.system_prompt = Some(system_prompt);
        self
    }

    pub fn classify(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            system: self.system_prompt,
            prompt,
        };
        self.retry.call(|| self.client.complete(&request))
    }

    /// Like [`Classifier::classify`], but a failure is returned as the inline error marker text.
    ///
    /// Both sides are ready to be written to a report; the split only tells the caller whether the
    /// call succeeded.
    pub fn classify_or_marker(&self, prompt: &str) -> Result<String, String> {
        self.classify(prompt).map_err(|err| {
            tracing::error!(message = "Model call failed", error = %err);
            error_marker(&err)
        })
    }
}

pub fn error_marker(err: &LlmError) -> String {
    format!("{ERROR_MARKER_PREFIX}{err}")
}
