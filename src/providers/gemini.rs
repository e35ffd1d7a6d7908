//! Native Gemini backend.
//!
//! Auth priority: config key → GENAI_API_KEY → GEMINI_API_KEY → GOOGLE_API_KEY
//!
//! Single answers use `:generateContent`; streaming uses
//! `:streamGenerateContent?alt=sse`, whose body is a server-sent event stream
//! with one JSON response object per event. Thinking models tag reasoning
//! parts with `thought: true`. Streamed chunks never relay them; a single
//! answer made only of thought parts falls back to their text.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{parse_backend_error, GatewayError, Result};
use crate::session::{Conversation, Role};

use super::sse::SseDecoder;
use super::{ChatBackend, FragmentSource, GenerationOptions};

/// Gemini v1beta REST API base.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model when none is configured.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-flash-latest";

/// Environment variables consulted for an API key, in priority order.
const API_KEY_ENV_VARS: [&str; 3] = ["GENAI_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"];

// ── Auth ─────────────────────────────────────────────────────────────────────

/// Authentication method for the Gemini REST API.
pub enum GeminiAuth {
    /// Standard API key, sent as `?key=` query parameter.
    ApiKey(String),
    /// OAuth bearer token, sent as `Authorization: Bearer` header.
    BearerToken(String),
}

impl std::fmt::Debug for GeminiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("GeminiAuth::ApiKey([REDACTED])"),
            Self::BearerToken(_) => f.write_str("GeminiAuth::BearerToken([REDACTED])"),
        }
    }
}

impl GeminiAuth {
    /// Resolve credentials: a non-empty explicit key wins over the
    /// environment key, which wins over a bearer token.
    pub fn resolve(
        explicit_key: Option<&str>,
        env_key: Option<&str>,
        bearer_token: Option<&str>,
    ) -> Option<Self> {
        if let Some(k) = explicit_key.filter(|k| !k.is_empty()) {
            return Some(Self::ApiKey(k.to_string()));
        }
        if let Some(k) = env_key.filter(|k| !k.is_empty()) {
            return Some(Self::ApiKey(k.to_string()));
        }
        bearer_token
            .filter(|t| !t.is_empty())
            .map(|t| Self::BearerToken(t.to_string()))
    }

    /// First non-empty API key found in the environment.
    pub fn env_key() -> Option<String> {
        API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|v| !v.is_empty())
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// Gemini backend speaking the REST API directly.
pub struct GeminiBackend {
    auth: GeminiAuth,
    model: String,
    api_base: String,
    options: GenerationOptions,
    client: Client,
}

impl std::fmt::Debug for GeminiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiBackend")
            .field("auth", &self.auth)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl GeminiBackend {
    /// Build a backend that authenticates with an API key.
    pub fn new_with_key(api_key: &str, model: &str) -> Result<Self> {
        Self::new(GeminiAuth::ApiKey(api_key.to_string()), model)
    }

    pub fn new(auth: GeminiAuth, model: &str) -> Result<Self> {
        Ok(Self {
            auth,
            model: model.to_string(),
            api_base: GEMINI_API_BASE.to_string(),
            options: GenerationOptions::default(),
            client: Self::build_client()?,
        })
    }

    /// Build from configuration, falling back to the environment for the key.
    pub fn from_config(
        api_key: Option<&str>,
        model: &str,
        api_base: &str,
        options: GenerationOptions,
    ) -> Result<Self> {
        let env_key = GeminiAuth::env_key();
        let auth = GeminiAuth::resolve(api_key, env_key.as_deref(), None).ok_or_else(|| {
            GatewayError::Config(
                "no Gemini API key: set backend.api_key or GENAI_API_KEY".to_string(),
            )
        })?;
        Ok(Self::new(auth, model)?
            .with_api_base(api_base)
            .with_options(options))
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    // No overall timeout: it would cut long streams short. Request and idle
    // deadlines are enforced by the chat session.
    fn build_client() -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))
    }

    /// Build a `generateContent` request body from a conversation.
    pub fn build_request_body(&self, conversation: &Conversation) -> Value {
        let contents: Vec<Value> = conversation
            .messages
            .iter()
            .map(|m| {
                let gemini_role = match m.role {
                    Role::Assistant => "model",
                    Role::User => "user",
                };
                json!({
                    "role": gemini_role,
                    "parts": [{ "text": &m.content }]
                })
            })
            .collect();

        let mut generation_config = json!({});
        if let Some(max_tokens) = self.options.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(temp) = self.options.temperature {
            generation_config["temperature"] = json!(temp);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config
        });

        if let Some(sys) = conversation.system_instruction.as_deref() {
            body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
        }

        body
    }

    /// Extract answer text from one Gemini response object.
    ///
    /// Thought parts are skipped. When a response carries only thought parts
    /// (unusual), their text is returned so the caller still gets something.
    pub fn extract_text(response: &Value) -> Option<String> {
        if let Some(answer) = Self::answer_text(response) {
            return Some(answer);
        }

        let parts = response["candidates"][0]["content"]["parts"].as_array()?;
        let thought_parts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
        if !thought_parts.is_empty() {
            Some(thought_parts.join(""))
        } else {
            None
        }
    }

    /// Non-thought text of one response object, `None` if there is none.
    fn answer_text(response: &Value) -> Option<String> {
        let parts = response["candidates"][0]["content"]["parts"].as_array()?;
        let final_parts: Vec<&str> = parts
            .iter()
            .filter(|p| !p["thought"].as_bool().unwrap_or(false))
            .filter_map(|p| p["text"].as_str())
            .collect();
        if final_parts.is_empty() {
            None
        } else {
            Some(final_parts.join(""))
        }
    }

    /// Detect a prompt the backend refused to answer.
    fn blocked_reason(response: &Value) -> Option<String> {
        response["promptFeedback"]["blockReason"]
            .as_str()
            .map(|reason| format!("prompt blocked by Gemini: {reason}"))
    }

    /// Interpret one streamed event payload.
    ///
    /// `Ok(None)` means the event carried no answer text (usage-only, finish
    /// markers, or thought parts only).
    fn parse_stream_event(payload: &str) -> Result<Option<String>> {
        let value: Value = serde_json::from_str(payload).map_err(|e| {
            GatewayError::BackendUnavailable(format!("malformed Gemini stream event: {e}"))
        })?;
        if let Some(message) = value["error"]["message"].as_str() {
            let status = value["error"]["code"]
                .as_u64()
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(500);
            return Err(parse_backend_error(status, message));
        }
        if let Some(reason) = Self::blocked_reason(&value) {
            return Err(GatewayError::BackendRejected(reason));
        }
        Ok(Self::answer_text(&value).filter(|text| !text.is_empty()))
    }

    /// Build the API URL for `method` (`generateContent` or
    /// `streamGenerateContent`).
    fn api_url(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, self.model, method)
    }

    /// Attach authentication to the request builder.
    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            GeminiAuth::ApiKey(key) => request.query(&[("key", key.as_str())]),
            GeminiAuth::BearerToken(token) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
        }
    }

    /// Send the request and return the response if it succeeded.
    async fn submit(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .apply_auth(request)
            .send()
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("Gemini request failed: {e}")))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_default();

        // Prefer the structured message from the Gemini error body.
        let body_msg = serde_json::from_str::<Value>(&error_text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(error_text);

        warn!(status, model = %self.model, "Gemini returned an error status");
        Err(parse_backend_error(status, &format!("Gemini API error: {body_msg}")))
    }
}

/// State threaded through the streaming decoder.
struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<String>>,
    done: bool,
}

impl StreamState {
    /// Decode a batch of event payloads into the ready queue. A failing
    /// payload ends the stream after everything queued before it.
    fn enqueue(&mut self, payloads: impl IntoIterator<Item = String>) {
        for payload in payloads {
            match GeminiBackend::parse_stream_event(&payload) {
                Ok(Some(text)) => self.ready.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => {
                    self.ready.push_back(Err(e));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

/// Turn a streaming response body into a fragment producer.
///
/// Dropping the returned stream drops the response body, which aborts the
/// underlying connection.
fn fragment_source(response: reqwest::Response) -> FragmentSource {
    let state = StreamState {
        bytes: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = st.decoder.push(&chunk);
                    st.enqueue(payloads);
                }
                Some(Err(e)) => {
                    st.done = true;
                    let err =
                        GatewayError::BackendUnavailable(format!("Gemini stream interrupted: {e}"));
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.enqueue(tail);
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String> {
        let body = self.build_request_body(conversation);
        debug!(model = %self.model, turns = conversation.len(), "Gemini generateContent");

        let request = self
            .client
            .post(self.api_url("generateContent"))
            .header("Content-Type", "application/json")
            .json(&body);
        let response = self.submit(request).await?;

        let json: Value = response.json().await.map_err(|e| {
            GatewayError::BackendUnavailable(format!("Failed to parse Gemini response: {e}"))
        })?;

        if let Some(reason) = Self::blocked_reason(&json) {
            return Err(GatewayError::BackendRejected(reason));
        }
        if let Some(meta) = json.get("usageMetadata") {
            debug!(
                prompt_tokens = meta["promptTokenCount"].as_u64().unwrap_or(0),
                completion_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0),
                "Gemini usage"
            );
        }
        Ok(Self::extract_text(&json).unwrap_or_default())
    }

    async fn stream(&self, conversation: &Conversation) -> Result<FragmentSource> {
        let body = self.build_request_body(conversation);
        debug!(model = %self.model, turns = conversation.len(), "Gemini streamGenerateContent");

        let request = self
            .client
            .post(self.api_url("streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("Content-Type", "application/json")
            .json(&body);
        let response = self.submit(request).await?;
        Ok(fragment_source(response))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
