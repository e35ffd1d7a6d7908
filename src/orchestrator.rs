//! Per-request coordination.
//!
//! For every chat request the [`Orchestrator`] resolves the user's context,
//! picks the system prompt, composes the composite prompt, and drives a fresh
//! [`ChatSession`] down either the single-answer or the streaming path.
//!
//! Everything that can be rejected without the backend is rejected before a
//! session is created. On the streaming path, once the event channel has been
//! handed to the caller, every later failure is reported as a terminal
//! [`StreamEvent::Error`].

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::ExpiringValue;
use crate::context::{NoContext, UserContextLookup};
use crate::error::{GatewayError, Result};
use crate::prompt::{compose, CompositePrompt, PromptComponents, DEFAULT_SYSTEM_PROMPT};
use crate::providers::ChatBackend;
use crate::relay::{StreamEvent, StreamRelay};
use crate::session::{ChatSession, SessionLimits};

/// One inbound chat request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "rag_docs", deserialize_with = "null_as_empty")]
    pub rag_docs: Vec<String>,
    /// Replaces the cached system prompt for this request only.
    #[serde(skip)]
    pub system_prompt_override: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_rag_docs(mut self, rag_docs: Vec<String>) -> Self {
        self.rag_docs = rag_docs;
        self
    }

    pub fn with_system_prompt_override(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }
}

/// Snapshot of the cached system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptStatus {
    pub cached: bool,
    pub expires_in_secs: Option<u64>,
    /// Wall-clock expiry, RFC 3339.
    pub expires_at: Option<String>,
}

/// A composed prompt plus the system prompt it was built with.
#[derive(Debug)]
struct Prepared {
    prompt: CompositePrompt,
    system_prompt: String,
}

/// Coordinates context lookup, prompt composition and backend sessions.
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    context: Arc<dyn UserContextLookup>,
    prompt_cache: Arc<ExpiringValue<String>>,
    default_prompt: String,
    limits: SessionLimits,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.name())
            .field("model", &self.backend.model())
            .field("context", &self.context.name())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator with no context source and default limits.
    pub fn new(backend: Arc<dyn ChatBackend>, prompt_cache: Arc<ExpiringValue<String>>) -> Self {
        Self {
            backend,
            context: Arc::new(NoContext),
            prompt_cache,
            default_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            limits: SessionLimits::default(),
        }
    }

    pub fn with_context(mut self, context: Arc<dyn UserContextLookup>) -> Self {
        self.context = context;
        self
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Fallback used whenever the cache misses.
    pub fn with_default_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_prompt = prompt.into();
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn prompt_cache(&self) -> &Arc<ExpiringValue<String>> {
        &self.prompt_cache
    }

    /// Answer `request` with one complete response.
    pub async fn chat(&self, request: ChatRequest) -> Result<String> {
        let span = request_span(&request, "single");
        async move {
            let prepared = self.prepare(&request).await?;
            let mut session = ChatSession::new(
                Arc::clone(&self.backend),
                Some(prepared.system_prompt),
                self.limits,
            );
            match session.ask_once(&prepared.prompt).await {
                Ok(answer) => {
                    info!(chars = answer.len(), "Chat answered");
                    Ok(answer)
                }
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, "Chat failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Answer `request` as a stream of events.
    ///
    /// Validation and composition errors are returned directly. Once the
    /// receiver is returned, the event sequence always ends with exactly one
    /// terminal event. Dropping the receiver cancels the backend request.
    pub async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let span = request_span(&request, "stream");
        let prepared = self.prepare(&request).instrument(span.clone()).await?;

        let mut session = ChatSession::new(
            Arc::clone(&self.backend),
            Some(prepared.system_prompt),
            self.limits,
        );
        let (tx, rx) = mpsc::channel(self.limits.stream_buffer.max(1));

        tokio::spawn(
            async move {
                let relay = StreamRelay::new();
                let opened = tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        debug!("Client left before the backend stream opened");
                        return;
                    }
                    opened = session.ask_streaming(&prepared.prompt) => opened,
                };
                let outcome = match opened {
                    Ok(fragments) => relay.run(fragments, tx).await,
                    Err(e) => relay.fail_before_start(e, tx).await,
                };
                info!(
                    state = ?outcome.state,
                    fragments = outcome.fragments,
                    bytes = outcome.bytes,
                    aborted = outcome.aborted,
                    "Stream finished"
                );
            }
            .instrument(span),
        );

        Ok(rx)
    }

    /// Replace the cached system prompt and reset its TTL.
    pub fn set_system_prompt(&self, prompt: &str) -> Result<()> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        self.prompt_cache.set_default_ttl(prompt.to_string());
        info!(
            chars = prompt.len(),
            ttl_secs = self.prompt_cache.ttl().as_secs(),
            "System prompt updated"
        );
        Ok(())
    }

    /// Drop the cached system prompt; requests fall back to the default.
    pub fn clear_system_prompt(&self) {
        self.prompt_cache.clear();
        info!("System prompt cleared");
    }

    pub fn system_prompt_status(&self) -> PromptStatus {
        let remaining = self.prompt_cache.remaining();
        let expires_at = remaining
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .and_then(|r| chrono::Utc::now().checked_add_signed(r))
            .map(|at| at.to_rfc3339());
        PromptStatus {
            cached: remaining.is_some(),
            expires_in_secs: remaining.map(|r| r.as_secs()),
            expires_at,
        }
    }

    /// System prompt for `request`: its override, else the cached prompt,
    /// else the default. A miss does not repopulate the cache.
    pub fn resolve_system_prompt(&self, request: &ChatRequest) -> String {
        if let Some(prompt) = request
            .system_prompt_override
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            return prompt.to_string();
        }
        match self.prompt_cache.get() {
            Some(prompt) => prompt,
            None => {
                debug!("System prompt cache miss, using default");
                self.default_prompt.clone()
            }
        }
    }

    async fn resolve_context(&self, request: &ChatRequest) -> Option<Value> {
        let user_id = request
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?;
        match self.context.fetch_user_context(user_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    source = self.context.name(),
                    error = %e,
                    "User context lookup failed; continuing without context"
                );
                None
            }
        }
    }

    async fn prepare(&self, request: &ChatRequest) -> Result<Prepared> {
        if request.message.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }

        let user_context = self.resolve_context(request).await;
        let system_prompt = self.resolve_system_prompt(request);
        let components = PromptComponents::new(request.message.as_str())
            .with_system_prompt(system_prompt.as_str())
            .with_user_context(user_context)
            .with_rag_docs(request.rag_docs.clone());
        let prompt = compose(&components)?;
        debug!(chars = prompt.len(), docs = request.rag_docs.len(), "Prompt composed");

        Ok(Prepared {
            prompt,
            system_prompt,
        })
    }
}

fn request_span(request: &ChatRequest, mode: &'static str) -> tracing::Span {
    info_span!(
        "chat",
        request_id = %uuid::Uuid::new_v4(),
        mode,
        user_id = request.user_id.as_deref().unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::context::DummyContextLookup;
    use crate::providers::ScriptedBackend;
    use async_trait::async_trait;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(300);

    fn setup(backend: ScriptedBackend) -> (Orchestrator, Arc<ScriptedBackend>, ManualClock) {
        let clock = ManualClock::new();
        let cache = Arc::new(ExpiringValue::with_clock(TTL, Arc::new(clock.clone())));
        let backend = Arc::new(backend);
        let orchestrator = Orchestrator::new(backend.clone(), cache)
            .with_default_prompt("DEFAULT PROMPT")
            .with_limits(SessionLimits {
                request_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(5),
                stream_buffer: 4,
            });
        (orchestrator, backend, clock)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    struct FailingLookup;

    #[async_trait]
    impl UserContextLookup for FailingLookup {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch_user_context(&self, _user_id: &str) -> Result<Option<Value>> {
            Err(GatewayError::Context("database down".into()))
        }
    }

    #[test]
    fn test_chat_request_accepts_both_casings() {
        let camel: ChatRequest =
            serde_json::from_str(r#"{"userId":"u1","message":"hi","ragDocs":["d"]}"#).unwrap();
        let snake: ChatRequest =
            serde_json::from_str(r#"{"user_id":"u1","message":"hi","rag_docs":["d"]}"#).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.rag_docs, vec!["d"]);
    }

    #[test]
    fn test_chat_request_null_rag_docs() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi","ragDocs":null}"#).unwrap();
        assert!(req.rag_docs.is_empty());
        assert!(req.user_id.is_none());
    }

    #[test]
    fn test_chat_request_ignores_override_field() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"message":"hi","systemPromptOverride":"evil"}"#).unwrap();
        assert!(req.system_prompt_override.is_none());
    }

    #[tokio::test]
    async fn test_chat_uses_cached_prompt_and_context() {
        let (orch, backend, _clock) = setup(ScriptedBackend::replying(&["fine"]));
        let orch = orch.with_context(Arc::new(DummyContextLookup));
        orch.set_system_prompt("P2").unwrap();

        let answer = orch
            .chat(
                ChatRequest::new("How am I doing?")
                    .with_user_id("7")
                    .with_rag_docs(vec!["Index funds are cheap.".into()]),
            )
            .await
            .unwrap();
        assert_eq!(answer, "fine");

        let prompt = backend.last_prompt().unwrap();
        assert!(prompt.starts_with("SYSTEM INSTRUCTION:\nP2\n"));
        assert!(prompt.contains("\"name\":\"DUMMY_7\""));
        assert!(prompt.contains("[DOC 1]: Index funds are cheap."));
        assert!(prompt.ends_with("USER: How am I doing?\n\nASSISTANT:"));

        let conversation = backend.conversations().pop().unwrap();
        assert_eq!(conversation.system_instruction.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn test_expired_prompt_falls_back_to_default_without_repopulating() {
        let (orch, backend, clock) = setup(ScriptedBackend::replying(&["ok"]));
        orch.set_system_prompt("P2").unwrap();
        clock.advance(TTL + Duration::from_secs(1));

        orch.chat(ChatRequest::new("hi")).await.unwrap();
        assert!(backend.last_prompt().unwrap().contains("DEFAULT PROMPT"));
        assert!(orch.prompt_cache().get().is_none());
        assert!(!orch.system_prompt_status().cached);
    }

    #[tokio::test]
    async fn test_override_wins_over_cache() {
        let (orch, backend, _clock) = setup(ScriptedBackend::replying(&["ok"]));
        orch.set_system_prompt("cached").unwrap();
        orch.chat(ChatRequest::new("hi").with_system_prompt_override("override"))
            .await
            .unwrap();
        let prompt = backend.last_prompt().unwrap();
        assert!(prompt.contains("override"));
        assert!(!prompt.contains("cached"));
    }

    #[tokio::test]
    async fn test_empty_message_never_reaches_backend() {
        let (orch, backend, _clock) = setup(ScriptedBackend::replying(&["ok"]));
        let err = orch.chat(ChatRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        let err = orch.stream_chat(ChatRequest::new("")).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(backend.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_context_failure_degrades_to_absent() {
        let (orch, backend, _clock) = setup(ScriptedBackend::replying(&["ok"]));
        let orch = orch.with_context(Arc::new(FailingLookup));
        orch.chat(ChatRequest::new("hi").with_user_id("u1"))
            .await
            .unwrap();
        assert!(!backend.last_prompt().unwrap().contains("USER CONTEXT"));
    }

    #[tokio::test]
    async fn test_chat_surfaces_backend_rejection() {
        let (orch, _backend, _clock) = setup(ScriptedBackend::rejecting("prompt too long"));
        let err = orch.chat(ChatRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendRejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_stream_chat_relays_fragments_then_done() {
        let (orch, _backend, _clock) = setup(ScriptedBackend::replying(&["a", "b", "c"]));
        let events = collect(orch.stream_chat(ChatRequest::new("go")).await.unwrap()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::DataChunk("a".into()),
                StreamEvent::DataChunk("b".into()),
                StreamEvent::DataChunk("c".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_chat_open_failure_is_error_event() {
        let (orch, _backend, _clock) = setup(ScriptedBackend::unavailable("connection refused"));
        let events = collect(orch.stream_chat(ChatRequest::new("go")).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(msg) => assert!(msg.contains("connection refused")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_chat_midstream_failure() {
        let (orch, _backend, _clock) = setup(ScriptedBackend::failing_after(&["a"], "reset"));
        let events = collect(orch.stream_chat(ChatRequest::new("go")).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::DataChunk("a".into()));
        assert!(matches!(events[1], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_dropping_receiver_cancels_backend_stream() {
        let (orch, backend, _clock) = setup(ScriptedBackend::hanging_after(&["a"]));
        let mut rx = orch.stream_chat(ChatRequest::new("go")).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::DataChunk("a".into())));
        drop(rx);

        for _ in 0..100 {
            if backend.dropped_streams() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.dropped_streams(), 1);
    }

    #[test]
    fn test_set_system_prompt_rejects_blank() {
        let (orch, _backend, _clock) = setup(ScriptedBackend::replying(&[]));
        assert!(matches!(
            orch.set_system_prompt(" \n "),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(!orch.system_prompt_status().cached);
    }

    #[test]
    fn test_prompt_status_and_clear() {
        let (orch, _backend, clock) = setup(ScriptedBackend::replying(&[]));
        orch.set_system_prompt("  P3  ").unwrap();
        assert_eq!(orch.prompt_cache().get().as_deref(), Some("P3"));

        clock.advance(Duration::from_secs(100));
        let status = orch.system_prompt_status();
        assert!(status.cached);
        assert_eq!(status.expires_in_secs, Some(200));
        assert!(status.expires_at.is_some());

        orch.clear_system_prompt();
        assert_eq!(
            orch.system_prompt_status(),
            PromptStatus {
                cached: false,
                expires_in_secs: None,
                expires_at: None,
            }
        );
    }

    #[test]
    fn test_prompt_status_with_huge_ttl() {
        let cache = Arc::new(ExpiringValue::new(Duration::from_secs(u64::MAX)));
        let orch = Orchestrator::new(Arc::new(ScriptedBackend::replying(&[])), cache);
        orch.set_system_prompt("P").unwrap();
        let status = orch.system_prompt_status();
        assert!(status.cached);
        assert!(status.expires_in_secs.unwrap() > 365 * 24 * 60 * 60);
        assert!(status.expires_at.is_some());
    }
}
