//! Deterministic in-process backend.
//!
//! Replays a fixed list of fragments and then ends, fails, or hangs. Every
//! conversation it receives is recorded, and dropped fragment streams are
//! counted so callers can assert that cancellation reached the backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{GatewayError, Result};
use crate::session::Conversation;

use super::{ChatBackend, FragmentSource};

/// How the scripted stream ends after its fragments.
#[derive(Debug, Clone)]
enum Ending {
    Complete,
    Unavailable(String),
    Hang,
}

/// Backend that replays a script instead of calling a model.
#[derive(Debug)]
pub struct ScriptedBackend {
    fragments: Vec<String>,
    ending: Ending,
    refusal: Option<Refusal>,
    conversations: Mutex<Vec<Conversation>>,
    dropped_streams: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
enum Refusal {
    Unavailable(String),
    Rejected(String),
}

impl Refusal {
    fn to_error(&self) -> GatewayError {
        match self {
            Self::Unavailable(msg) => GatewayError::BackendUnavailable(msg.clone()),
            Self::Rejected(msg) => GatewayError::BackendRejected(msg.clone()),
        }
    }
}

impl ScriptedBackend {
    fn with(fragments: &[&str], ending: Ending, refusal: Option<Refusal>) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ending,
            refusal,
            conversations: Mutex::new(Vec::new()),
            dropped_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Yield `fragments` and finish normally. `complete` returns them joined.
    pub fn replying(fragments: &[&str]) -> Self {
        Self::with(fragments, Ending::Complete, None)
    }

    /// Yield `fragments`, then fail with `BackendUnavailable(message)`.
    pub fn failing_after(fragments: &[&str], message: &str) -> Self {
        Self::with(fragments, Ending::Unavailable(message.to_string()), None)
    }

    /// Yield `fragments`, then never produce another item.
    pub fn hanging_after(fragments: &[&str]) -> Self {
        Self::with(fragments, Ending::Hang, None)
    }

    /// Refuse every submission with `BackendUnavailable(message)`.
    pub fn unavailable(message: &str) -> Self {
        Self::with(
            &[],
            Ending::Complete,
            Some(Refusal::Unavailable(message.to_string())),
        )
    }

    /// Refuse every submission with `BackendRejected(message)`.
    pub fn rejecting(message: &str) -> Self {
        Self::with(
            &[],
            Ending::Complete,
            Some(Refusal::Rejected(message.to_string())),
        )
    }

    /// Conversations submitted so far, oldest first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The most recent user turn submitted to the backend.
    pub fn last_prompt(&self) -> Option<String> {
        self.conversations()
            .last()
            .and_then(|c| c.last_user_message().map(str::to_string))
    }

    /// Number of fragment streams that have been dropped.
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    fn record(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conversation.clone());
        match &self.refusal {
            Some(refusal) => Err(refusal.to_error()),
            None => Ok(()),
        }
    }
}

/// Increments the shared counter when the fragment stream is dropped.
struct DropSignal(Arc<AtomicUsize>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String> {
        self.record(conversation)?;
        match &self.ending {
            Ending::Unavailable(msg) => Err(GatewayError::BackendUnavailable(msg.clone())),
            _ => Ok(self.fragments.concat()),
        }
    }

    async fn stream(&self, conversation: &Conversation) -> Result<FragmentSource> {
        self.record(conversation)?;

        let head = stream::iter(self.fragments.clone().into_iter().map(Ok));
        let tail = match self.ending.clone() {
            Ending::Complete => stream::empty::<Result<String>>().boxed(),
            Ending::Unavailable(msg) => {
                stream::once(async move { Err(GatewayError::BackendUnavailable(msg)) }).boxed()
            }
            Ending::Hang => stream::pending::<Result<String>>().boxed(),
        };

        let signal = DropSignal(Arc::clone(&self.dropped_streams));
        Ok(head
            .chain(tail)
            .map(move |item| {
                let _held = &signal;
                item
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(source: FragmentSource) -> Vec<Result<String>> {
        source.collect().await
    }

    #[tokio::test]
    async fn test_replying_streams_fragments_in_order() {
        let backend = ScriptedBackend::replying(&["a", "b", "c"]);
        let items = drain(backend.stream(&Conversation::new(None)).await.unwrap()).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_complete_joins_fragments() {
        let backend = ScriptedBackend::replying(&["Hello, ", "world"]);
        let answer = backend.complete(&Conversation::new(None)).await.unwrap();
        assert_eq!(answer, "Hello, world");
    }

    #[tokio::test]
    async fn test_failing_after_ends_with_error() {
        let backend = ScriptedBackend::failing_after(&["a"], "disconnect");
        let items = drain(backend.stream(&Conversation::new(None)).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(GatewayError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejecting_refuses_submission() {
        let backend = ScriptedBackend::rejecting("too long");
        let err = backend.complete(&Conversation::new(None)).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendRejected(_)));
        assert_eq!(backend.conversations().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_is_counted() {
        let backend = ScriptedBackend::hanging_after(&["a"]);
        let mut source = backend.stream(&Conversation::new(None)).await.unwrap();
        assert_eq!(source.next().await.unwrap().unwrap(), "a");
        assert_eq!(backend.dropped_streams(), 0);
        drop(source);
        assert_eq!(backend.dropped_streams(), 1);
    }
}
