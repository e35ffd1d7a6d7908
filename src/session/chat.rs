//! One logical conversation with the backend.
//!
//! Creating a [`ChatSession`] performs no I/O. Only [`ChatSession::ask_once`]
//! and [`ChatSession::ask_streaming`] contact the backend.
//!
//! Streaming runs the backend's fragment producer in a pump task that writes
//! into a bounded channel. The consumer side, [`FragmentStream`], owns a
//! cancellation guard: dropping it stops the pump, which drops the producer
//! and with it the upstream request.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::prompt::CompositePrompt;
use crate::providers::{ChatBackend, FragmentSource};
use crate::session::{Conversation, Message};

/// Deadlines and buffering applied to backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Deadline for a complete answer, or for the backend to accept a stream.
    pub request_timeout: Duration,
    /// Longest gap allowed between two streamed fragments.
    pub idle_timeout: Duration,
    /// Capacity of the fragment channel between pump and consumer.
    pub stream_buffer: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(60),
            stream_buffer: 32,
        }
    }
}

/// Owns one conversation with the backend.
pub struct ChatSession {
    id: String,
    backend: Arc<dyn ChatBackend>,
    conversation: Conversation,
    limits: SessionLimits,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("turns", &self.conversation.len())
            .finish()
    }
}

impl ChatSession {
    /// Prepare a session. Does not contact the backend.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        system_instruction: Option<String>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backend,
            conversation: Conversation::new(system_instruction),
            limits,
        }
    }

    /// Opaque handle identifying this conversation.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Submit `prompt` and wait for the complete answer.
    ///
    /// Both turns are appended to the conversation on success.
    pub async fn ask_once(&mut self, prompt: &CompositePrompt) -> Result<String> {
        self.conversation.push(Message::user(prompt.as_str()));

        let answer = tokio::time::timeout(
            self.limits.request_timeout,
            self.backend.complete(&self.conversation),
        )
        .await
        .map_err(|_| {
            GatewayError::BackendUnavailable(format!(
                "no answer within {}s",
                self.limits.request_timeout.as_secs()
            ))
        });

        match answer.and_then(|r| r) {
            Ok(answer) => {
                info!(session = %self.id, chars = answer.len(), "Backend answered");
                self.conversation.push(Message::assistant(answer.as_str()));
                Ok(answer)
            }
            Err(e) => {
                // Keep history consistent: an unanswered turn is not history.
                self.conversation.messages.pop();
                Err(e)
            }
        }
    }

    /// Submit `prompt` and return its fragments as they arrive.
    ///
    /// The returned stream is finite and forward-only. Dropping it before
    /// exhaustion cancels the upstream request.
    pub async fn ask_streaming(&mut self, prompt: &CompositePrompt) -> Result<FragmentStream> {
        self.conversation.push(Message::user(prompt.as_str()));

        let opened = tokio::time::timeout(
            self.limits.request_timeout,
            self.backend.stream(&self.conversation),
        )
        .await
        .map_err(|_| {
            GatewayError::BackendUnavailable(format!(
                "backend did not start streaming within {}s",
                self.limits.request_timeout.as_secs()
            ))
        });

        let source = match opened.and_then(|r| r) {
            Ok(source) => source,
            Err(e) => {
                self.conversation.messages.pop();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.limits.stream_buffer.max(1));
        let token = CancellationToken::new();
        tokio::spawn(pump(
            source,
            tx,
            token.clone(),
            self.limits.idle_timeout,
            self.id.clone(),
        ));

        Ok(FragmentStream {
            rx,
            _cancel: token.drop_guard(),
        })
    }
}

/// Move fragments from the backend producer into the channel until the
/// producer ends, fails, idles out, or the consumer goes away.
async fn pump(
    mut source: FragmentSource,
    tx: mpsc::Sender<Result<String>>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    session_id: String,
) {
    let mut forwarded = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tx.closed() => None,
            next = tokio::time::timeout(idle_timeout, source.next()) => Some(next),
        };

        let Some(next) = next else {
            debug!(session = %session_id, forwarded, "Fragment consumer gone, cancelling upstream");
            break;
        };

        match next {
            Ok(Some(Ok(fragment))) => {
                if tx.send(Ok(fragment)).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
            Ok(None) => {
                debug!(session = %session_id, forwarded, "Backend stream exhausted");
                break;
            }
            Err(_) => {
                let err = GatewayError::BackendUnavailable(format!(
                    "no fragment received within {}s",
                    idle_timeout.as_secs()
                ));
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
    // Dropping the source here releases the upstream connection.
    drop(source);
}

/// Consumer half of a streaming answer.
///
/// Yields fragments in backend order; an `Err` item is always the last one.
pub struct FragmentStream {
    rx: mpsc::Receiver<Result<String>>,
    _cancel: DropGuard,
}

impl FragmentStream {
    /// Abandon the stream and cancel the upstream request.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Stream for FragmentStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
