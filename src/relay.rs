//! Backend fragment stream → client event stream.
//!
//! A [`StreamRelay`] moves through `Idle → Streaming → {Completed, Failed}`.
//! Each fragment becomes one [`StreamEvent::DataChunk`], in receipt order.
//! Exactly one terminal event follows: [`StreamEvent::Done`] when the
//! producer is exhausted, [`StreamEvent::Error`] when it fails. Nothing is
//! emitted after a terminal event.
//!
//! When the event consumer disconnects, the relay stops reading and drops the
//! producer, which cancels the upstream request.

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Payload of the `data:` line that closes a successful stream.
pub const DONE_SENTINEL: &str = "<EOF>";

/// Client-facing stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    DataChunk(String),
    Done,
    Error(String),
}

impl StreamEvent {
    /// Returns true for `Done` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Encode as a `text/event-stream` frame.
    ///
    /// Multi-line payloads are split over consecutive `data:` lines, which
    /// SSE clients rejoin with `\n`. SSE cannot carry a carriage return
    /// inside a field, so `\r\n` and a lone `\r` both arrive as `\n`; every
    /// other character is relayed unchanged.
    pub fn to_sse(&self) -> String {
        match self {
            Self::DataChunk(text) => data_lines(text),
            Self::Done => format!("event: done\ndata: {DONE_SENTINEL}\n\n"),
            Self::Error(message) => format!("event: error\n{}", data_lines(message)),
        }
    }
}

fn data_lines(payload: &str) -> String {
    let mut frame = String::with_capacity(payload.len() + 8);
    let lines = payload
        .split("\r\n")
        .flat_map(|line| line.split(['\n', '\r']));
    for line in lines {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Relay lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Streaming,
    Completed,
    Failed,
}

/// Summary of a finished relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub state: RelayState,
    /// Number of `DataChunk` events delivered.
    pub fragments: usize,
    /// Total fragment bytes delivered.
    pub bytes: usize,
    /// Cause reported in the `Error` event, if any.
    pub error: Option<String>,
    /// The consumer went away before the terminal event.
    pub aborted: bool,
}

/// Single-use relay from a fragment producer to an event channel.
#[derive(Debug)]
pub struct StreamRelay {
    state: RelayState,
    fragments: usize,
    bytes: usize,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRelay {
    pub fn new() -> Self {
        Self {
            state: RelayState::Idle,
            fragments: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive `fragments` to completion, emitting events on `events`.
    pub async fn run<S>(mut self, mut fragments: S, events: mpsc::Sender<StreamEvent>) -> RelayOutcome
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        self.state = RelayState::Streaming;

        loop {
            let next = tokio::select! {
                biased;
                _ = events.closed() => {
                    drop(fragments);
                    return self.abort();
                }
                next = fragments.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    let len = fragment.len();
                    if events.send(StreamEvent::DataChunk(fragment)).await.is_err() {
                        drop(fragments);
                        return self.abort();
                    }
                    self.fragments += 1;
                    self.bytes += len;
                }
                Some(Err(e)) => {
                    drop(fragments);
                    return self.fail(e, &events).await;
                }
                None => {
                    self.state = RelayState::Completed;
                    let aborted = events.send(StreamEvent::Done).await.is_err();
                    debug!(fragments = self.fragments, bytes = self.bytes, "Stream completed");
                    return self.outcome(None, aborted);
                }
            }
        }
    }

    /// Terminate a stream that never started: emit a lone `Error` event.
    pub async fn fail_before_start(
        mut self,
        error: GatewayError,
        events: mpsc::Sender<StreamEvent>,
    ) -> RelayOutcome {
        self.state = RelayState::Streaming;
        self.fail(error, &events).await
    }

    async fn fail(mut self, error: GatewayError, events: &mpsc::Sender<StreamEvent>) -> RelayOutcome {
        self.state = RelayState::Failed;
        let message = error.to_string();
        warn!(
            kind = error.kind(),
            retryable = error.is_retryable(),
            fragments = self.fragments,
            error = %message,
            "Stream failed"
        );
        let aborted = events
            .send(StreamEvent::Error(message.clone()))
            .await
            .is_err();
        self.outcome(Some(message), aborted)
    }

    fn abort(mut self) -> RelayOutcome {
        self.state = RelayState::Failed;
        let cause = GatewayError::StreamAborted("client disconnected".to_string());
        warn!(fragments = self.fragments, error = %cause, "Stream abandoned by client");
        self.outcome(None, true)
    }

    fn outcome(self, error: Option<String>, aborted: bool) -> RelayOutcome {
        RelayOutcome {
            state: self.state,
            fragments: self.fragments,
            bytes: self.bytes,
            error,
            aborted,
        }
    }
}
