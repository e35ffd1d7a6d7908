//! LLM backend abstraction.
//!
//! The gateway treats the model as an opaque capability: it accepts a
//! [`Conversation`] and either returns one complete answer or yields an
//! ordered, finite sequence of text fragments.

pub mod gemini;
pub mod scripted;
pub mod sse;

pub use gemini::GeminiBackend;
pub use scripted::ScriptedBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::session::Conversation;

/// Forward-only producer of text fragments from a backend.
///
/// Dropping the stream must release every backend-side resource, including
/// the underlying HTTP connection.
pub type FragmentSource = BoxStream<'static, Result<String>>;

/// Generation knobs forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// An LLM backend capable of single-shot and streaming generation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short identifier used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// Model the backend submits to.
    fn model(&self) -> &str;

    /// Submit the conversation and wait for the complete answer.
    async fn complete(&self, conversation: &Conversation) -> Result<String>;

    /// Submit the conversation and return its fragment producer.
    ///
    /// Returns once the backend has accepted the request; fragments are
    /// delivered lazily by the returned stream.
    async fn stream(&self, conversation: &Conversation) -> Result<FragmentSource>;
}
