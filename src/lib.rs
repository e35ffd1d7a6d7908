//! Chatgate - a streaming chat gateway.
//!
//! Each request is turned into one composite prompt built from a cached
//! system prompt, the caller's user context, retrieved reference snippets and
//! the user's message. The prompt is sent to an LLM backend and the answer is
//! returned whole or relayed fragment by fragment as server-sent events.
//!
//! The main pieces, leaves first:
//!
//! - [`cache::ExpiringValue`] holds the system prompt with a TTL.
//! - [`prompt::compose`] flattens the prompt components deterministically.
//! - [`session::ChatSession`] owns one conversation with a [`providers::ChatBackend`].
//! - [`relay::StreamRelay`] turns backend fragments into [`relay::StreamEvent`]s.
//! - [`orchestrator::Orchestrator`] wires them together per request.

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod relay;
pub mod session;

pub use cache::{ExpiringValue, ManualClock};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use orchestrator::{ChatRequest, Orchestrator};
pub use prompt::{compose, CompositePrompt, PromptComponents};
pub use providers::{ChatBackend, GeminiBackend, ScriptedBackend};
pub use relay::{StreamEvent, StreamRelay};
pub use session::{ChatSession, SessionLimits};
