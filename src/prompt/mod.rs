//! System prompt handling and prompt composition.

pub mod composer;
pub mod watcher;

pub use composer::{compose, CompositePrompt, PromptComponents};
pub use watcher::SystemPromptWatcher;

/// System prompt used whenever the cache holds no live value.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("default_system_prompt.md");
