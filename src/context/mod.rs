//! User context collaborators.
//!
//! A [`UserContextLookup`] resolves a user id to a JSON context blob. An
//! absent blob is a normal outcome; the prompt simply omits its context
//! block.

pub mod http;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{ContextConfig, ContextSource};
use crate::error::{GatewayError, Result};

pub use http::HttpContextLookup;

/// Source of per-user context blobs.
#[async_trait]
pub trait UserContextLookup: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Fetch the context for `user_id`, or `None` when the user has none.
    async fn fetch_user_context(&self, user_id: &str) -> Result<Option<Value>>;
}

/// Lookup that never has context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

#[async_trait]
impl UserContextLookup for NoContext {
    fn name(&self) -> &str {
        "none"
    }

    async fn fetch_user_context(&self, _user_id: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Demo lookup that synthesises a small account summary for any user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyContextLookup;

#[async_trait]
impl UserContextLookup for DummyContextLookup {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn fetch_user_context(&self, user_id: &str) -> Result<Option<Value>> {
        Ok(Some(json!({
            "user_id": user_id,
            "name": format!("DUMMY_{user_id}"),
            "account_summary": {
                "acc1_latest_balance": 29728.6,
                "acc2_latest_balance": 318866,
            },
            "preferences": { "risk_profile": "moderate" },
        })))
    }
}

/// In-memory map of user id to context, usually loaded from a JSON file of
/// the form `{ "<user_id>": { ... }, ... }`.
#[derive(Debug, Clone, Default)]
pub struct StaticContextStore {
    contexts: HashMap<String, Value>,
}

impl StaticContextStore {
    pub fn from_map(contexts: HashMap<String, Value>) -> Self {
        Self { contexts }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let contexts: HashMap<String, Value> = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Config(format!(
                "user context file {} is not a JSON object of contexts: {e}",
                path.display()
            ))
        })?;
        Ok(Self { contexts })
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[async_trait]
impl UserContextLookup for StaticContextStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch_user_context(&self, user_id: &str) -> Result<Option<Value>> {
        Ok(self.contexts.get(user_id).cloned())
    }
}

/// Build the lookup selected by `config`.
pub fn from_config(config: &ContextConfig) -> Result<Arc<dyn UserContextLookup>> {
    let lookup: Arc<dyn UserContextLookup> = match config.source {
        ContextSource::None => Arc::new(NoContext),
        ContextSource::Dummy => Arc::new(DummyContextLookup),
        ContextSource::File => {
            let path = config.path.as_deref().ok_or_else(|| {
                GatewayError::Config("context.path is required for the file source".into())
            })?;
            Arc::new(StaticContextStore::from_file(path)?)
        }
        ContextSource::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                GatewayError::Config("context.url is required for the http source".into())
            })?;
            Arc::new(HttpContextLookup::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?)
        }
    };
    Ok(lookup)
}
