//! Composite prompt assembly.
//!
//! Blocks appear in a fixed order, each under a labelled header so the model
//! can tell instruction from user content:
//!
//! ```text
//! SYSTEM INSTRUCTION:
//! <system prompt>
//!
//!
//! USER CONTEXT (JSON):
//! <compact json>
//!
//!
//! RETRIEVED_REFERENCES:
//! [DOC 1]: <snippet>
//!
//!
//! USER: <message>
//!
//! ASSISTANT:
//! ```
//!
//! Absent components drop their whole block, header included. The output
//! depends only on the input.

use serde_json::Value;

use crate::error::{GatewayError, Result};

const SYSTEM_HEADER: &str = "SYSTEM INSTRUCTION:";
const CONTEXT_HEADER: &str = "USER CONTEXT (JSON):";
const REFERENCES_HEADER: &str = "RETRIEVED_REFERENCES:";

/// The four inputs of a composite prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptComponents {
    pub system_prompt: String,
    pub user_context: Option<Value>,
    pub rag_docs: Vec<String>,
    pub user_message: String,
}

impl PromptComponents {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_user_context(mut self, user_context: Option<Value>) -> Self {
        self.user_context = user_context;
        self
    }

    pub fn with_rag_docs(mut self, rag_docs: Vec<String>) -> Self {
        self.rag_docs = rag_docs;
        self
    }
}

/// Flattened prompt text sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositePrompt(String);

impl CompositePrompt {
    /// Wrap already-composed text.
    pub fn from_raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CompositePrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render the user context block body, or `None` when there is nothing to say.
fn render_context(context: Option<&Value>) -> Option<String> {
    let context = context?;
    let empty = match context {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    };
    if empty {
        return None;
    }
    // Object keys serialize in sorted order, so equal contexts render equally.
    Some(context.to_string())
}

/// Build the composite prompt from its components.
///
/// Fails only when the user message is empty after trimming.
pub fn compose(components: &PromptComponents) -> Result<CompositePrompt> {
    let message = components.user_message.trim();
    if message.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }

    let mut parts: Vec<String> = Vec::with_capacity(4);

    let system = components.system_prompt.trim();
    if !system.is_empty() {
        parts.push(format!("{SYSTEM_HEADER}\n{system}\n\n"));
    }

    if let Some(ctx) = render_context(components.user_context.as_ref()) {
        parts.push(format!("{CONTEXT_HEADER}\n{ctx}\n\n"));
    }

    let docs: Vec<String> = components
        .rag_docs
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .enumerate()
        .map(|(i, d)| format!("[DOC {}]: {}", i + 1, d))
        .collect();
    if !docs.is_empty() {
        parts.push(format!("{REFERENCES_HEADER}\n{}\n\n", docs.join("\n")));
    }

    parts.push(format!("USER: {message}\n\nASSISTANT:"));

    Ok(CompositePrompt(parts.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full() -> PromptComponents {
        PromptComponents::new("How am I doing?")
            .with_system_prompt("Be helpful.")
            .with_user_context(Some(json!({ "name": "Asha", "age": 31 })))
            .with_rag_docs(vec!["Doc one.".into(), "Doc two.".into()])
    }

    #[test]
    fn test_full_layout_is_exact() {
        let prompt = compose(&full()).unwrap();
        let expected = "SYSTEM INSTRUCTION:\nBe helpful.\n\n\n\
                        USER CONTEXT (JSON):\n{\"age\":31,\"name\":\"Asha\"}\n\n\n\
                        RETRIEVED_REFERENCES:\n[DOC 1]: Doc one.\n[DOC 2]: Doc two.\n\n\n\
                        USER: How am I doing?\n\nASSISTANT:";
        assert_eq!(prompt.as_str(), expected);
    }

    #[test]
    fn test_compose_is_deterministic() {
        let a = compose(&full()).unwrap();
        let b = compose(&full()).unwrap();
        assert_eq!(a.as_str().as_bytes(), b.as_str().as_bytes());
    }

    #[test]
    fn test_context_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        let pa = compose(&PromptComponents::new("m").with_user_context(Some(a))).unwrap();
        let pb = compose(&PromptComponents::new("m").with_user_context(Some(b))).unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_absent_context_omits_header() {
        let prompt = compose(&full().with_user_context(None)).unwrap();
        assert!(!prompt.as_str().contains(CONTEXT_HEADER));
    }

    #[test]
    fn test_empty_context_values_omit_header() {
        for ctx in [json!(null), json!({}), json!([]), json!("  ")] {
            let prompt = compose(&full().with_user_context(Some(ctx))).unwrap();
            assert!(!prompt.as_str().contains(CONTEXT_HEADER));
        }
    }

    #[test]
    fn test_empty_rag_docs_omit_header() {
        let prompt = compose(&full().with_rag_docs(vec![])).unwrap();
        assert!(!prompt.as_str().contains(REFERENCES_HEADER));
    }

    #[test]
    fn test_blank_rag_docs_are_skipped_and_numbering_stays_contiguous() {
        let prompt = compose(&full().with_rag_docs(vec![
            "  ".into(),
            " first ".into(),
            "".into(),
            "second".into(),
        ]))
        .unwrap();
        assert!(prompt.as_str().contains("[DOC 1]: first\n[DOC 2]: second"));
        assert!(!prompt.as_str().contains("[DOC 3]"));
    }

    #[test]
    fn test_only_blank_rag_docs_omit_header() {
        let prompt = compose(&full().with_rag_docs(vec![" ".into()])).unwrap();
        assert!(!prompt.as_str().contains(REFERENCES_HEADER));
    }

    #[test]
    fn test_empty_system_prompt_omits_block() {
        let prompt = compose(&PromptComponents::new("hello")).unwrap();
        assert_eq!(prompt.as_str(), "USER: hello\n\nASSISTANT:");
    }

    #[test]
    fn test_message_is_trimmed() {
        let prompt = compose(&PromptComponents::new("  hi there \n")).unwrap();
        assert!(prompt.as_str().starts_with("USER: hi there\n"));
    }

    #[test]
    fn test_empty_message_is_rejected() {
        for msg in ["", "   ", "\n\t"] {
            let components = PromptComponents {
                user_message: msg.to_string(),
                ..full()
            };
            let err = compose(&components).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidRequest(_)));
        }
    }

    #[test]
    fn test_non_ascii_context_is_not_escaped() {
        let prompt = compose(
            &PromptComponents::new("m").with_user_context(Some(json!({ "balance": "₹29,728" }))),
        )
        .unwrap();
        assert!(prompt.as_str().contains("₹29,728"));
    }
}
