//! `chatgate compose` - render a composite prompt offline.

use anyhow::{Context, Result};
use serde_json::Value;

use chatgate::prompt::{compose, PromptComponents, DEFAULT_SYSTEM_PROMPT};

pub(crate) fn cmd_compose(
    message: String,
    context_json: Option<String>,
    docs: Vec<String>,
    system: Option<String>,
) -> Result<()> {
    let prompt = render(message, context_json, docs, system)?;
    println!("{prompt}");
    Ok(())
}

fn render(
    message: String,
    context_json: Option<String>,
    docs: Vec<String>,
    system: Option<String>,
) -> Result<String> {
    let user_context = context_json
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("--context-json is not valid JSON")?;

    let components = PromptComponents::new(message)
        .with_system_prompt(system.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()))
        .with_user_context(user_context)
        .with_rag_docs(docs);
    Ok(compose(&components)?.into_string())
}
