//! One end-to-end generation: encode, generate, decode, strip the prompt
//!
//! Everything here is synchronous and CPU bound; callers run it on the
//! blocking pool.

use crate::generation::generate;
use crate::loader::InferenceResource;
use chatgate_common::config::GenerationConfig;
use chatgate_common::error::{ChatGateError, Result};
use std::time::Instant;
use tracing::debug;

/// Reply text plus token accounting for one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Generate a continuation of `prompt` and return only the new text
///
/// Prompts longer than the context window minus `max_new_tokens` are truncated,
/// keeping the leading tokens.
pub fn run(resource: &InferenceResource, config: &GenerationConfig, prompt: &str) -> Result<GenerationResult> {
    let start = Instant::now();

    let mut prompt_ids = resource.tokenizer.encode(prompt)?;
    if prompt_ids.is_empty() {
        return Err(ChatGateError::inference("prompt encoded to zero tokens"));
    }

    let budget = resource
        .model
        .context_length()
        .checked_sub(config.max_new_tokens)
        .filter(|&budget| budget > 0)
        .ok_or_else(|| {
            ChatGateError::inference(format!(
                "max_new_tokens {} leaves no room in a context of {}",
                config.max_new_tokens,
                resource.model.context_length()
            ))
        })?;

    if prompt_ids.len() > budget {
        debug!("Truncating prompt from {} to {} tokens", prompt_ids.len(), budget);
        prompt_ids.truncate(budget);
    }
    let prompt_tokens = prompt_ids.len();

    let output_ids = generate(resource.model.as_ref(), &prompt_ids, config)?;
    let completion_tokens = output_ids.len() - prompt_tokens;

    let decoded = resource.tokenizer.decode(&output_ids, true)?;
    let text = strip_prompt(&decoded, prompt).to_string();

    debug!(
        "Generated {} tokens from a {} token prompt in {:?}",
        completion_tokens,
        prompt_tokens,
        start.elapsed()
    );

    Ok(GenerationResult {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

/// Text following the last occurrence of `prompt` in `decoded`, trimmed
///
/// Occurrences are found left to right without overlapping, so a reply that
/// repeats part of the prompt keeps that part. When the prompt does not
/// survive decoding verbatim the whole text is kept.
pub fn strip_prompt<'a>(decoded: &'a str, prompt: &str) -> &'a str {
    if prompt.is_empty() {
        return decoded.trim();
    }

    decoded.split(prompt).last().unwrap_or(decoded).trim()
}
