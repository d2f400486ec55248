//! Autoregressive token generation
//!
//! Greedy decoding unless sampling is switched on, in which case logits are
//! temperature-scaled, restricted to the nucleus and drawn from a seeded RNG.
//! A repetition penalty is applied over the whole sequence, prompt included.

use crate::model::LanguageModel;
use chatgate_common::config::GenerationConfig;
use chatgate_common::error::{ChatGateError, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use tracing::trace;

/// Extend `prompt_ids` with up to `max_new_tokens` generated tokens
///
/// Returns the full sequence (prompt followed by the continuation). Stops early
/// once the end-of-sequence token is produced; that token is kept.
pub fn generate(
    model: &dyn LanguageModel,
    prompt_ids: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut tokens = Vec::with_capacity(prompt_ids.len() + config.max_new_tokens);
    tokens.extend_from_slice(prompt_ids);

    for step in 0..config.max_new_tokens {
        let mut logits = model.next_token_logits(&tokens)?;
        apply_repetition_penalty(&mut logits, &tokens, config.repetition_penalty);

        let next = if config.do_sample {
            sample_nucleus(&logits, config.temperature, config.top_p, &mut rng)?
        } else {
            argmax(&logits)?
        };

        trace!("Step {}: token {}", step, next);
        tokens.push(next);

        if config.eos_token_id == Some(next) {
            break;
        }
    }

    Ok(tokens)
}

/// Make tokens already present in the sequence less likely
///
/// Positive logits are divided by the penalty and negative ones multiplied,
/// once per distinct token.
pub fn apply_repetition_penalty(logits: &mut [f32], tokens: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }

    let mut seen = tokens.to_vec();
    seen.sort_unstable();
    seen.dedup();

    for id in seen {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = if *logit < 0.0 { *logit * penalty } else { *logit / penalty };
        }
    }
}

/// Index of the largest logit (first one on ties)
pub fn argmax(logits: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in logits.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((index, value)),
        }
    }

    best.map(|(index, _)| index as u32)
        .ok_or_else(|| ChatGateError::inference("model produced no usable logits"))
}

/// Softmax over `logits / temperature`
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);

    let exp: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_nan() { 0.0 } else { ((v - max) / temperature).exp() })
        .collect();
    let sum: f32 = exp.iter().sum();

    exp.into_iter().map(|v| v / sum).collect()
}

/// Smallest set of token indices, most probable first, whose mass reaches `top_p`
///
/// Always keeps at least one token.
pub fn nucleus(probs: &[f32], top_p: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    let mut kept = Vec::new();
    let mut cumulative = 0.0f32;
    for index in order {
        if cumulative >= top_p && !kept.is_empty() {
            break;
        }
        cumulative += probs[index];
        kept.push(index);
    }
    kept
}

/// Temperature + top-p sampling
pub fn sample_nucleus<R: Rng>(logits: &[f32], temperature: f32, top_p: f32, rng: &mut R) -> Result<u32> {
    let probs = softmax(logits, temperature);
    let candidates = nucleus(&probs, top_p);

    let weights = WeightedIndex::new(candidates.iter().map(|&index| probs[index]))
        .map_err(|e| ChatGateError::inference(format!("Cannot sample from logits: {}", e)))?;

    Ok(candidates[weights.sample(rng)] as u32)
}
