//! Deterministic stand-ins for the tokenizer, model and resource source
//!
//! Enabled for this crate's tests and, through the `test-util` feature, for
//! downstream crates that need a working pipeline without model artifacts.

use crate::loader::{InferenceResource, ResourceSource};
use crate::model::LanguageModel;
use crate::tokenizer::TokenCodec;
use chatgate_common::error::{ChatGateError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Byte-level tokenizer: id 0 is end-of-sequence, byte `b` is id `b + 1`
#[derive(Debug, Default)]
pub struct FakeTokenizer;

impl FakeTokenizer {
    pub const EOS: u32 = 0;

    pub fn new() -> Self {
        Self
    }
}

impl TokenCodec for FakeTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + 1).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                Self::EOS if skip_special_tokens => {}
                Self::EOS => bytes.extend_from_slice(b"<eos>"),
                1..=256 => bytes.push((id - 1) as u8),
                _ => return Err(ChatGateError::inference(format!("unknown token id {}", id))),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(Self::EOS)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(Self::EOS)
    }
}

/// Model that always continues with a fixed reply, then emits end-of-sequence
///
/// Tracks how many forward passes run at once so tests can check admission.
#[derive(Debug)]
pub struct FakeModel {
    reply: Vec<u32>,
    context_length: usize,
    step_delay: Duration,
    fail: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeModel {
    pub const REPLY: &'static str = " Nice to meet you.";

    pub fn new() -> Self {
        Self {
            reply: FakeTokenizer.encode(Self::REPLY).unwrap_or_default(),
            context_length: 1024,
            step_delay: Duration::ZERO,
            fail: false,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long in every forward pass
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Override the context window
    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    /// Make every forward pass fail
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Highest number of concurrent forward passes seen
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Forward passes run so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Length of the longest reply prefix the sequence currently ends with
    fn reply_progress(&self, tokens: &[u32]) -> usize {
        (1..=self.reply.len().min(tokens.len()))
            .rev()
            .find(|&k| tokens.ends_with(&self.reply[..k]))
            .unwrap_or(0)
    }
}

impl Default for FakeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageModel for FakeModel {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn vocab_size(&self) -> usize {
        257
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }

        let outcome = if self.fail {
            Err(ChatGateError::inference("fake model failure"))
        } else {
            let progress = self.reply_progress(tokens);
            let next = self.reply.get(progress).copied().unwrap_or(FakeTokenizer::EOS);
            let mut logits = vec![0.0; self.vocab_size()];
            logits[next as usize] = 10.0;
            Ok(logits)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Resource source backed by the fakes, with a load counter and a failure switch
#[derive(Debug)]
pub struct FakeSource {
    model: Arc<FakeModel>,
    load_delay: Duration,
    broken: AtomicBool,
    loads: AtomicUsize,
}

impl FakeSource {
    pub fn new(model: FakeModel) -> Self {
        Self {
            model: Arc::new(model),
            load_delay: Duration::ZERO,
            broken: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    /// Sleep this long in every load
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make loads fail (or succeed again)
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// Load executions so far, failed ones included
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// The model handed out by every successful load
    pub fn model(&self) -> &Arc<FakeModel> {
        &self.model
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new(FakeModel::new())
    }
}

impl ResourceSource for FakeSource {
    fn load(&self) -> Result<InferenceResource> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(ChatGateError::resource_load("tokenizer.json not found in /missing/Gpt-tokenizer"));
        }

        Ok(InferenceResource {
            tokenizer: Arc::new(FakeTokenizer::new()),
            model: Arc::clone(&self.model) as Arc<dyn LanguageModel>,
        })
    }

    fn describe(&self) -> String {
        "fake resource".to_string()
    }
}
