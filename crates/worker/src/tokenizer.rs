//! HuggingFace tokenizer integration.
//!
//! Wraps the `tokenizers` crate behind [`TokenCodec`]. Loads `tokenizer.json`
//! from a tokenizer directory, or builds a byte-level BPE tokenizer from
//! `vocab.json` and `merges.txt` when only those are present. Pads on the left
//! and falls back to the end-of-sequence token when no padding token is defined.

use chatgate_common::error::{ChatGateError, Result};
use serde::Deserialize;
use std::path::Path;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::{AddedToken, PaddingDirection, PaddingParams};
use tracing::debug;

/// Well known end-of-sequence spellings, in lookup order
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<|end|>"];

/// Text to token id conversion used by the inference pipeline
pub trait TokenCodec: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// End-of-sequence token id, if the vocabulary has one
    fn eos_token_id(&self) -> Option<u32>;

    /// Padding token id, if any
    fn pad_token_id(&self) -> Option<u32>;
}

/// Special token names from `tokenizer_config.json`
#[derive(Debug, Default, Deserialize)]
pub struct SpecialTokens {
    #[serde(default)]
    eos_token: Option<TokenSpelling>,

    #[serde(default)]
    pad_token: Option<TokenSpelling>,
}

/// Special tokens appear either as a plain string or as an added-token object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenSpelling {
    Plain(String),
    Added { content: String },
}

impl TokenSpelling {
    fn as_str(&self) -> &str {
        match self {
            TokenSpelling::Plain(token) => token,
            TokenSpelling::Added { content } => content,
        }
    }
}

impl SpecialTokens {
    /// Read `tokenizer_config.json` from `dir`; absent file means no overrides
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join("tokenizer_config.json");
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ChatGateError::resource_load(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Wrapper around a HuggingFace tokenizer.
pub struct ChatTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl ChatTokenizer {
    /// Load a tokenizer from a directory
    ///
    /// Prefers `tokenizer.json`; otherwise expects the `vocab.json` and
    /// `merges.txt` pair of a byte-level BPE tokenizer.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let special = SpecialTokens::read(dir)?;

        let path = dir.join("tokenizer.json");
        let vocab = dir.join("vocab.json");
        let merges = dir.join("merges.txt");

        let inner = if path.exists() {
            tokenizers::Tokenizer::from_file(&path).map_err(|e| {
                ChatGateError::resource_load(format!("Failed to load tokenizer {}: {}", path.display(), e))
            })?
        } else if vocab.exists() && merges.exists() {
            debug!("No tokenizer.json in {}, building byte-level BPE", dir.display());
            byte_level_bpe(&vocab, &merges, &special)?
        } else {
            return Err(ChatGateError::resource_load(format!(
                "tokenizer.json (or vocab.json and merges.txt) not found in {}",
                dir.display()
            )));
        };

        Ok(Self::from_tokenizer(inner, &special))
    }

    /// Configure an already constructed tokenizer
    pub fn from_tokenizer(mut inner: tokenizers::Tokenizer, special: &SpecialTokens) -> Self {
        let lookup = |spelling: &Option<TokenSpelling>| {
            spelling.as_ref().and_then(|token| inner.token_to_id(token.as_str()))
        };

        let eos_token_id = lookup(&special.eos_token)
            .or_else(|| EOS_CANDIDATES.iter().find_map(|token| inner.token_to_id(token)));
        let pad_token_id = lookup(&special.pad_token).or(eos_token_id);

        if let Some(pad_id) = pad_token_id {
            let pad_token = inner.id_to_token(pad_id).unwrap_or_default();
            debug!("Padding on the left with {:?} ({})", pad_token, pad_id);
            inner.with_padding(Some(PaddingParams {
                direction: PaddingDirection::Left,
                pad_id,
                pad_token,
                ..Default::default()
            }));
        }

        Self {
            inner,
            eos_token_id,
            pad_token_id,
        }
    }

    /// Whether padding is applied on the left
    pub fn pads_left(&self) -> bool {
        matches!(
            self.inner.get_padding(),
            Some(PaddingParams {
                direction: PaddingDirection::Left,
                ..
            })
        )
    }

    /// Get the vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// GPT-2 style tokenizer from its vocabulary and merge rules
///
/// The end-of-sequence and padding spellings are registered as special tokens
/// so that decoding can skip them.
fn byte_level_bpe(vocab: &Path, merges: &Path, special: &SpecialTokens) -> Result<tokenizers::Tokenizer> {
    let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
        .build()
        .map_err(|e| {
            ChatGateError::resource_load(format!(
                "Failed to load BPE from {} and {}: {}",
                vocab.display(),
                merges.display(),
                e
            ))
        })?;

    let mut tokenizer = tokenizers::Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(ByteLevel::new(false, true, true));
    tokenizer.with_decoder(ByteLevel::default());

    let specials: Vec<AddedToken> = special
        .eos_token
        .iter()
        .chain(special.pad_token.iter())
        .map(TokenSpelling::as_str)
        .chain(EOS_CANDIDATES.iter().copied())
        .filter(|token| tokenizer.token_to_id(token).is_some())
        .map(|token| AddedToken::from(token, true))
        .collect();
    tokenizer.add_special_tokens(&specials);

    Ok(tokenizer)
}

impl TokenCodec for ChatTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ChatGateError::inference(format!("Tokenizer encode error: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ChatGateError::inference(format!("Tokenizer decode error: {}", e)))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}
