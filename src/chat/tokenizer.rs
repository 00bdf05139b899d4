// Chat tokenizer — text <-> token ids for the guard model's vocabulary.
//
// HfChatTokenizer wraps a HuggingFace `tokenizer.json`. The ChatML markers
// are added tokens in that vocabulary, so they encode to single ids when the
// rendered transcript is encoded without extra special tokens.

use std::path::Path;

use anyhow::{Context, Result};
use tokenizers::Tokenizer;
use tracing::debug;

use super::template::{IM_END, IM_START, USER_MARKER};

pub trait ChatTokenizer: Send + Sync {
    /// Encode already-rendered text. No BOS/EOS is added.
    fn encode_text(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text, optionally dropping special tokens.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Look up the id of a single vocabulary entry.
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

/// Ids of the three markers that delimit a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnMarkers {
    pub turn_start: u32,
    pub user_role: u32,
    pub turn_end: u32,
}

impl TurnMarkers {
    /// Resolve marker ids from the tokenizer's vocabulary.
    pub fn resolve(tokenizer: &dyn ChatTokenizer) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .with_context(|| format!("Tokenizer has no id for marker {token:?}"))
        };
        Ok(Self {
            turn_start: lookup(IM_START)?,
            user_role: lookup(USER_MARKER)?,
            turn_end: lookup(IM_END)?,
        })
    }
}

pub struct HfChatTokenizer {
    inner: Tokenizer,
}

impl HfChatTokenizer {
    /// Load `tokenizer.json` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            anyhow::bail!(
                "Tokenizer file not found: {}\nRun `guardstream download-model` to download it.",
                tokenizer_path.display()
            );
        }
        let inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        debug!("Loaded tokenizer from {}", tokenizer_path.display());
        Ok(Self { inner })
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}
