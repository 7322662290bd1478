use std::path::Path;

use tokenizers::Tokenizer;

use crate::models::PromptTokenizer;
use crate::{Error, Result};

pub const CONTEXT_LENGTH: usize = 77;
const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug)]
pub struct ClipTokenizer {
    inner: Tokenizer,
    /// Closes every prompt and pads it to the context length.
    end_id: u32,
}

impl ClipTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| Error::corrupt(path, format!("tokenizer: {e}")))?;
        Self::new(inner).map_err(|_| Error::corrupt(path, format!("tokenizer has no {END_OF_TEXT} token")))
    }

    fn new(inner: Tokenizer) -> Result<Self> {
        let end_id = inner
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| Error::InvalidInput(format!("tokenizer has no {END_OF_TEXT} token")))?;
        Ok(Self { inner, end_id })
    }
}

impl PromptTokenizer for ClipTokenizer {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(prompt, true)
            .map_err(|e| Error::InvalidInput(format!("cannot tokenize prompt: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > CONTEXT_LENGTH {
            tracing::warn!(tokens = ids.len(), "prompt truncated to {CONTEXT_LENGTH} tokens");
            ids.truncate(CONTEXT_LENGTH);
            ids[CONTEXT_LENGTH - 1] = self.end_id;
        }
        ids.resize(CONTEXT_LENGTH, self.end_id);
        Ok(ids)
    }
}
