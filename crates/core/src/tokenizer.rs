use std::path::Path;

/// The tokenizer surface the scheduler consumes. Implementations live
/// outside the core; a trailing U+FFFD in decoded text signals a partial
/// multi-byte glyph that later tokens will complete.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<i32>>;

    fn decode(&self, token_ids: &[i32], skip_special_tokens: bool) -> anyhow::Result<String>;

    fn vocab_size(&self) -> u32;
}

/// Adapter over a HuggingFace `tokenizers` tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<i32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i32).collect())
    }

    fn decode(&self, token_ids: &[i32], skip_special_tokens: bool) -> anyhow::Result<String> {
        let ids: Vec<u32> = token_ids.iter().map(|&id| id as u32).collect();
        self.inner
            .decode(&ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    fn vocab_size(&self) -> u32 {
        self.inner.get_vocab_size(true) as u32
    }
}

/// Whitespace word-level tokenizer for tests: token id `n` decodes to the
/// literal `t<n>`, and decoded tokens are joined with single spaces.
#[cfg(any(test, feature = "test-utils"))]
pub struct TestTokenizer {
    vocab_size: u32,
    /// Token that decodes to a lone replacement character, to exercise the
    /// partial-glyph hold-back path.
    partial_token: Option<i32>,
}

#[cfg(any(test, feature = "test-utils"))]
impl TestTokenizer {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size,
            partial_token: None,
        }
    }

    pub fn with_partial_token(vocab_size: u32, partial_token: i32) -> Self {
        Self {
            vocab_size,
            partial_token: Some(partial_token),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Tokenizer for TestTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<i32>> {
        text.split_whitespace()
            .map(|word| {
                word.strip_prefix('t')
                    .and_then(|n| n.parse::<i32>().ok())
                    .ok_or_else(|| anyhow::anyhow!("unknown token: {word}"))
            })
            .collect()
    }

    fn decode(&self, token_ids: &[i32], _skip_special_tokens: bool) -> anyhow::Result<String> {
        let words: Vec<String> = token_ids
            .iter()
            .map(|&id| {
                if self.partial_token == Some(id) {
                    "\u{FFFD}".to_string()
                } else {
                    format!("t{id}")
                }
            })
            .collect();
        Ok(words.join(" "))
    }

    fn vocab_size(&self) -> u32 {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer_round_trip() {
        let tokenizer = TestTokenizer::new(100);
        let ids = tokenizer.encode("t1 t2 t42").unwrap();
        assert_eq!(ids, vec![1, 2, 42]);
        let text = tokenizer.decode(&ids, true).unwrap();
        assert_eq!(text, "t1 t2 t42");
    }

    #[test]
    fn test_tokenizer_partial_token_emits_replacement_char() {
        let tokenizer = TestTokenizer::with_partial_token(100, 7);
        let text = tokenizer.decode(&[1, 7], true).unwrap();
        assert!(text.ends_with('\u{FFFD}'));
    }

    #[test]
    fn test_tokenizer_rejects_unknown_words() {
        let tokenizer = TestTokenizer::new(100);
        assert!(tokenizer.encode("hello").is_err());
    }
}
