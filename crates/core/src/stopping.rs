use std::collections::HashSet;

/// Why a sequence stopped generating. `None` means it is still running (or,
/// on a final response, that the request was cancelled before it finished).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    None,
    /// Hit the eos token, a stop token, or a stop token-sequence.
    Stop,
    /// Generated `max_tokens` tokens or ran into the context length limit.
    Length,
    /// Reserved for tool-call detection.
    FunctionCall,
}

impl FinishReason {
    pub fn is_finished(self) -> bool {
        self != FinishReason::None
    }
}

/// Per-request stopping rules, shared by all sibling sequences.
#[derive(Debug, Clone, Default)]
pub struct StoppingCriteria {
    /// Maximum number of generated tokens. 0 means no explicit limit.
    pub max_tokens: usize,
    /// Maximum total context length (prompt + generated). 0 disables.
    pub max_context_len: usize,
    pub eos_token_id: i32,
    pub ignore_eos: bool,
    pub stop_token_ids: HashSet<i32>,
    /// Token-id sequences that terminate generation when the output ends
    /// with one of them.
    pub stop_sequences: Vec<Vec<i32>>,
}

impl StoppingCriteria {
    /// Check the sequence ending at `token_ids.last()` against all rules.
    pub fn check_finished(&self, token_ids: &[i32], num_prompt_tokens: usize) -> FinishReason {
        let Some(&last) = token_ids.last() else {
            return FinishReason::None;
        };

        if !self.ignore_eos && last == self.eos_token_id {
            return FinishReason::Stop;
        }
        if self.stop_token_ids.contains(&last) {
            return FinishReason::Stop;
        }
        for stop_sequence in &self.stop_sequences {
            // cheap last-token filter before the suffix comparison
            if stop_sequence.last() == Some(&last) && token_ids.ends_with(stop_sequence) {
                return FinishReason::Stop;
            }
        }

        let num_generated = token_ids.len().saturating_sub(num_prompt_tokens);
        if self.max_tokens > 0 && num_generated >= self.max_tokens {
            return FinishReason::Length;
        }
        if self.max_context_len > 0 && token_ids.len() >= self.max_context_len {
            return FinishReason::Length;
        }
        FinishReason::None
    }
}
