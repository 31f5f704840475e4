use serde::Deserialize;

/// Parameters controlling token sampling behavior.
///
/// The scheduler does not run the sampler itself; these are packed into the
/// model input so the engine can apply them at the last-token positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy, higher = more random.
    pub temperature: f32,
    /// Nucleus sampling threshold (0..1). 1.0 = disabled.
    pub top_p: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: u32,
    /// Penalty for repeated tokens. 1.0 = none, >1.0 discourages repeats.
    pub repetition_penalty: f32,
    /// Frequency penalty (OpenAI convention), applied per occurrence count.
    pub frequency_penalty: f32,
    /// Presence penalty (OpenAI convention), applied once per seen token.
    pub presence_penalty: f32,
    /// Return the sampled token's logprob with each output token.
    pub logprobs: bool,
    /// Number of top-logprob alternatives to return. 0 = disabled.
    pub top_logprobs: u32,
    /// Optional seed for deterministic sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logprobs: false,
            top_logprobs: 0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }

    /// Whether the engine needs the per-sequence token occurrence counts.
    pub fn needs_token_counts(&self) -> bool {
        self.repetition_penalty != 1.0
            || self.frequency_penalty != 0.0
            || self.presence_penalty != 0.0
    }
}
