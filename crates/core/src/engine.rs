use crate::batch::ModelInput;

/// Sampled output for one sequence in the batch.
///
/// `token_ids` holds the next sampled token for normal decoding, or the
/// target model's accepted-token list for speculative validation (where the
/// final entry is the bonus token or -1). It is empty for a sequence whose
/// prompt was only partially processed this step, so there were no logits
/// to sample from.
#[derive(Debug, Clone, Default)]
pub struct SampleOutput {
    pub token_ids: Vec<i64>,
    /// Logprob of each sampled token, when requested.
    pub logprobs: Option<Vec<f32>>,
    /// Top-k alternative ids per sampled token, when requested.
    pub top_tokens: Option<Vec<Vec<i32>>>,
    pub top_logprobs: Option<Vec<Vec<f32>>>,
}

/// One forward pass worth of outputs, parallel to the batch's sequences.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    pub sample_outputs: Vec<SampleOutput>,
}

/// The model execution contract the scheduler drives. Implementations own
/// the device workers and the actual forward pass; the scheduler only hands
/// them a packed [`ModelInput`] and consumes sampled token ids.
pub trait Engine: Send {
    fn execute_model(&mut self, input: &ModelInput) -> anyhow::Result<ModelOutput>;
}

impl Engine for Box<dyn Engine> {
    fn execute_model(&mut self, input: &ModelInput) -> anyhow::Result<ModelOutput> {
        (**self).execute_model(input)
    }
}
