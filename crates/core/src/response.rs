use std::sync::Arc;

use tracing::warn;

use crate::error::Error;
use crate::request::{Request, RequestOutput, SequenceOutput, StreamDelta, Usage};
use crate::sequence::Sequence;
use crate::stopping::FinishReason;
use crate::tokenizer::Tokenizer;

/// Turns per-step sequence state into streamed deltas and final aggregated
/// responses. Owned by the scheduler and invoked on its thread.
pub struct ResponseHandler {
    tokenizer: Arc<dyn Tokenizer>,
}

impl ResponseHandler {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Stream the newest delta of one sequence, if any. Invoked after every
    /// step for streaming requests; a callback returning `false` cancels
    /// the sequence.
    pub fn on_sequence_stream(&self, request: &mut Request, seq_index: usize) {
        let sequence = &mut request.sequences[seq_index];
        let finished = sequence.is_finished();
        let finish_reason = sequence.finish_reason();
        let end = sequence.num_tokens();
        let text = match sequence.decode_delta(end, self.tokenizer.as_ref()) {
            Ok(text) => text,
            Err(e) => {
                warn!(seq_id = sequence.id(), "stream decode failed: {e}");
                return;
            }
        };
        if text.is_empty() && !finished {
            return;
        }

        let logprobs = sequence.drain_stream_logprobs();
        let Some(on_delta) = request.on_stream_delta.as_mut() else {
            return;
        };
        let keep_going = on_delta(
            seq_index,
            StreamDelta {
                text,
                finish_reason,
                logprobs,
            },
        );
        if !keep_going {
            request.sequences[seq_index].cancel();
        }
    }

    /// Fire the request's final callback. With an error status the outputs
    /// are empty; otherwise each sequence is decoded once more end to end.
    /// The sequences' blocks must already be released.
    pub fn on_request_finish(&self, mut request: Request, status: Option<Error>) {
        let usage = Usage {
            prompt_tokens: request.prompt_tokens.len(),
            generated_tokens: request
                .sequences
                .iter()
                .map(Sequence::num_generated_tokens)
                .sum(),
            total_tokens: request.prompt_tokens.len()
                + request
                    .sequences
                    .iter()
                    .map(Sequence::num_generated_tokens)
                    .sum::<usize>(),
        };

        let outputs = if status.is_none() {
            request
                .sequences
                .iter()
                .enumerate()
                .map(|(index, sequence)| self.sequence_output(index, sequence, request.echo))
                .collect()
        } else {
            Vec::new()
        };

        if let Some(on_final) = request.on_final.take() {
            on_final(RequestOutput {
                status,
                outputs,
                usage,
                finished: true,
            });
        }
    }

    fn sequence_output(&self, index: usize, sequence: &Sequence, echo: bool) -> SequenceOutput {
        let finish_reason = sequence.finish_reason();
        let generated = self.trimmed_generated(sequence);
        let mut text = match self.tokenizer.decode(generated, true) {
            Ok(text) => text,
            Err(e) => {
                warn!(seq_id = sequence.id(), "final decode failed: {e}");
                String::new()
            }
        };
        if echo {
            text = format!("{}{}", sequence.prompt(), text);
        }
        let logprobs = sequence
            .sampling_params()
            .logprobs
            .then(|| sequence.logprobs().to_vec());
        SequenceOutput {
            index,
            text,
            finish_reason,
            logprobs,
        }
    }

    /// Generated tokens with the matched stop token or stop sequence
    /// trimmed off, so clients never see the terminator text.
    fn trimmed_generated<'a>(&self, sequence: &'a Sequence) -> &'a [i32] {
        let num_prompt = sequence.num_prompt_tokens();
        let stopping = sequence.stopping_criteria();
        let tokens = &sequence.token_ids()[num_prompt..];
        if sequence.finish_reason() != FinishReason::Stop {
            return tokens;
        }
        let Some(&last) = tokens.last() else {
            return tokens;
        };
        if (!stopping.ignore_eos && last == stopping.eos_token_id)
            || stopping.stop_token_ids.contains(&last)
        {
            return &tokens[..tokens.len() - 1];
        }
        for stop_sequence in &stopping.stop_sequences {
            if stop_sequence.last() == Some(&last) && tokens.ends_with(stop_sequence) {
                return &tokens[..tokens.len() - stop_sequence.len()];
            }
        }
        tokens
    }
}
