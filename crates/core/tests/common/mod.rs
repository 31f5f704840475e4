#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use infera_core::batch::ModelInput;
use infera_core::engine::{Engine, ModelOutput, SampleOutput};
use infera_core::request::{Request, RequestOutput};
use infera_core::sampling::SamplingParams;
use infera_core::scheduler::Scheduler;
use infera_core::stopping::StoppingCriteria;
use infera_core::tokenizer::Tokenizer;

/// Whitespace tokenizer: token id `n` maps to the literal word `t<n>`.
pub struct SplitTokenizer;

impl Tokenizer for SplitTokenizer {
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
        Ok(token_ids
            .iter()
            .map(|id| format!("t{id}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn vocab_size(&self) -> u32 {
        32_000
    }
}

/// Deterministic engine double: samples one token per sequence that reaches
/// its final position, either from a fixed script or by counting up.
pub struct MockEngine {
    script: Option<VecDeque<i64>>,
    next: i64,
    pub calls: usize,
    fail_on: Option<usize>,
}

impl MockEngine {
    /// Samples `start`, `start + 1`, `start + 2`, ... across the batch.
    pub fn sequential(start: i64) -> Self {
        Self {
            script: None,
            next: start,
            calls: 0,
            fail_on: None,
        }
    }

    /// Samples the given tokens in order; falls back to 0 when exhausted.
    pub fn scripted(tokens: &[i64]) -> Self {
        Self {
            script: Some(tokens.iter().copied().collect()),
            next: 0,
            calls: 0,
            fail_on: None,
        }
    }

    /// Fail the `call`-th forward pass (1-based).
    pub fn fail_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    fn sample(&mut self) -> i64 {
        match self.script.as_mut() {
            Some(script) => script.pop_front().unwrap_or(0),
            None => {
                let token = self.next;
                self.next += 1;
                token
            }
        }
    }
}

impl Engine for MockEngine {
    fn execute_model(&mut self, input: &ModelInput) -> anyhow::Result<ModelOutput> {
        self.calls += 1;
        if self.fail_on == Some(self.calls) {
            anyhow::bail!("injected forward-pass failure");
        }
        let mut sample_outputs = Vec::with_capacity(input.num_sequences);
        for i in 0..input.num_sequences {
            if input.samples_sequence(i) {
                sample_outputs.push(SampleOutput {
                    token_ids: vec![self.sample()],
                    ..Default::default()
                });
            } else {
                // mid-prompt chunk: nothing to sample yet
                sample_outputs.push(SampleOutput::default());
            }
        }
        Ok(ModelOutput { sample_outputs })
    }
}

pub type SharedOutput = Arc<Mutex<Option<RequestOutput>>>;

/// Wire a capture slot into the request's final callback.
pub fn capture_final(request: &mut Request) -> SharedOutput {
    let slot: SharedOutput = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    request.on_final = Some(Box::new(move |output| {
        *sink.lock().unwrap() = Some(output);
    }));
    slot
}

pub fn take(slot: &SharedOutput) -> Option<RequestOutput> {
    slot.lock().unwrap().take()
}

pub fn make_request(prompt_tokens: Vec<i32>, max_tokens: usize) -> Request {
    let stopping = StoppingCriteria {
        max_tokens,
        eos_token_id: 2,
        ..Default::default()
    };
    Request::new("", prompt_tokens, SamplingParams::default(), stopping)
}

/// Step the scheduler until `done` reports true, bounded to catch hangs.
pub fn run_until<E: Engine>(
    scheduler: &mut Scheduler<E>,
    max_steps: usize,
    mut done: impl FnMut() -> bool,
) {
    for _ in 0..max_steps {
        if done() {
            return;
        }
        scheduler.step(Duration::from_millis(5));
    }
    assert!(done(), "scheduler did not converge in {max_steps} steps");
}
