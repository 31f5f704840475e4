use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Error;
use crate::sampling::SamplingParams;
use crate::sequence::{LogProb, Sequence};
use crate::stopping::{FinishReason, StoppingCriteria};

pub type RequestId = u64;

/// Scheduling priority. Higher priorities are admitted first; within a
/// priority level requests run first-come-first-served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Rank for heap ordering; larger means scheduled earlier.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// One streamed increment of a sequence's output.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    pub text: String,
    /// [`FinishReason::None`] while the sequence is still running.
    pub finish_reason: FinishReason,
    /// Logprob entries for the tokens covered by this delta.
    pub logprobs: Vec<LogProb>,
}

/// Final output of one sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    pub index: usize,
    pub text: String,
    pub finish_reason: FinishReason,
    pub logprobs: Option<Vec<LogProb>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_tokens: usize,
}

/// Aggregated final response for a request.
#[derive(Debug, Clone)]
pub struct RequestOutput {
    /// `None` on success; otherwise the error that terminated the request
    /// (and `outputs` is empty).
    pub status: Option<Error>,
    pub outputs: Vec<SequenceOutput>,
    pub usage: Usage,
    pub finished: bool,
}

/// Streamed-delta callback: `(sequence_index, delta) -> keep_going`.
/// Returning `false` cancels the sequence.
pub type OnStreamDelta = Box<dyn FnMut(usize, StreamDelta) -> bool + Send>;

/// Final-output callback, fired exactly once per request.
pub type OnFinal = Box<dyn FnOnce(RequestOutput) + Send>;

/// Transport liveness probe; returning `false` cancels the request.
pub type RpcProbe = Box<dyn Fn() -> bool + Send>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One client submission: one or more sibling sequences sharing a prompt,
/// the shared sampling/stopping parameters, and the output callbacks.
pub struct Request {
    pub id: RequestId,
    pub prompt: Arc<str>,
    pub prompt_tokens: Vec<i32>,
    pub sampling_params: Arc<SamplingParams>,
    pub stopping_criteria: Arc<StoppingCriteria>,
    pub priority: Priority,
    /// Stream deltas as they are produced instead of only the final output.
    pub stream: bool,
    /// Stream the prompt text back before the generated output.
    pub echo: bool,
    /// Number of sibling sequences to generate.
    pub num_seqs: usize,
    /// Token-buffer capacity per sequence; sized by the scheduler on
    /// admission to cover the prompt, the generation budget, and the
    /// speculative slack.
    pub seq_capacity: usize,
    pub created_time: Instant,
    pub sequences: Vec<Sequence>,
    pub on_stream_delta: Option<OnStreamDelta>,
    pub on_final: Option<OnFinal>,
    pub is_rpc_ok: Option<RpcProbe>,
    /// Admission order; preemption victims keep it so they cannot starve.
    pub(crate) arrival: u64,
}

impl Request {
    pub fn new(
        prompt: impl Into<Arc<str>>,
        prompt_tokens: Vec<i32>,
        sampling_params: SamplingParams,
        stopping_criteria: StoppingCriteria,
    ) -> Self {
        let seq_capacity = prompt_tokens.len() + stopping_criteria.max_tokens.max(1);
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            prompt: prompt.into(),
            prompt_tokens,
            sampling_params: Arc::new(sampling_params),
            stopping_criteria: Arc::new(stopping_criteria),
            priority: Priority::default(),
            stream: false,
            echo: false,
            num_seqs: 1,
            seq_capacity,
            created_time: Instant::now(),
            sequences: Vec::new(),
            on_stream_delta: None,
            on_final: None,
            is_rpc_ok: None,
            arrival: 0,
        }
    }

    pub fn add_sequence(&mut self) {
        self.sequences.push(Sequence::new(
            Arc::clone(&self.prompt),
            &self.prompt_tokens,
            self.seq_capacity,
            Arc::clone(&self.sampling_params),
            Arc::clone(&self.stopping_criteria),
            self.echo,
        ));
    }

    /// A request is finished when it has all `num_seqs` sequences and every
    /// one of them is finished.
    pub fn is_finished(&mut self) -> bool {
        if self.sequences.len() < self.num_seqs {
            return false;
        }
        self.sequences.iter_mut().all(|seq| seq.is_finished())
    }

    /// Cancelled when the transport died or any sequence was cancelled.
    pub fn is_cancelled(&self) -> bool {
        if let Some(probe) = &self.is_rpc_ok {
            if !probe() {
                return true;
            }
        }
        self.sequences.iter().any(|seq| seq.is_cancelled())
    }

    /// Sibling sequences are only added once the first sequence has its
    /// whole prompt in the kv cache, so they can share the prefix instead
    /// of prefilling it again.
    pub fn should_expand_sequences(&self) -> bool {
        if self.sequences.len() >= self.num_seqs {
            return false;
        }
        let first = self.sequences.first().expect("request has no sequences");
        first.num_kv_cache_tokens() >= first.num_prompt_tokens()
    }

    pub fn expand_sequences(&mut self) {
        while self.sequences.len() < self.num_seqs {
            self.add_sequence();
        }
    }
}
